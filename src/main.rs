use std::error::Error as StdError;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) mod cli;
pub(crate) mod cluster;
pub(crate) mod crds;
pub(crate) mod deployer;
pub(crate) mod directory;
pub(crate) mod handlers;
pub(crate) mod helper;
#[cfg(test)]
pub(crate) mod testing;

use crds::*;

use crate::cli::Subprocess;
use crate::deployer::DeployError;
use crate::handlers::{Context, OperatorConfig, error_policy, reconcile};
use crate::helper::ExecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Temporary { message: String, delay: Duration },
    #[error("{0}")]
    Permanent(String),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("exec error: {0}")]
    Exec(#[from] ExecError),
    #[error("deploy error: {0}")]
    Deploy(#[from] DeployError),
}

impl Error {
    /// Requeue delay for failures that are expected to clear up on their own.
    pub const RETRY_DELAY: Duration = Duration::from_secs(10);

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::Temporary {
            message: message.into(),
            delay: Self::RETRY_DELAY,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// When to try again, `None` if the declared spec has to change first.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Temporary { delay, .. } => Some(*delay),
            Self::Permanent(_) => None,
            Self::Deploy(err) if err.is_permanent() => None,
            _ => Some(Self::RETRY_DELAY),
        }
    }
}

#[derive(Parser)]
#[command(name = "kanidm-operator")]
#[command(about = "Kubernetes operator for the Kanidm identity server")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the custom resource definitions as a YAML stream
    Crd,
    Run {
        /// kanidm CLI used for directory operations
        #[arg(long, env = "KANIDM_BIN", default_value = "kanidm")]
        kanidm_bin: String,

        /// seconds between checks while waiting for an instance pod
        #[arg(long, env = "POD_POLL_INTERVAL", default_value_t = 5)]
        pod_poll_interval: u64,

        /// give up waiting for an instance pod after this many checks
        #[arg(long, env = "POD_POLL_ATTEMPTS")]
        pod_poll_attempts: Option<u32>,

        /// seconds to wait before retrying account recovery on a booting instance
        #[arg(long, env = "RECOVERY_BACKOFF", default_value_t = 2)]
        recovery_backoff: u64,
    },
}

fn print_crds() -> Result<(), Error> {
    let crds = [Kanidm::crd(), User::crd(), Group::crd(), OAuth2Client::crd()];
    let mut stdout = std::io::stdout().lock();
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|err| Error::permanent(format!("failed to serialize crd: {err}")))?;
        writeln!(stdout, "---\n{yaml}")?;
    }
    Ok(())
}

async fn run(client: Client, ctx: Arc<Context>) {
    macro_rules! controller {
        ($kind:ty) => {
            Controller::new(Api::<$kind>::all(client.clone()), WatcherConfig::default())
                .shutdown_on_signal()
                .run(reconcile::<$kind>, error_policy::<$kind>, ctx.clone())
                .for_each(|result| async move {
                    match result {
                        Ok((object, action)) => {
                            tracing::debug!({ object = %object, ?action }, "reconciled");
                        }
                        Err(err) => {
                            tracing::error!(
                                { kind = stringify!($kind), err = &err as &dyn StdError },
                                "reconciliation error"
                            );
                        }
                    }
                })
        };
    }

    tracing::info!("starting kanidm, user, group and oauth2 client controllers");

    tokio::join!(
        controller!(Kanidm),
        controller!(User),
        controller!(Group),
        controller!(OAuth2Client),
    );
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .map_err(|err| Error::permanent(format!("failed to install tracing subscriber: {err}")))?;

    match opts.command {
        Command::Crd => print_crds()?,

        Command::Run {
            kanidm_bin,
            pod_poll_interval,
            pod_poll_attempts,
            recovery_backoff,
        } => {
            let client = Client::try_default().await?;
            let config = OperatorConfig {
                pod_poll_interval: Duration::from_secs(pod_poll_interval),
                pod_poll_attempts,
                recovery_backoff: Duration::from_secs(recovery_backoff),
            };
            let ctx = Arc::new(Context {
                cluster: Arc::new(client.clone()),
                cli: Arc::new(Subprocess::new(kanidm_bin)),
                config,
            });

            run(client, ctx).await
        }
    };

    Ok(())
}
