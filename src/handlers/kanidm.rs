use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::crds::kanidm::BootstrapStep;
use crate::deployer::Deployer;
use crate::helper::{CmdBuilder, poll_until, slugify};

use super::*;

const CONTAINER: &str = "kanidm";
const ADMIN: &str = "admin";

/// `kanidmd` mixes log lines into its output, the credential is the one
/// flat JSON object in there.
static RECOVERY_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{["a-zA-Z0-9:]*\}"#).expect("recovery pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Ready(String),
    /// the server is still booting and printed no credential
    NotReady,
}

#[derive(Deserialize)]
struct RecoveredAccount {
    password: String,
}

pub fn parse_recovery_output(output: &str) -> Result<Recovery, Error> {
    let Some(found) = RECOVERY_JSON.find(output) else {
        return Ok(Recovery::NotReady);
    };

    serde_json::from_str::<RecoveredAccount>(found.as_str())
        .map(|account| Recovery::Ready(account.password))
        .map_err(|err| Error::temporary(format!("unexpected recover-account output: {err}")))
}

impl Kanidm {
    fn pod_selector(&self) -> String {
        format!(
            "app.kubernetes.io/name=kanidm,app.kubernetes.io/instance={}",
            self.name_any()
        )
    }

    fn credentials_selector(&self, principal: &str) -> String {
        format!(
            "app.kubernetes.io/instance={},{CREDENTIALS_LABEL}={}",
            self.name_any(),
            slugify(principal)
        )
    }
}

struct Bootstrap<'a> {
    ctx: &'a Context,
    kanidm: &'a Kanidm,
    name: String,
    namespace: String,
    step: Option<BootstrapStep>,
}

impl<'a> Bootstrap<'a> {
    fn new(ctx: &'a Context, kanidm: &'a Kanidm) -> Self {
        Self {
            ctx,
            kanidm,
            name: kanidm.name_any(),
            namespace: kanidm.namespace_any(),
            step: None,
        }
    }

    /// Records `step` in the status, once per transition.
    async fn enter(&mut self, step: BootstrapStep) -> Result<(), Error> {
        if self.step == Some(step) {
            return Ok(());
        }

        tracing::info!({ kanidm = &self.name, namespace = &self.namespace, ?step }, "bootstrap step");
        self.step = Some(step);
        patch_status(self.ctx, self.kanidm, json!({ "step": step, "message": null })).await
    }

    async fn render_infra(&mut self, deployer: &Deployer<'_>) -> Result<(), Error> {
        self.enter(BootstrapStep::RenderInfra).await?;
        let kanidm = self.kanidm;
        let spec = &kanidm.spec;

        deployer
            .deploy(
                "certificate.yaml",
                json!({
                    "hostname": spec.domain,
                    "certificate_issuer": spec.certificate.issuer,
                }),
            )
            .await?;

        deployer
            .deploy(
                "pvc.yaml",
                json!({
                    "claim": "backups",
                    "storage_class": spec.backup.storage_class,
                    "storage_size": spec.backup.storage_size,
                    "storage_annotations": spec.backup.storage_annotations,
                }),
            )
            .await?;

        deployer
            .deploy(
                "pvc.yaml",
                json!({
                    "claim": "db",
                    "storage_class": spec.database.storage_class,
                    "storage_size": spec.database.storage_size,
                    "storage_annotations": spec.database.storage_annotations,
                }),
            )
            .await?;

        deployer
            .deploy(
                "service.yaml",
                json!({ "http_port": spec.web_port, "ldap_port": spec.ldap_port }),
            )
            .await?;

        deployer
            .deploy(
                "server-config.yaml",
                json!({
                    "domain": spec.domain,
                    "log_level": spec.log_level,
                    "http_port": spec.web_port,
                    "ldap_port": spec.ldap_port,
                    "database_fs_type": spec.database.fs_type,
                    "database_arc_size": spec.database.arc_size,
                    "role": "WriteReplica",
                    "trust_x_forwarded_for": spec.ingress.trust_x_forwarded_for,
                    "backup_enabled": spec.backup.enabled,
                    "backup_schedule": spec.backup.schedule,
                    "backup_versions": spec.backup.versions,
                }),
            )
            .await?;

        deployer
            .deploy(
                "deployment.yaml",
                json!({
                    "image": kanidm.image(),
                    "http_port": spec.web_port,
                    "ldap_port": spec.ldap_port,
                }),
            )
            .await?;

        if spec.ingress.enabled {
            deployer
                .deploy(
                    "ingress.yaml",
                    json!({
                        "hostname": spec.domain,
                        "http_port": spec.web_port,
                        "annotations": spec.ingress.annotations,
                        "class_name": spec.ingress.class_name,
                    }),
                )
                .await?;
        }

        tracing::info!({ kanidm = &self.name }, "all resources deployed, waiting for the pod");
        Ok(())
    }

    /// Waits for a running instance pod and returns its name.
    async fn wait_for_pod(&mut self) -> Result<String, Error> {
        let ctx = self.ctx;
        let cluster = ctx.cluster.as_ref();
        let selector = self.kanidm.pod_selector();
        let selector = selector.as_str();

        self.enter(BootstrapStep::WaitPodCreated).await?;
        let namespace = self.namespace.as_str();
        poll_until(
            ctx.config.pod_poll_interval,
            ctx.config.pod_poll_attempts,
            "instance pod to be created",
            || async move {
                let pods = cluster.list_pods(namespace, selector).await?;
                Ok::<_, Error>((!pods.is_empty()).then_some(()))
            },
        )
        .await?;

        self.enter(BootstrapStep::WaitPodRunning).await?;
        let (name, namespace) = (self.name.as_str(), self.namespace.as_str());
        poll_until(
            ctx.config.pod_poll_interval,
            ctx.config.pod_poll_attempts,
            "instance pod to be running",
            || async move {
                let pods = cluster.list_pods(namespace, selector).await?;
                if pods.len() > 1 {
                    tracing::warn!(
                        { kanidm = name, pods = pods.len() },
                        "more than one instance pod, using the first running one"
                    );
                }
                let running = pods.into_iter().find(|pod| {
                    pod.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Running")
                });
                Ok::<_, Error>(running.map(|pod| pod.name_any()))
            },
        )
        .await
    }

    /// Resets the password of `principal`, `None` while the server is not ready.
    async fn recover(&self, pod: &str, principal: &str) -> Result<Option<String>, Error> {
        let command = CmdBuilder::new("kanidmd")
            .args(["recover-account", "-o", "json", principal])
            .collect();

        let output = match self
            .ctx
            .cluster
            .exec(&self.namespace, pod, CONTAINER, command)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(
                    { kanidm = &self.name, pod, principal, err = &err as &dyn StdError },
                    "recover-account failed, retrying"
                );
                return Ok(None);
            }
        };

        match parse_recovery_output(&output)? {
            Recovery::Ready(password) => Ok(Some(password)),
            Recovery::NotReady => {
                tracing::info!(
                    { kanidm = &self.name, principal },
                    "no credential in recover-account output, perhaps the server is still booting"
                );
                Ok(None)
            }
        }
    }

    /// Whether both credential secrets of this instance were already persisted.
    async fn has_credentials(&self) -> Result<bool, Error> {
        for principal in [ADMIN, IDM_ADMIN] {
            let selector = self.kanidm.credentials_selector(principal);
            let secrets = self.ctx.cluster.list_secrets(&self.namespace, &selector).await?;
            if secrets.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Recovers `admin` then `idm_admin`; `None` when either was not ready.
    async fn recover_passwords(&mut self, pod: &str) -> Result<Option<(String, String)>, Error> {
        self.enter(BootstrapStep::RecoverAdminPassword).await?;
        let Some(admin) = self.recover(pod, ADMIN).await? else {
            return Ok(None);
        };

        self.enter(BootstrapStep::RecoverIdmAdminPassword).await?;
        let Some(idm_admin) = self.recover(pod, IDM_ADMIN).await? else {
            return Ok(None);
        };

        Ok(Some((admin, idm_admin)))
    }

    async fn run(mut self) -> Result<(), Error> {
        let (ctx, kanidm) = (self.ctx, self.kanidm);
        let deployer = Deployer::new(
            ctx.cluster.as_ref(),
            kanidm,
            Some(kanidm.spec.version.as_str()),
        )?;

        self.render_infra(&deployer).await?;

        // a second recovery rotates the passwords directory sessions log in with
        if self.has_credentials().await? {
            tracing::info!({ kanidm = &self.name }, "credentials already persisted, skipping recovery");
            return self.enter(BootstrapStep::Done).await;
        }

        let (admin, idm_admin) = loop {
            let pod = self.wait_for_pod().await?;
            if let Some(passwords) = self.recover_passwords(&pod).await? {
                break passwords;
            }
            tokio::time::sleep(ctx.config.recovery_backoff).await;
        };

        self.enter(BootstrapStep::PersistSecrets).await?;
        for (username, password) in [(ADMIN, admin), (IDM_ADMIN, idm_admin)] {
            deployer
                .deploy(
                    "usersecret.yaml",
                    json!({ "username": username, "password": password }),
                )
                .await?;
        }

        self.enter(BootstrapStep::Done).await?;
        tracing::info!({ kanidm = &self.name, namespace = &self.namespace }, "instance bootstrapped");
        Ok(())
    }
}

#[async_trait]
impl Reconcile for Kanidm {
    // generated resources are owned by the instance and garbage collected
    const FINALIZER: Option<&'static str> = None;

    async fn apply(&self, ctx: &Context) -> Result<(), Error> {
        if self.annotation(PROCESSED_ANNOTATION) == Some("true") {
            tracing::debug!(
                { kanidm = %self.name_any() },
                "instance already bootstrapped, ignoring update"
            );
            return Ok(());
        }

        let step = self.status.as_ref().and_then(|status| status.step);
        if step == Some(BootstrapStep::Done) {
            tracing::debug!(
                { kanidm = %self.name_any() },
                "bootstrap already finished, ignoring update"
            );
            return Ok(());
        }

        if self.spec.high_availability.enabled {
            return Err(Error::permanent(
                "high availability deployments are not supported yet",
            ));
        }

        Bootstrap::new(ctx, self).run().await
    }
}
