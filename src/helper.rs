use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{AttachParams, Execute};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error as OperatorError;

#[derive(Debug, Default, Clone)]
pub struct CmdBuilder {
    buf: Vec<String>,
}

impl CmdBuilder {
    pub fn new(bin: impl ToString) -> Self {
        let buf = vec![bin.to_string()];
        Self { buf }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.buf.push(arg.to_string());
        self
    }

    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.buf.extend(args.into_iter().map(|arg| arg.to_string()));
        self
    }

    /// Pushes `name value` for every value, e.g. `-m a -m b`.
    pub fn repeated_arg<I, T>(self, name: impl ToString, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let name = name.to_string();
        values
            .into_iter()
            .fold(self, |cmd, value| cmd.arg(&name).arg(value))
    }

    pub fn collect(self) -> Vec<String> {
        self.buf
    }
}

pub trait ResourceExt {
    fn namespace_any(&self) -> String;
    fn annotation(&self, key: &str) -> Option<&str>;
}

impl<K> ResourceExt for K
where
    K: Resource,
{
    fn namespace_any(&self) -> String {
        self.meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }
}

/// Lowercases and replaces spaces and underscores with dashes, so principal
/// names can be used in labels and object names.
pub fn slugify(value: &str) -> String {
    value.to_lowercase().replace([' ', '_'], "-")
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to join attached process: {0}")]
    Kube(#[from] kube::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("non-success exit status: {0}, out: {1}")]
    Exit(i32, String),
    #[error("unknown-success exit status: {0}, out: {1}")]
    UnknownStatus(i32, String),
    #[error("attached process did not report a status")]
    MissingStatus,
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut buf = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
pub trait ExecuteExt {
    async fn exec_with_output<I, T>(
        &self,
        name: &str,
        container: &str,
        command: I,
    ) -> Result<String, ExecError>
    where
        I: IntoIterator<Item = T> + Debug + Send + Sync + 'static,
        T: Into<String>;
}

#[async_trait]
impl<K> ExecuteExt for Api<K>
where
    K: Resource + Execute + Clone + DeserializeOwned + Send + Sync + 'static,
{
    async fn exec_with_output<I, T>(
        &self,
        name: &str,
        container: &str,
        command: I,
    ) -> Result<String, ExecError>
    where
        I: IntoIterator<Item = T> + Debug + Send + Sync + 'static,
        T: Into<String>,
    {
        let attach_params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = self.exec(name, command, &attach_params).await?;

        let status = process.take_status().ok_or(ExecError::MissingStatus)?;
        let (stdout, stderr) = tokio::try_join!(
            read_all(process.stdout()),
            read_all(process.stderr())
        )?;

        let Some(output) = status.await else {
            return Err(ExecError::MissingStatus);
        };

        match output.status.as_deref() {
            Some("Success") => Ok(stdout),

            Some("Failure") => Err(ExecError::Exit(output.code.unwrap_or_default(), stderr)),

            _ => Err(ExecError::UnknownStatus(
                output.code.unwrap_or_default(),
                output
                    .message
                    .unwrap_or_else(|| "unknown kube response status".into()),
            )),
        }
    }
}

/// Runs `check` every `interval` until it yields a value.
///
/// `max_attempts` of `None` polls forever; errors returned by `check` end the
/// poll immediately.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    max_attempts: Option<u32>,
    what: &str,
    mut check: F,
) -> Result<T, OperatorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, OperatorError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        if max_attempts.is_some_and(|max| attempts >= max) {
            return Err(OperatorError::temporary(format!(
                "gave up waiting for {what} after {attempts} attempts"
            )));
        }

        tracing::trace!({ attempts }, "still waiting for {what}");
        tokio::time::sleep(interval).await;
    }
}
