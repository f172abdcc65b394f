use std::path::PathBuf;

use async_trait::async_trait;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the directory CLI with `args`, with `env` added to the environment.
    async fn run(&self, env: &[(String, String)], args: Vec<String>)
    -> std::io::Result<CommandOutput>;
}

/// Spawns the real `kanidm` binary.
#[derive(Debug, Clone)]
pub struct Subprocess {
    program: PathBuf,
}

impl Subprocess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self { program }
    }
}

#[async_trait]
impl CommandRunner for Subprocess {
    async fn run(
        &self,
        env: &[(String, String)],
        args: Vec<String>,
    ) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .envs(env.iter().map(|(key, value)| (key, value)))
            .kill_on_drop(true)
            .output()
            .await?;

        // terminated by a signal
        let code = output.status.code().unwrap_or(-1);

        Ok(CommandOutput {
            code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
