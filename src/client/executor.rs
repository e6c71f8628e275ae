use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::{Error, Result};

/// Runs a program to completion and hands back its stdout.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Spawns real subprocesses.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    #[instrument(skip(self, args))]
    async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::command(program, args, format!("failed to start: {e}")))?;

        if !output.status.success() {
            return Err(Error::command(
                program,
                args,
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl<E: CommandExecutor + ?Sized> CommandExecutor for std::sync::Arc<E> {
    async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
        (**self).execute(program, args).await
    }
}
