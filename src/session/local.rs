use crate::error::GatewayResult;
use crate::session::{EMPTY_COMMAND_MESSAGE, SessionBackend};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMode {
    /// Answers every command with an echo after a fixed delay.
    Echo { delay: Duration },
    /// Runs the command as a child process.
    Process,
}

/// Backend for `local` and `console` sessions.
#[derive(Debug)]
pub struct LocalBackend {
    mode: LocalMode,
}

impl LocalBackend {
    pub fn new(mode: LocalMode) -> Self {
        Self { mode }
    }

    pub fn echo(delay: Duration) -> Self {
        Self::new(LocalMode::Echo { delay })
    }

    pub fn process() -> Self {
        Self::new(LocalMode::Process)
    }

    pub fn mode(&self) -> LocalMode {
        self.mode
    }
}

#[async_trait]
impl SessionBackend for LocalBackend {
    async fn execute(&mut self, command: &str) -> GatewayResult<String> {
        match self.mode {
            LocalMode::Echo { delay } => {
                tokio::time::sleep(delay).await;
                Ok(format!("Echo command:\n  {command}"))
            }
            LocalMode::Process => Ok(run_process(command).await),
        }
    }
}

/// Execution failures come back as output text so the caller sees them like shell errors.
async fn run_process(command: &str) -> String {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return EMPTY_COMMAND_MESSAGE.to_string();
    };
    let args: Vec<&str> = parts.collect();
    tracing::debug!(program, ?args, "Spawning local command");

    let result = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    match result {
        Ok(output) => combined_output(&output),
        Err(err) => {
            tracing::warn!(program, error = %err, "Local command failed to start");
            err.to_string()
        }
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if text.is_empty() && !output.status.success() {
        text = output.status.to_string();
    }
    text
}
