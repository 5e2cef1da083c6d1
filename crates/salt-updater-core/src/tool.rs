//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Spawning and capturing the salt-call tool."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use salt_updater_common::ToolConfig;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Stdout followed by stderr.
    pub output: String,
    pub success: bool,
}

/// Runs the external state-application tool.
///
/// Failures to launch or a non-zero exit are reported through
/// [`ToolOutput::success`], never as errors.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> ToolOutput;
}

/// [`ToolRunner`] that spawns `salt-call` (or the configured program).
#[derive(Debug, Clone)]
pub struct SaltCall {
    program: String,
    timeout: Option<Duration>,
}

impl SaltCall {
    pub fn new(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(config.program.clone(), config.timeout)
    }
}

#[async_trait]
impl ToolRunner for SaltCall {
    async fn run(&self, args: &[String]) -> ToolOutput {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, ?args, "spawning tool");
        let pending = command.output();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(program = %self.program, ?args, timeout_secs = limit.as_secs(), "tool call timed out");
                    return ToolOutput {
                        output: format!("{} timed out after {}s", self.program, limit.as_secs()),
                        success: false,
                    };
                }
            },
            None => pending.await,
        };

        match result {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                ToolOutput {
                    output: combined,
                    success: output.status.success(),
                }
            }
            Err(err) => {
                warn!(program = %self.program, error = %err, "failed to launch tool");
                ToolOutput {
                    output: format!("failed to run {}: {}", self.program, err),
                    success: false,
                }
            }
        }
    }
}
