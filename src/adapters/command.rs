//! Subprocess collector.
//!
//! Spawns a configured program, writes the job as JSON to its stdin, and
//! reads a [`CollectorOutput`] as JSON from its stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{Collector, CollectorError, CollectorOutput};
use crate::domain::Job;

/// Collector backed by an external program
pub struct CommandCollector {
    program: String,
    args: Vec<String>,
    run_timeout: Duration,
}

impl CommandCollector {
    pub fn new(program: impl Into<String>, args: Vec<String>, run_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            run_timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Collector for CommandCollector {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self, job: &Job) -> Result<CollectorOutput, CollectorError> {
        let input = serde_json::to_vec(job).map_err(|e| {
            CollectorError::Unrecoverable(format!("failed to encode job {}: {}", job.id, e))
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CollectorError::Unrecoverable(format!(
                    "failed to spawn collector '{}': {}",
                    self.program, e
                ))
            })?;

        // stdin is written concurrently with the wait, both under the timeout
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let run = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.map_err(|e| {
                CollectorError::Recoverable(format!("failed to write job to collector: {}", e))
            })?;
            output.map_err(|e| {
                CollectorError::Recoverable(format!("failed to wait for collector: {}", e))
            })
        };

        let output = timeout(self.run_timeout, run).await.map_err(|_| {
            CollectorError::Recoverable(format!(
                "collector '{}' timed out after {:?}",
                self.program, self.run_timeout
            ))
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(CollectorError::Recoverable(format!(
                "collector '{}' exited with code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            )));
        }

        debug!(job_id = %job.id, bytes = output.stdout.len(), "Collector output received");

        serde_json::from_slice(&output.stdout).map_err(|e| {
            CollectorError::Unrecoverable(format!("collector output is not valid JSON: {}", e))
        })
    }
}
