//! The Shifter backend, grounded directly in `JobRunner/ShifterRunner.py`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use super::ContainerHandle;
use super::RunSpec;
use super::RuntimeAdapter;
use super::RuntimeError;
use super::drain_and_notify;
use crate::log_sink::LogSink;

/// Runs containers via the `shifter`/`shifterimg` CLI tools.
#[derive(Debug, Default)]
pub struct ShifterAdapter;

impl ShifterAdapter {
    /// Creates a new adapter.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RuntimeAdapter for ShifterAdapter {
    async fn ensure_image(&self, image: &str) -> Result<bool, RuntimeError> {
        let lookup = Command::new("shifterimg")
            .args(["lookup", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        // The original implementation compares the raw list returned by
        // `str.rsplit()` against `''`, which is always false for a
        // non-empty list and therefore never triggers a pull on a genuine
        // miss. Here an empty/whitespace-only lookup result is treated as
        // "needs pull", not reproduced as a no-op.
        let id = String::from_utf8_lossy(&lookup.stdout);
        if !id.trim().is_empty() {
            return Ok(true);
        }

        Command::new("shifterimg")
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .status()
            .await?;

        Ok(false)
    }

    async fn run(
        &self,
        spec: RunSpec,
        log_sink: LogSink,
        on_finished: tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Result<ContainerHandle, RuntimeError> {
        let mut command = Command::new("shifter");
        command
            .arg(format!("--image={}", spec.image))
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let handle = ContainerHandle::new(spec.job_id.clone(), command.spawn()?);

        tokio::spawn(drain_and_notify(
            handle.child.clone(),
            handle.job_id.clone(),
            log_sink,
            on_finished,
        ));

        Ok(handle)
    }

    async fn remove(&self, _handle: &mut ContainerHandle) -> Result<(), RuntimeError> {
        // ShifterRunner.remove is a documented no-op upstream.
        Ok(())
    }
}
