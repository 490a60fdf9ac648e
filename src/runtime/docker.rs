//! The Docker backend.
//!
//! No Docker-specific original source was retrieved; this adapter follows
//! the same shape as [`super::shifter::ShifterAdapter`] (itself grounded in
//! `JobRunner/ShifterRunner.py`), substituting the `docker` CLI's
//! image/run/rm subcommands for `shifterimg`/`shifter`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use super::ContainerHandle;
use super::RunSpec;
use super::RuntimeAdapter;
use super::RuntimeError;
use super::drain_and_notify;
use crate::log_sink::LogSink;

/// Runs containers via the `docker` CLI.
#[derive(Debug, Default)]
pub struct DockerAdapter;

impl DockerAdapter {
    /// Creates a new adapter.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    async fn ensure_image(&self, image: &str) -> Result<bool, RuntimeError> {
        let inspect = Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if inspect.success() {
            return Ok(true);
        }

        Command::new("docker")
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
        let mut command = Command::new("docker");
        command.arg("run").arg("--rm");

        for (key, value) in &spec.env {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            command.arg("-v").arg(format!(
                "{}:{}:{}",
                mount.host_path.display(),
                mount.container_path.display(),
                mode
            ));
        }
        for (key, value) in &spec.labels {
            command.arg("--label").arg(format!("{key}={value}"));
        }
        command
            .arg(&spec.image)
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

    async fn remove(&self, handle: &mut ContainerHandle) -> Result<(), RuntimeError> {
        if let Ok(None) = handle.try_wait().await {
            let _ = handle.kill().await;
        }
        Ok(())
    }
}
