//! The special-runtime dispatch path.
//!
//! `spec.md` §9 notes that a method whose name begins with `special.` is
//! handed to an alternate runtime path (e.g. CWL/WDL/HPC) that posts its
//! own result via `FinishedSpecial` rather than relying on the generic
//! Runtime Adapter reader task. The concrete special backends are out of
//! this crate's scope; [`SpecialRunner`] pins down only the contract the
//! Supervisor Loop depends on.

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::job::Job;
use crate::supervisor::QueueEvent;

/// Errors from a special-runtime dispatch.
#[derive(Debug, thiserror::Error)]
pub enum SpecialRunnerError {
    /// The special backend rejected or failed to start the job.
    #[error("special runtime dispatch failed: {0}")]
    Failed(String),
}

/// A special-method dispatch backend.
///
/// Implementations are responsible for eventually posting exactly one
/// [`QueueEvent::FinishedSpecial`] for `job.id` onto `inbound`, preserving
/// the contract the generic path gets for free from the Runtime Adapter's
/// reader task.
#[async_trait]
pub trait SpecialRunner: Send + Sync {
    /// Submits `job` to the special backend. Returns once the job has been
    /// accepted for execution, not once it completes.
    async fn submit(
        &self,
        job: &Job,
        inbound: Sender<QueueEvent>,
    ) -> Result<(), SpecialRunnerError>;
}
