//! The upstream execution-engine client.
//!
//! This is one of the out-of-scope external collaborators named in
//! `spec.md` §1 ("opaque RPC surface; behaviors in §6"); the trait below
//! pins down exactly the RPC surface §6 lists, and [`HttpExecutionEngineClient`]
//! is a concrete `reqwest`-based implementation so the crate compiles and can
//! be exercised end to end. Grounded in the teacher's general
//! trait-plus-concrete-implementation shape (`system/v1/db.rs`'s `Database`
//! trait plus `SqliteDatabase`), with the RPC names taken verbatim from
//! `JobRunner/JobRunner.py` (`njs.check_job_canceled`, `njs.get_job_params`,
//! `njs.update_job`, `njs.finish_job`) and `JobRunner/logger.py`
//! (`njs.add_job_logs`).

use async_trait::async_trait;
use serde_json::Value;

use crate::job::JobConfigDoc;
use crate::job::JobParams;

/// A single log line destined for `add_job_logs`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    // Clone is needed so `LogSink` can buffer owned copies independently of
    // what the caller does with its own lines.
    /// The log text.
    pub line: String,
    /// Whether this line came from a container's stderr stream.
    pub is_error: bool,
}

/// Errors from the upstream execution-engine client.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The underlying HTTP request failed.
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The upstream returned a response this client couldn't parse.
    #[error("failed to parse upstream response: {0}")]
    Parse(#[from] serde_json::Error),
    /// The upstream returned an application-level error.
    #[error("upstream error: {0}")]
    Application(String),
}

/// The execution-engine RPC surface used by the supervisor (`spec.md` §6).
#[async_trait]
pub trait ExecutionEngineClient: Send + Sync {
    /// Checks whether the job has already finished or been canceled.
    async fn check_job_canceled(&self, job_id: &str) -> Result<bool, UpstreamError>;

    /// Fetches the job's method parameters and configuration document.
    async fn get_job_params(
        &self,
        job_id: &str,
    ) -> Result<(JobParams, JobConfigDoc), UpstreamError>;

    /// Marks the job as started.
    async fn update_job_started(&self, job_id: &str) -> Result<(), UpstreamError>;

    /// Appends log lines for the job.
    async fn add_job_logs(&self, job_id: &str, lines: &[LogLine]) -> Result<(), UpstreamError>;

    /// Reports the job's final output document.
    async fn finish_job(&self, job_id: &str, output: &Value) -> Result<(), UpstreamError>;
}

/// A `reqwest`-based [`ExecutionEngineClient`] speaking a JSON-RPC-shaped
/// protocol against the execution-engine base URL.
#[derive(Debug, Clone)]
pub struct HttpExecutionEngineClient {
    /// The execution-engine base URL.
    base_url: String,
    /// The auth token presented on every call.
    token: String,
    /// The underlying HTTP client.
    http: reqwest::Client,
}

impl HttpExecutionEngineClient {
    /// Creates a new client for the given base URL and auth token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Issues a single JSON-RPC-shaped call and returns the `result` field.
    async fn call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            method: &'a str,
            params: Value,
        }

        #[derive(serde::Deserialize)]
        struct Response {
            #[serde(default)]
            result: Option<Value>,
            #[serde(default)]
            error: Option<Value>,
        }

        let response = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&Request { method, params })
            .send()
            .await?
            .error_for_status()?
            .json::<Response>()
            .await?;

        if let Some(error) = response.error {
            return Err(UpstreamError::Application(error.to_string()));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ExecutionEngineClient for HttpExecutionEngineClient {
    async fn check_job_canceled(&self, job_id: &str) -> Result<bool, UpstreamError> {
        let result = self
            .call("check_job_canceled", serde_json::json!({"job_id": job_id}))
            .await?;
        Ok(result
            .get("finished")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn get_job_params(
        &self,
        job_id: &str,
    ) -> Result<(JobParams, JobConfigDoc), UpstreamError> {
        let result = self
            .call("get_job_params", serde_json::json!({"job_id": job_id}))
            .await?;
        let pair: (JobParams, JobConfigDoc) = serde_json::from_value(result)?;
        Ok(pair)
    }

    async fn update_job_started(&self, job_id: &str) -> Result<(), UpstreamError> {
        self.call(
            "update_job",
            serde_json::json!({"job_id": job_id, "is_started": 1}),
        )
        .await?;
        Ok(())
    }

    async fn add_job_logs(&self, job_id: &str, lines: &[LogLine]) -> Result<(), UpstreamError> {
        self.call(
            "add_job_logs",
            serde_json::json!({"job_id": job_id, "lines": lines}),
        )
        .await?;
        Ok(())
    }

    async fn finish_job(&self, job_id: &str, output: &Value) -> Result<(), UpstreamError> {
        self.call(
            "finish_job",
            serde_json::json!({"job_id": job_id, "output": output}),
        )
        .await?;
        Ok(())
    }
}
