//! Shared test fakes for the supervisor's end-to-end scenario tests.
//!
//! Each fake implements one of the crate's public collaborator traits
//! directly, the same way a real deployment would plug in its own HTTP
//! clients and runtime backend. [`FakeRuntime`] is the most involved: it
//! spawns a genuine (trivial) child process to satisfy `ContainerHandle`,
//! then runs the simulated container's behavior in a background task keyed
//! off `RunSpec::image`, including round-tripping through the real Callback
//! Endpoint HTTP server for the subjob-submission scenarios.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use job_runner::auth::AuthClient;
use job_runner::auth::AuthError;
use job_runner::auth::TokenInfo;
use job_runner::catalog::CatalogError;
use job_runner::catalog::CatalogLookup;
use job_runner::catalog::ModuleInfo;
use job_runner::job::JobConfigDoc;
use job_runner::job::JobParams;
use job_runner::job::VolumeMountConfig;
use job_runner::log_sink::LogSink;
use job_runner::runtime::ContainerHandle;
use job_runner::runtime::RunSpec;
use job_runner::runtime::RuntimeAdapter;
use job_runner::runtime::RuntimeError;
use job_runner::supervisor::SupervisorConfig;
use job_runner::upstream::ExecutionEngineClient;
use job_runner::upstream::LogLine;
use job_runner::upstream::UpstreamError;

/// Builds a minimal [`JobParams`] for `method`.
pub fn job_params(method: &str) -> JobParams {
    JobParams {
        method: method.to_string(),
        params: Value::Null,
        service_ver: None,
        wsid: None,
    }
}

/// Builds a [`JobConfigDoc`] with harmless placeholder endpoint URLs.
pub fn job_config_doc() -> JobConfigDoc {
    JobConfigDoc {
        kbase_endpoint: "https://kbase.example.org/services".to_string(),
        workspace_url: "https://kbase.example.org/services/ws".to_string(),
        shock_url: "https://kbase.example.org/services/shock".to_string(),
        handle_url: "https://kbase.example.org/services/handle".to_string(),
        auth_service_url: "https://kbase.example.org/services/auth".to_string(),
        auth_service_url_allow_insecure: false,
        catalog_service_url: "https://kbase.example.org/services/catalog".to_string(),
        runtime: "docker".to_string(),
        refdata_dir: std::path::PathBuf::from("/tmp/ref"),
        volume_mounts: Vec::new(),
        max_tasks: 20,
    }
}

/// Builds a [`ModuleInfo`] resolving `module` to `image`.
pub fn module_info(module: &str, image: &str) -> ModuleInfo {
    ModuleInfo {
        module: module.to_string(),
        version: "1.0.0".to_string(),
        image: image.to_string(),
        git_url: "https://github.com/kbase/example".to_string(),
        git_commit: "deadbeef".to_string(),
        data_volume: None,
        cached: false,
    }
}

/// Builds a [`SupervisorConfig`] with test-friendly defaults (loopback
/// callback address, no `CONDOR_ID`, `DEBUG_RUNNER` off).
pub fn supervisor_config(
    job_id: &str,
    workdir_root: std::path::PathBuf,
    token: &str,
    max_tasks: usize,
) -> SupervisorConfig {
    SupervisorConfig {
        job_id: job_id.to_string(),
        workdir_root,
        max_tasks,
        condor_id: None,
        debug_runner: false,
        rerun: false,
        token: token.to_string(),
        client_group: "test_client_group".to_string(),
        callback_ip_override: Some("127.0.0.1".to_string()),
    }
}

/// An [`ExecutionEngineClient`] backed by in-memory state instead of HTTP.
pub struct FakeUpstream {
    /// Flips to `true` to simulate an upstream cancellation.
    pub canceled: Arc<AtomicBool>,
    /// The fixed `(params, config)` pair `get_job_params` returns.
    pub job_params: (JobParams, JobConfigDoc),
    /// Captures the document passed to `finish_job`.
    pub finished: Arc<Mutex<Option<Value>>>,
}

#[async_trait]
impl ExecutionEngineClient for FakeUpstream {
    async fn check_job_canceled(&self, _job_id: &str) -> Result<bool, UpstreamError> {
        Ok(self.canceled.load(Ordering::SeqCst))
    }

    async fn get_job_params(
        &self,
        _job_id: &str,
    ) -> Result<(JobParams, JobConfigDoc), UpstreamError> {
        Ok(self.job_params.clone())
    }

    async fn update_job_started(&self, _job_id: &str) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn add_job_logs(&self, _job_id: &str, _lines: &[LogLine]) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn finish_job(&self, _job_id: &str, output: &Value) -> Result<(), UpstreamError> {
        *self.finished.lock().await = Some(output.clone());
        Ok(())
    }
}

/// An [`AuthClient`] that always accepts its token and reports a fixed
/// expiry.
pub struct FakeAuth {
    /// The expiry timestamp `validate_token` reports.
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
impl AuthClient for FakeAuth {
    async fn validate_token(&self, _token: &str) -> Result<TokenInfo, AuthError> {
        Ok(TokenInfo {
            user: "testuser".to_string(),
            expires_at: self.expires_at,
        })
    }
}

/// A [`CatalogLookup`] backed by a fixed module table, bypassing
/// `CatalogCache` entirely since these scenarios don't exercise caching.
pub struct FakeCatalog {
    /// Module name to resolved info.
    pub modules: HashMap<String, ModuleInfo>,
}

#[async_trait]
impl CatalogLookup for FakeCatalog {
    async fn get_module_info(
        &self,
        module: &str,
        _version: Option<&str>,
    ) -> Result<ModuleInfo, CatalogError> {
        self.modules
            .get(module)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(module.to_string()))
    }

    async fn get_volume_mounts(
        &self,
        _module: &str,
        _method: &str,
        _client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>, CatalogError> {
        Ok(Vec::new())
    }
}

/// A [`RuntimeAdapter`] that spawns a real (trivial) child process to
/// satisfy [`ContainerHandle`], and simulates the workload's behavior in a
/// background task selected by [`RunSpec::image`].
pub struct FakeRuntime {
    /// Captures the `result` field of the last `submit_subjob` reply a
    /// simulated primary container observed.
    pub captured_reply: Arc<Mutex<Option<Value>>>,
}

impl FakeRuntime {
    /// Creates a fresh fake runtime with no captured reply yet.
    pub fn new() -> Self {
        Self {
            captured_reply: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn ensure_image(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn run(
        &self,
        spec: RunSpec,
        _log_sink: LogSink,
        on_finished: mpsc::UnboundedSender<String>,
    ) -> Result<ContainerHandle, RuntimeError> {
        let child = Command::new("true").spawn()?;
        let handle = ContainerHandle::new(spec.job_id.clone(), child);
        let captured = self.captured_reply.clone();
        tokio::spawn(run_behavior(spec, on_finished, captured));
        Ok(handle)
    }

    async fn remove(&self, handle: &mut ContainerHandle) -> Result<(), RuntimeError> {
        if let Ok(None) = handle.try_wait().await {
            let _ = handle.kill().await;
        }
        Ok(())
    }
}

/// Writes `value` as `output.json` into `job_dir`.
async fn write_output(job_dir: &Path, value: &Value) {
    let _ = tokio::fs::write(job_dir.join("output.json"), serde_json::to_vec(value).unwrap()).await;
}

/// Calls back into the supervisor's Callback Endpoint as a real workload
/// would: reads the token file the supervisor wrote into the job's working
/// directory and presents it as the `authorization` header.
async fn call_submit_subjob(job_dir: &Path, callback_url: &str, method: &str) -> Value {
    let token = tokio::fs::read_to_string(job_dir.join("token"))
        .await
        .unwrap_or_default();
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "method": "submit_subjob",
        "params": {"method": method, "params": Value::Null},
    });
    let response = client
        .post(callback_url)
        .header("authorization", token)
        .json(&body)
        .send()
        .await
        .expect("callback request failed");
    let value: Value = response.json().await.expect("invalid callback response");
    value.get("result").cloned().unwrap_or(Value::Null)
}

/// Runs the simulated container behavior selected by `spec.image`.
async fn run_behavior(
    spec: RunSpec,
    on_finished: mpsc::UnboundedSender<String>,
    captured_reply: Arc<Mutex<Option<Value>>>,
) {
    let job_dir = spec.mounts[0].host_path.clone();
    let callback_url = spec.env.get("SDK_CALLBACK_URL").cloned().unwrap_or_default();

    match spec.image.as_str() {
        "happy" => {
            write_output(&job_dir, &serde_json::json!({"result": 42})).await;
            let _ = on_finished.send(spec.job_id);
        }
        "missing" => {
            let _ = on_finished.send(spec.job_id);
        }
        "never" => {}
        "sub" => {
            write_output(&job_dir, &serde_json::json!({"v": 1})).await;
            let _ = on_finished.send(spec.job_id);
        }
        "submits_subjob" => {
            let reply = call_submit_subjob(&job_dir, &callback_url, "sub.run").await;
            *captured_reply.lock().await = Some(reply);
            write_output(&job_dir, &serde_json::json!({"ok": true})).await;
            let _ = on_finished.send(spec.job_id);
        }
        "submits_two_subjobs" => {
            let dir_a = job_dir.clone();
            let url_a = callback_url.clone();
            let dir_b = job_dir.clone();
            let url_b = callback_url.clone();
            tokio::spawn(async move {
                call_submit_subjob(&dir_a, &url_a, "sub.run").await;
            });
            tokio::spawn(async move {
                call_submit_subjob(&dir_b, &url_b, "sub.run").await;
            });
        }
        other => panic!("unhandled fake container image: {other}"),
    }
}
