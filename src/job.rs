//! Job and subjob data types.
//!
//! A [`Job`] is constructed once from upstream parameters, never mutated
//! after resolution, and destroyed at process exit. A [`Subjob`] shares the
//! same shape but is scoped to a `subjobs/<id>/` working directory and never
//! spawns subjobs of its own (see `spec.md` §3).

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// The parameters that identify a single method invocation.
///
/// Deserialized directly from the upstream `get_job_params` response; field
/// names follow the wire shape used by `JobRunner/MethodRunner.py` (e.g.
/// `method` is a dotted `module.function` string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    /// The `module.function` method name.
    pub method: String,
    /// The method's argument document.
    pub params: Value,
    /// The optional requested service version.
    #[serde(default)]
    pub service_ver: Option<String>,
    /// The optional workspace id.
    #[serde(default)]
    pub wsid: Option<Value>,
}

impl JobParams {
    /// Splits [`JobParams::method`] into its `(module, function)` halves.
    ///
    /// # Errors
    ///
    /// Returns an error if the method name does not contain exactly one `.`.
    pub fn module_and_function(&self) -> anyhow::Result<(&str, &str)> {
        let mut parts = self.method.splitn(2, '.');
        let module = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("malformed method name: `{}`", self.method))?;
        let function = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("malformed method name: `{}`", self.method))?;
        Ok((module, function))
    }

    /// Returns `true` if this is a special method (begins with `special.`).
    pub fn is_special(&self) -> bool {
        self.method.starts_with("special.")
    }
}

/// A single volume mount entry sourced from the job configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMountConfig {
    /// Host-side directory; may contain a `${username}` placeholder.
    pub host_dir: String,
    /// Container-side mount point.
    pub container_dir: String,
    /// Whether the mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// The job configuration document fetched alongside [`JobParams`].
///
/// This is the second element of the `get_job_params` response tuple in
/// `spec.md` §6; it carries endpoint URLs, auth settings, and the runtime
/// selection, plus whatever extra fields the execution engine chooses to
/// send (hence `extra`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfigDoc {
    /// `kbase_endpoint` config.properties value.
    pub kbase_endpoint: String,
    /// `workspace_url` config.properties value.
    pub workspace_url: String,
    /// `shock_url` config.properties value.
    pub shock_url: String,
    /// `handle_url` config.properties value.
    pub handle_url: String,
    /// `auth_service_url` config.properties value.
    pub auth_service_url: String,
    /// `auth_service_url_allow_insecure` config.properties value.
    #[serde(default)]
    pub auth_service_url_allow_insecure: bool,
    /// Base URL of the KBase Catalog service, used to resolve module
    /// versions and per-method volume mounts.
    pub catalog_service_url: String,
    /// Container runtime selector (`docker` or `shifter`); default `docker`.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Reference-data root mounted at `/data`; default `/tmp/ref`.
    #[serde(default = "default_refdata_dir")]
    pub refdata_dir: PathBuf,
    /// Extra volume mounts requested by the configuration document.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountConfig>,
    /// Maximum number of concurrently live containers.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

/// Default container runtime.
fn default_runtime() -> String {
    String::from("docker")
}

/// Default reference-data root.
fn default_refdata_dir() -> PathBuf {
    PathBuf::from("/tmp/ref")
}

/// Default concurrency cap.
fn default_max_tasks() -> usize {
    20
}

/// A job (primary or subjob) resolved for execution.
#[derive(Debug, Clone)]
pub struct Job {
    /// The opaque job identifier.
    pub id: String,
    /// The method invocation parameters.
    pub params: JobParams,
    /// `true` if this is a subjob submitted by the primary workload.
    pub subjob: bool,
    /// The resolved user identity (populated after auth validation).
    pub user: String,
    /// This job's working directory (`workdir/workdir` or
    /// `workdir/subjobs/<id>`).
    pub work_dir: PathBuf,
}

impl Job {
    /// Builds the working directory path for a job under `workdir_root`.
    pub fn work_dir_for(workdir_root: &Path, id: &str, subjob: bool) -> PathBuf {
        if subjob {
            workdir_root.join("subjobs").join(id)
        } else {
            workdir_root.join("workdir")
        }
    }
}

/// A subjob is a [`Job`] with `subjob` fixed to `true`; kept as a distinct
/// type alias so call sites document intent even though the shape is
/// identical (per `spec.md` §3).
pub type Subjob = Job;
