//! Workspace preparation and container launch for a single job or subjob.
//!
//! Grounded directly in `JobRunner/MethodRunner.py`: `_init_workdir`'s
//! `config.properties`/`input.json`/`token` trio, `run`'s volume-mount and
//! label construction, and `get_output`'s fixed "Output not found" document.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;

use crate::catalog::ModuleInfo;
use crate::job::Job;
use crate::job::JobConfigDoc;
use crate::provenance::ProvenanceAction;
use crate::runtime::ContainerHandle;
use crate::runtime::Mount;
use crate::runtime::RunSpec;
use crate::runtime::RuntimeAdapter;
use crate::runtime::RuntimeError;

/// Errors preparing or launching a job's container.
#[derive(Debug, thiserror::Error)]
pub enum MethodRunnerError {
    /// A filesystem operation failed.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A configured volume mount's host path does not exist.
    #[error("volume mount host path does not exist: {0}")]
    MissingVolumeMount(PathBuf),
    /// The container runtime failed.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// The fixed error document `get_output` returns when `output.json` is
/// missing, verbatim from `MethodRunner.py::get_output`.
fn output_not_found() -> Value {
    serde_json::json!({
        "error": {
            "code": -32601,
            "name": "Output not found",
            "message": "No output generated",
            "error": "No output generated",
        }
    })
}

/// Writes `config.properties`, `input.json`, and `token` into `job_dir`.
async fn init_workdir(
    job_dir: &Path,
    config: &JobConfigDoc,
    job: &Job,
    token: &str,
) -> Result<(), MethodRunnerError> {
    tokio::fs::create_dir_all(job_dir).await?;

    let properties = format!(
        "[global]\nkbase_endpoint = {}\nworkspace_url = {}\nshock_url = {}\nhandle_url = {}\nauth_service_url = {}\nauth_service_url_allow_insecure = {}\nscratch = /kb/module/work/tmp\n",
        config.kbase_endpoint,
        config.workspace_url,
        config.shock_url,
        config.handle_url,
        config.auth_service_url,
        config.auth_service_url_allow_insecure,
    );
    tokio::fs::write(job_dir.join("config.properties"), properties).await?;

    let input = serde_json::json!({
        "version": "1.1",
        "method": job.params.method,
        "params": job.params.params,
        "context": {},
    });
    tokio::fs::write(
        job_dir.join("input.json"),
        serde_json::to_vec(&input)?,
    )
    .await?;

    tokio::fs::write(job_dir.join("token"), token).await?;

    Ok(())
}

/// Computes the volume mounts for one job, expanding `${username}` in any
/// configured host paths and refusing to launch if an expanded path is
/// missing.
fn compute_mounts(
    job_dir: &Path,
    config: &JobConfigDoc,
    module_info: &ModuleInfo,
    extra_mounts: &[crate::job::VolumeMountConfig],
    user: &str,
) -> Result<Vec<Mount>, MethodRunnerError> {
    let mut mounts = vec![Mount {
        host_path: job_dir.to_path_buf(),
        container_path: PathBuf::from("/kb/module/work"),
        read_only: false,
    }];

    for configured in config.volume_mounts.iter().chain(extra_mounts) {
        let host_path = PathBuf::from(configured.host_dir.replace("${username}", user));
        if !host_path.exists() {
            return Err(MethodRunnerError::MissingVolumeMount(host_path));
        }
        mounts.push(Mount {
            host_path,
            container_path: PathBuf::from(&configured.container_dir),
            read_only: configured.read_only,
        });
    }

    if let Some(data_volume) = &module_info.data_volume {
        let ref_data = config
            .refdata_dir
            .join(&data_volume.folder)
            .join(&data_volume.version);
        mounts.push(Mount {
            host_path: ref_data,
            container_path: PathBuf::from("/data"),
            read_only: true,
        });
    }

    Ok(mounts)
}

/// Renders a `wsid` value the way the original's `str(params.get('wsid',
/// ''))` would: the bare string for a JSON string, otherwise the value's
/// plain text form, or the empty string when absent.
fn wsid_label(wsid: Option<&Value>) -> String {
    match wsid {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Computes the administrative labels attached to a job's container.
fn compute_labels(
    module: &str,
    method: &str,
    image: &str,
    job: &Job,
    condor_id: Option<&str>,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("app_id".to_string(), format!("{module}/{method}"));
    labels.insert("app_name".to_string(), method.to_string());
    labels.insert(
        "condor_id".to_string(),
        condor_id.unwrap_or_default().to_string(),
    );
    labels.insert("image_name".to_string(), image.to_string());
    labels.insert(
        "image_version".to_string(),
        image.rsplit('.').next().unwrap_or_default().to_string(),
    );
    labels.insert("job_id".to_string(), job.id.clone());
    labels.insert("user_name".to_string(), job.user.clone());
    labels.insert("wsid".to_string(), wsid_label(job.params.wsid.as_ref()));
    labels
}

/// Prepares the job's working directory and launches its container.
///
/// Returns the [`ProvenanceAction`] recording the module/version/commit
/// that was run, to be appended to the job's provenance list by the
/// supervisor.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    adapter: &dyn RuntimeAdapter,
    job: &Job,
    job_dir: &Path,
    config: &JobConfigDoc,
    module_info: &ModuleInfo,
    catalog_mounts: &[crate::job::VolumeMountConfig],
    token: &str,
    callback_url: &str,
    condor_id: Option<&str>,
    log_sink: crate::log_sink::LogSink,
    on_finished: tokio::sync::mpsc::UnboundedSender<String>,
) -> Result<(ContainerHandle, ProvenanceAction), MethodRunnerError> {
    let (module, method) = job
        .params
        .module_and_function()
        .map_err(|err| MethodRunnerError::Io(std::io::Error::other(err.to_string())))?;

    adapter.ensure_image(&module_info.image).await?;

    init_workdir(job_dir, config, job, token).await?;

    let mounts = compute_mounts(job_dir, config, module_info, catalog_mounts, &job.user)?;
    let labels = compute_labels(module, method, &module_info.image, job, condor_id);

    let mut env = HashMap::new();
    env.insert("SDK_CALLBACK_URL".to_string(), callback_url.to_string());

    let spec = RunSpec {
        job_id: job.id.clone(),
        image: module_info.image.clone(),
        env,
        mounts,
        labels,
    };

    let handle = adapter.run(spec, log_sink, on_finished).await?;

    let action = ProvenanceAction {
        name: module.to_string(),
        ver: job.params.service_ver.clone(),
        code_url: module_info.git_url.clone(),
        commit: module_info.git_commit.clone(),
    };

    Ok((handle, action))
}

/// Reads `output.json` from a job's working directory, returning the fixed
/// "Output not found" document if it is absent.
pub async fn get_output(job_dir: &Path) -> Result<Value, MethodRunnerError> {
    let output_path = job_dir.join("output.json");
    match tokio::fs::read(&output_path).await {
        Ok(bytes) => {
            let document: Value = serde_json::from_slice(&bytes)?;
            if document.get("error").is_some() {
                tracing::warn!(job_dir = %job_dir.display(), "error in job output");
            }
            Ok(document)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(output_not_found()),
        Err(err) => Err(err.into()),
    }
}

/// Best-effort cleanup of every container launched so far. Per-container
/// errors are logged and swallowed, matching `cleanup_all`'s behavior.
pub async fn cleanup_all(adapter: &dyn RuntimeAdapter, handles: &mut [ContainerHandle]) {
    for handle in handles {
        if let Err(err) = adapter.remove(handle).await {
            tracing::warn!(job_id = %handle.job_id, error = %err, "failed to clean up container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_output_file_yields_fixed_error_document() {
        let dir = tempfile::tempdir().unwrap();
        let output = get_output(dir.path()).await.unwrap();
        assert_eq!(output["error"]["name"], "Output not found");
    }

    #[tokio::test]
    async fn present_output_file_is_returned_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("output.json"), r#"{"result": [1, 2]}"#)
            .await
            .unwrap();
        let output = get_output(dir.path()).await.unwrap();
        assert_eq!(output["result"], serde_json::json!([1, 2]));
    }
}
