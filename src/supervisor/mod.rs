//! The job supervisor and subjob scheduling loop.
//!
//! This is the event-driven watcher described by the original
//! `JobRunner.py::_watch`/`run`: a single-threaded decision loop mediating
//! between container-completion notifications, the Callback Endpoint, and
//! the upstream execution engine. It is the sole mutator of live-count,
//! provenance, and container-handle state (`spec.md` §4.1, §5).

mod special;

pub use special::SpecialRunner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthClient;
use crate::callback;
use crate::catalog::CatalogLookup;
use crate::job::Job;
use crate::job::JobConfigDoc;
use crate::log_sink::LogSink;
use crate::method_runner;
use crate::provenance::ProvenanceAction;
use crate::provenance::ProvenanceAggregator;
use crate::runtime::ContainerHandle;
use crate::runtime::RuntimeAdapter;
use crate::upstream::ExecutionEngineClient;

/// Shared, read-mostly handle to the provenance aggregator: the loop is the
/// only writer, the Callback Endpoint's `get provenance` handler the only
/// other reader.
pub type SharedProvenance = Arc<tokio::sync::RwLock<ProvenanceAggregator>>;

/// How long the token may live past the current instant before the
/// supervisor treats it as expiring.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(600);

/// Duration of the bounded receive on the inbound queue.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period after invoking cleanup on an upstream cancel, to let
/// containers reap before the process exits.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// The unit the supervisor consumes (`spec.md` §3).
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A new job or subjob was submitted.
    Submit {
        /// The job or subjob id.
        job_id: String,
        /// The submitted parameters.
        params: crate::job::JobParams,
    },
    /// A container exited; its output should be read from disk.
    Finished {
        /// The job or subjob id.
        job_id: String,
    },
    /// A special-runtime job posted its output directly.
    FinishedSpecial {
        /// The job or subjob id.
        job_id: String,
        /// The output document.
        payload: Value,
    },
    /// Cancellation was requested (upstream poll or SIGINT).
    Cancel,
}

/// The unit the supervisor emits to the Callback Endpoint (`spec.md` §3).
#[derive(Debug, Clone)]
pub enum CallbackReply {
    /// The output document for `job_id`.
    Output {
        /// The job or subjob id this reply answers.
        job_id: String,
        /// The output document.
        document: Value,
    },
    /// A provenance snapshot, in response to a `get provenance` request.
    Provenance(Vec<ProvenanceAction>),
}

/// Fatal startup errors (`spec.md` §4.1, §7).
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The job was already run or canceled prior to this process starting.
    #[error("job already run or canceled")]
    AlreadyRun,
    /// The working directory does not exist.
    #[error("working directory does not exist: {0}")]
    MissingWorkdir(PathBuf),
    /// Token validation against the auth service failed.
    #[error("token validation failed: {0}")]
    AuthFailed(#[from] crate::auth::AuthError),
    /// Fetching job parameters from upstream failed.
    #[error("failed to fetch job parameters: {0}")]
    ParamFetchFailed(#[from] crate::upstream::UpstreamError),
    /// No local TCP port was available for the Callback Endpoint.
    #[error("failed to bind callback endpoint: {0}")]
    CallbackBindFailed(#[from] std::io::Error),
}

/// Fixed configuration for one supervised job.
pub struct SupervisorConfig {
    /// The primary job id.
    pub job_id: String,
    /// Root of the working-directory tree.
    pub workdir_root: PathBuf,
    /// Maximum concurrently live containers.
    pub max_tasks: usize,
    /// `CONDOR_ID`, copied into container labels.
    pub condor_id: Option<String>,
    /// Whether `DEBUG_RUNNER` mirroring is enabled.
    pub debug_runner: bool,
    /// Re-run even if upstream reports the job already finished.
    pub rerun: bool,
    /// The job's user auth token.
    pub token: String,
    /// `AWE_CLIENTGROUP` tag.
    pub client_group: String,
    /// Explicit callback IP override (`CALLBACK_IP`).
    pub callback_ip_override: Option<String>,
}

/// The job supervisor (`spec.md` §4.1, THE CORE module).
pub struct Supervisor {
    config: SupervisorConfig,
    upstream: Arc<dyn ExecutionEngineClient>,
    auth: Arc<dyn AuthClient>,
    catalog: Arc<dyn CatalogLookup>,
    runtime: Arc<dyn RuntimeAdapter>,
    special_runner: Option<Arc<dyn SpecialRunner>>,
    inbound_tx: mpsc::Sender<QueueEvent>,
    inbound_rx: mpsc::Receiver<QueueEvent>,
    outbound: broadcast::Sender<CallbackReply>,
    provenance: SharedProvenance,
    live_count: i64,
    handles: Vec<ContainerHandle>,
    user: String,
    callback_url: String,
    cgroup: Option<String>,
}

impl Supervisor {
    /// Constructs a supervisor over the given collaborators. Does not
    /// perform any I/O; call [`Supervisor::run`] to execute the startup
    /// sequence and watch loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        upstream: Arc<dyn ExecutionEngineClient>,
        auth: Arc<dyn AuthClient>,
        catalog: Arc<dyn CatalogLookup>,
        runtime: Arc<dyn RuntimeAdapter>,
        special_runner: Option<Arc<dyn SpecialRunner>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (outbound, _) = broadcast::channel(256);
        Self {
            config,
            upstream,
            auth,
            catalog,
            runtime,
            special_runner,
            inbound_tx,
            inbound_rx,
            outbound,
            provenance: Arc::new(tokio::sync::RwLock::new(ProvenanceAggregator::new())),
            live_count: 0,
            handles: Vec::new(),
            user: String::new(),
            callback_url: String::new(),
            cgroup: crate::cgroup::discover_cgroup(std::process::id()),
        }
    }

    /// Runs the full startup sequence followed by the watch loop, returning
    /// the final output document for the primary job.
    ///
    /// Installs a SIGINT handler that converts the signal into a `Cancel`
    /// event on the inbound queue (`spec.md` §4.1 Signals; §9).
    pub async fn run(mut self) -> Result<Value, anyhow::Error> {
        tracing::info!(
            job_id = %self.config.job_id,
            cgroup = self.cgroup.as_deref().unwrap_or("Unknown"),
            "starting job supervisor"
        );

        // Step 1: already-run check.
        if !self.config.rerun
            && self
                .upstream
                .check_job_canceled(&self.config.job_id)
                .await?
        {
            return Err(SupervisorError::AlreadyRun.into());
        }

        // Step 2: fetch params + config.
        let (params, job_config) = self.upstream.get_job_params(&self.config.job_id).await?;

        // Step 3: confirm working directory.
        let job_dir = Job::work_dir_for(&self.config.workdir_root, &self.config.job_id, false);
        if !job_dir.exists() {
            tokio::fs::create_dir_all(&job_dir).await.map_err(|_| {
                SupervisorError::MissingWorkdir(job_dir.clone())
            })?;
        }

        // Step 4: validate token.
        let token_info = self.auth.validate_token(&self.config.token).await?;
        self.user = token_info.user.clone();

        // Step 5: mark started.
        self.upstream
            .update_job_started(&self.config.job_id)
            .await?;

        // Step 6: provenance aggregator already initialized empty in `new`.

        // Step 7: allocate a free local port and resolve the externally
        // reachable IP (`CALLBACK_IP` override, else the default outbound
        // interface's address).
        let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let ip = resolve_callback_ip(self.config.callback_ip_override.as_deref()).await?;
        self.callback_url = format!("http://{ip}:{port}/");

        // Step 8: spawn the Callback Endpoint, authenticated with the
        // job's token, wired to this loop's queues.
        let callback_state = callback::CallbackState {
            inbound: self.inbound_tx.clone(),
            outbound: self.outbound.clone(),
            provenance: self.provenance.clone(),
            token: self.config.token.clone(),
        };
        let cancel = CancellationToken::new();
        let callback_task = callback::spawn(listener, callback_state, cancel.clone());

        // Step 9: submit the primary job.
        let primary = Job {
            id: self.config.job_id.clone(),
            params: params.clone(),
            subjob: false,
            user: self.user.clone(),
            work_dir: job_dir,
        };
        let finished_bridge = self.spawn_finished_bridge();
        self.dispatch_submit(&primary, &job_config, finished_bridge.clone())
            .await?;
        self.live_count += 1;

        let sigint_task = self.spawn_sigint_bridge(cancel.clone());

        // Step 10: watch loop.
        let exp_time = token_info.expires_at - chrono::Duration::from_std(TOKEN_EXPIRY_MARGIN).unwrap();
        let document = self.watch_loop(exp_time, &job_config).await?;

        cancel.cancel();
        sigint_task.abort();
        callback_task.abort();

        self.upstream
            .finish_job(&self.config.job_id, &document)
            .await?;

        Ok(document)
    }

    /// Spawns the bridge that turns runtime-adapter `Finished` notifications
    /// (bare job ids) into `QueueEvent::Finished` on the inbound queue.
    fn spawn_finished_bridge(&self) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(job_id) = rx.recv().await {
                if inbound
                    .send(QueueEvent::Finished { job_id })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        tx
    }

    /// Converts SIGINT into a `Cancel` event (`spec.md` §9: the handler
    /// enqueues and returns; it never mutates supervisor state itself).
    fn spawn_sigint_bridge(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = inbound.send(QueueEvent::Cancel).await;
                }
                _ = cancel.cancelled() => {}
            }
        })
    }

    /// Resolves catalog info and volume mounts, then launches the job's
    /// container via the Method Runner, recording its handle and
    /// provenance action.
    async fn dispatch_submit(
        &mut self,
        job: &Job,
        job_config: &JobConfigDoc,
        on_finished: mpsc::UnboundedSender<String>,
    ) -> Result<(), anyhow::Error> {
        if job.params.is_special() {
            let runner = self
                .special_runner
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no special runtime configured"))?;
            runner.submit(job, self.inbound_tx.clone()).await?;
            return Ok(());
        }

        let (module, function) = job.params.module_and_function()?;
        let module_info = self
            .catalog
            .get_module_info(module, job.params.service_ver.as_deref())
            .await?;
        if module_info.cached {
            tracing::warn!(
                job_id = %job.id,
                module,
                "module was already used once for this job; serving cached catalog entry"
            );
        } else {
            tracing::info!(job_id = %job.id, module, version = %module_info.version, "running module");
        }
        let catalog_mounts = self
            .catalog
            .get_volume_mounts(module, function, &self.config.client_group)
            .await?;

        let log_sink = LogSink::new(
            job.id.clone(),
            self.upstream.clone(),
            self.config.debug_runner,
        );

        let (handle, action) = method_runner::run(
            self.runtime.as_ref(),
            job,
            &job.work_dir,
            job_config,
            &module_info,
            &catalog_mounts,
            &self.config.token,
            &self.callback_url,
            self.config.condor_id.as_deref(),
            log_sink,
            on_finished,
        )
        .await?;

        self.provenance.write().await.add(action);
        self.handles.push(handle);

        Ok(())
    }

    /// The watch loop proper (`spec.md` §4.1).
    async fn watch_loop(
        &mut self,
        exp_time: DateTime<Utc>,
        job_config: &JobConfigDoc,
    ) -> Result<Value, anyhow::Error> {
        loop {
            let received =
                tokio::time::timeout(RECEIVE_TIMEOUT, self.inbound_rx.recv()).await;

            if let Ok(Some(event)) = received {
                if let Some(terminal) = self.handle_event(event, job_config).await? {
                    return Ok(terminal);
                }
            }

            if Utc::now() > exp_time {
                tracing::warn!(job_id = %self.config.job_id, "token has expired");
                self.cleanup_all().await;
                return Ok(serde_json::json!({"error": "Token has expired"}));
            }

            if self.live_count <= 0 {
                tracing::warn!(
                    job_id = %self.config.job_id,
                    "live count reached zero before the primary job finished"
                );
                return Ok(serde_json::json!({
                    "error": "unexpected: live count reached zero before primary job finished"
                }));
            }

            match self.upstream.check_job_canceled(&self.config.job_id).await {
                Ok(true) => {
                    self.cleanup_all().await;
                    tokio::time::sleep(CANCEL_DRAIN_GRACE).await;
                    return Ok(serde_json::json!({"error": "Canceled or unexpected error"}));
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "transient upstream cancel-check failure, continuing");
                }
            }
        }
    }

    /// Handles a single event, returning `Some(document)` if it terminates
    /// the loop.
    async fn handle_event(
        &mut self,
        event: QueueEvent,
        job_config: &JobConfigDoc,
    ) -> Result<Option<Value>, anyhow::Error> {
        match event {
            QueueEvent::Submit { job_id, params } => {
                if self.live_count + 1 > self.config.max_tasks as i64 {
                    self.cleanup_all().await;
                    let document = serde_json::json!({"error": "Canceled or unexpected error"});
                    let _ = self.outbound.send(CallbackReply::Output {
                        job_id,
                        document: document.clone(),
                    });
                    return Ok(Some(document));
                }

                let work_dir = Job::work_dir_for(&self.config.workdir_root, &job_id, true);
                let subjob = Job {
                    id: job_id,
                    params,
                    subjob: true,
                    user: self.user.clone(),
                    work_dir,
                };
                let on_finished = self.spawn_finished_bridge();
                self.dispatch_submit(&subjob, job_config, on_finished)
                    .await?;
                self.live_count += 1;
                Ok(None)
            }
            QueueEvent::FinishedSpecial { job_id, payload } => {
                let _ = self.outbound.send(CallbackReply::Output {
                    job_id,
                    document: payload,
                });
                self.live_count -= 1;
                Ok(None)
            }
            QueueEvent::Finished { job_id } => {
                let work_dir = Job::work_dir_for(&self.config.workdir_root, &job_id, job_id != self.config.job_id);
                let document = method_runner::get_output(&work_dir).await?;
                let _ = self.outbound.send(CallbackReply::Output {
                    job_id: job_id.clone(),
                    document: document.clone(),
                });
                self.live_count -= 1;

                if job_id == self.config.job_id {
                    if self.live_count > 0 {
                        tracing::warn!(
                            job_id = %self.config.job_id,
                            "orphaned containers may be present"
                        );
                    }
                    return Ok(Some(document));
                }
                Ok(None)
            }
            QueueEvent::Cancel => {
                self.cleanup_all().await;
                Ok(Some(serde_json::json!({})))
            }
        }
    }

    /// Best-effort teardown of every live container handle.
    async fn cleanup_all(&mut self) {
        method_runner::cleanup_all(self.runtime.as_ref(), &mut self.handles).await;
    }
}

/// Resolves the externally reachable IP the Callback Endpoint advertises.
///
/// Grounded in `JobRunner.py::_init_callback_url`: honor `CALLBACK_IP` if
/// set, otherwise open a UDP socket toward a well-known external host and
/// read back the local address the OS chose for that route, without
/// sending any data.
async fn resolve_callback_ip(override_ip: Option<&str>) -> std::io::Result<String> {
    if let Some(ip) = override_ip {
        return Ok(ip.to_string());
    }

    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(("8.8.8.8", 80)).await?;
    Ok(socket.local_addr()?.ip().to_string())
}
