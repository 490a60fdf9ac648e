//! The `job-runner` command line binary.
//!
//! Parses a single job's invocation arguments, assembles the supervisor's
//! collaborators, and runs it to completion. Per `spec.md` §6, the process
//! exits `0` whenever the supervisor produced an output document at all
//! (including an in-band `{"error": ...}` document); a non-zero exit is
//! reserved for failures before or during startup, where no `finish_job`
//! call could have been made.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use job_runner::Args;
use job_runner::Supervisor;
use job_runner::auth::HttpAuthClient;
use job_runner::catalog::CatalogCache;
use job_runner::catalog::HttpCatalogClient;
use job_runner::config::RunnerConfig;
use job_runner::runtime::select_adapter;
use job_runner::supervisor::SupervisorConfig;
use job_runner::upstream::HttpExecutionEngineClient;
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "job supervisor failed to start");
            ExitCode::FAILURE
        }
    }
}

/// Assembles the supervisor's collaborators and runs it to completion.
async fn run(args: Args) -> anyhow::Result<()> {
    let runner_config = RunnerConfig::from_env();

    let config_doc = tokio::fs::read(&args.config).await?;
    let job_config: job_runner::job::JobConfigDoc = serde_json::from_slice(&config_doc)?;

    let upstream: Arc<dyn job_runner::upstream::ExecutionEngineClient> =
        Arc::new(HttpExecutionEngineClient::new(
            args.njs_url.clone(),
            args.admin_token.clone(),
        ));
    let auth: Arc<dyn job_runner::auth::AuthClient> = Arc::new(HttpAuthClient::new(
        job_config.auth_service_url.clone(),
        job_config.auth_service_url_allow_insecure,
    ));
    let catalog: Arc<dyn job_runner::catalog::CatalogLookup> =
        Arc::new(CatalogCache::new(HttpCatalogClient::new(
            job_config.catalog_service_url.clone(),
            args.admin_token.clone(),
        )));
    let runtime: Arc<dyn job_runner::runtime::RuntimeAdapter> =
        Arc::from(select_adapter(&job_config.runtime)?);

    let supervisor_config = SupervisorConfig {
        job_id: args.job_id,
        workdir_root: runner_config.workdir_root,
        max_tasks: job_config.max_tasks,
        condor_id: runner_config.condor_id,
        debug_runner: runner_config.debug_runner,
        rerun: args.rerun,
        token: args.token,
        client_group: runner_config.client_group,
        callback_ip_override: runner_config.callback_ip_override,
    };

    let supervisor = Supervisor::new(supervisor_config, upstream, auth, catalog, runtime, None);
    let document = supervisor.run().await?;
    tracing::info!(output = %document, "job supervisor finished");

    Ok(())
}
