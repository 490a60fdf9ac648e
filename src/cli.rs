//! Command line interface for the job runner binary.

use std::path::PathBuf;

use clap::Parser;

/// Arguments for a single job-supervisor invocation.
///
/// The process receives a config document, the execution-engine URL, the
/// job id, and the two tokens described in `spec.md` §6; there is no
/// subcommand surface since this binary supervises exactly one job per
/// process (see `spec.md` §1 Non-goals).
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Path to the job configuration document (JSON).
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// The execution-engine (upstream) base URL.
    #[arg(long, value_name = "URL")]
    pub njs_url: String,

    /// The job id to supervise.
    #[arg(long, value_name = "ID")]
    pub job_id: String,

    /// The user's auth token.
    #[arg(long, value_name = "TOKEN")]
    pub token: String,

    /// The admin auth token, used for elevated upstream calls.
    #[arg(long, value_name = "TOKEN")]
    pub admin_token: String,

    /// Re-run a job even if the upstream reports it already finished.
    #[arg(long)]
    pub rerun: bool,
}
