//! Single-job runtime supervisor for a scientific-compute execution platform.
//!
//! Given one externally-assigned job identifier plus credentials, this crate
//! fetches the job's parameters, launches the job's containerized workload,
//! stands up a local callback endpoint the workload uses to request subjobs
//! and record provenance, multiplexes concurrent subjob executions, watches
//! for cancellation or token expiry, collects the final output, and reports
//! completion upstream.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod callback;
pub mod catalog;
pub mod cgroup;
pub mod cli;
pub mod config;
pub mod job;
pub mod log_sink;
pub mod method_runner;
pub mod provenance;
pub mod runtime;
pub mod supervisor;
pub mod upstream;

pub use cli::Args;
pub use supervisor::Supervisor;
