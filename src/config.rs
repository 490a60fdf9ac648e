//! Runner-level configuration: environment overrides and the fixed
//! filesystem layout described in `spec.md` §6.

use std::path::PathBuf;

/// Default working directory root.
const DEFAULT_WORKDIR: &str = "/mnt/awe/condor";

/// Default client-group tag.
const DEFAULT_CLIENT_GROUP: &str = "None";

/// Environment-sourced, process-wide runner configuration.
///
/// Mirrors the handful of environment variables `JobRunner.py` reads
/// directly, restated as a typed struct the way `server/config.rs` typifies
/// its TOML-sourced settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root of the working-directory tree (`workdir/workdir`,
    /// `workdir/subjobs/<id>`).
    pub workdir_root: PathBuf,
    /// `AWE_CLIENTGROUP` — opaque tag selecting volume-mount policy.
    pub client_group: String,
    /// `CALLBACK_IP` — explicit override for the externally reachable IP
    /// the callback endpoint advertises.
    pub callback_ip_override: Option<String>,
    /// `CONDOR_ID` — copied into container labels.
    pub condor_id: Option<String>,
    /// `DEBUG_RUNNER` — enables stderr mirroring of log lines.
    pub debug_runner: bool,
}

impl RunnerConfig {
    /// Reads runner configuration from the environment, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            workdir_root: PathBuf::from(DEFAULT_WORKDIR),
            client_group: std::env::var("AWE_CLIENTGROUP")
                .unwrap_or_else(|_| String::from(DEFAULT_CLIENT_GROUP)),
            callback_ip_override: std::env::var("CALLBACK_IP").ok(),
            condor_id: std::env::var("CONDOR_ID").ok(),
            debug_runner: std::env::var("DEBUG_RUNNER").is_ok(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workdir_root: PathBuf::from(DEFAULT_WORKDIR),
            client_group: String::from(DEFAULT_CLIENT_GROUP),
            callback_ip_override: None,
            condor_id: None,
            debug_runner: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RunnerConfig::default();
        assert_eq!(config.workdir_root, PathBuf::from("/mnt/awe/condor"));
        assert_eq!(config.client_group, "None");
        assert!(config.callback_ip_override.is_none());
        assert!(!config.debug_runner);
    }
}
