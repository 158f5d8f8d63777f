//! Engine configuration and environment overrides.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by the fan-out driver, executor, and bundle builder.
///
/// Environment variables override the defaults at construction time:
/// `FTL2_CACHE_DIR` for the bundle cache and `FTL2_MAX_PARALLEL_HOSTS` for
/// fan-out width. A malformed `FTL2_MAX_PARALLEL_HOSTS` is ignored with a
/// warning rather than aborting.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum concurrent per-host executors in one fan-out.
    pub max_parallel_hosts: usize,
    /// Bundle cache directory, shared across processes.
    pub cache_dir: PathBuf,
    /// Per-call deadline; timeout behaves like cancellation plus a
    /// `Timeout` error.
    pub call_timeout: Duration,
    /// How long in-flight remote calls may drain after a fail-fast cancel
    /// before their gate frames are abandoned.
    pub cancel_grace: Duration,
    /// Remote per-user directory where staged bundles and gates live.
    pub remote_cache_dir: String,
    /// Environment label evaluated by policy rules.
    pub environment: String,
}

pub const DEFAULT_MAX_PARALLEL_HOSTS: usize = 50;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_hosts: max_parallel_from_env().unwrap_or(DEFAULT_MAX_PARALLEL_HOSTS),
            cache_dir: cache_dir_from_env(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            remote_cache_dir: "~/.ftl2/gates".to_string(),
            environment: String::new(),
        }
    }
}

fn max_parallel_from_env() -> Option<usize> {
    let raw = std::env::var("FTL2_MAX_PARALLEL_HOSTS").ok()?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(value = %raw, "ignoring malformed FTL2_MAX_PARALLEL_HOSTS");
            None
        }
    }
}

fn cache_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var("FTL2_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ftl2").join("bundles")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_values() {
        let config = EngineConfig {
            max_parallel_hosts: DEFAULT_MAX_PARALLEL_HOSTS,
            ..EngineConfig::default()
        };
        assert_eq!(config.max_parallel_hosts, 50);
        assert_eq!(config.call_timeout, Duration::from_secs(300));
        assert_eq!(config.cancel_grace, Duration::from_secs(5));
    }

    #[test]
    fn cache_dir_defaults_under_home() {
        let config = EngineConfig::default();
        if std::env::var("FTL2_CACHE_DIR").is_err() {
            assert!(config.cache_dir.ends_with(".ftl2/bundles"));
        }
    }
}
