//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable naming the external modules directory. When unset
/// the reconciler has nothing to manage and runs as a no-op.
pub const EXTERNAL_MODULES_DIR_ENV: &str = "EXTERNAL_MODULES_DIR";

/// Reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Root of the on-disk module tree; `None` disables the reconciler.
    #[serde(default)]
    pub external_modules_dir: Option<PathBuf>,

    /// Number of parallel reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Coalescing window for host restart signals.
    #[serde(default = "default_debounce_window")]
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,

    /// Interval between manifest directory scans.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

const fn default_workers() -> usize {
    3
}

const fn default_debounce_window() -> Duration {
    Duration::from_secs(5)
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            external_modules_dir: None,
            workers: default_workers(),
            debounce_window: default_debounce_window(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl ReconcilerConfig {
    /// Builds a configuration with the modules root read from the
    /// environment. An empty value counts as unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            external_modules_dir: std::env::var_os(EXTERNAL_MODULES_DIR_ENV)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            ..Self::default()
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_controller_contract() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.debounce_window, Duration::from_secs(5));
        assert!(config.external_modules_dir.is_none());
    }

    #[test]
    fn durations_round_trip_through_humantime() {
        let config = ReconcilerConfig {
            external_modules_dir: Some(PathBuf::from("/var/modules")),
            workers: 5,
            debounce_window: Duration::from_secs(5),
            poll_interval: Duration::from_secs(90),
        };
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("\"5s\""));
        assert!(json.contains("\"1m 30s\""));

        let parsed: ReconcilerConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.poll_interval, config.poll_interval);
        assert_eq!(parsed.workers, 5);
    }
}
