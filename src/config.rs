use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::WardenError;

/// Memory recycling limits for a single worker.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MemoryLimit {
    /// RSS ceiling in MB; a worker above it is recycled.
    pub max: u64,
    /// Probe RSS only every this many requests (probing forks `ps` on the
    /// portable path, so it must not run per request).
    pub check_every: u64,
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self {
            max: 20,
            check_every: 250,
        }
    }
}

/// A policy knob in the JSON config file: `false` disables the policy,
/// a value enables it with that setting.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum Toggle<T> {
    Switch(bool),
    Value(T),
}

impl<T> Toggle<T> {
    fn into_option(self, key: &str) -> Result<Option<T>, WardenError> {
        match self {
            Toggle::Switch(false) => Ok(None),
            Toggle::Switch(true) => Err(WardenError::Config(format!(
                "{key}: use false to disable or a value to enable"
            ))),
            Toggle::Value(value) => Ok(Some(value)),
        }
    }
}

/// JSON config file structure
#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    kill_after_requests: Option<Toggle<u64>>,
    gc_after_request_time: Option<Toggle<f64>>,
    kill_on_too_much_memory: Option<Toggle<MemoryLimit>>,
    map_term_to_quit: Option<bool>,
}

/// Supervisor configuration. Field absent from the config file keeps its
/// default; `None` means the policy is disabled.
#[derive(Debug, Clone)]
pub struct Config {
    /// Recycle a worker after this many requests.
    pub kill_after_requests: Option<u64>,
    /// Run an out-of-band collection pass after this much cumulative
    /// in-request time. Zero behaves like `None`.
    pub gc_after_request_time: Option<Duration>,
    /// Recycle a worker whose RSS exceeds the limit.
    pub kill_on_too_much_memory: Option<MemoryLimit>,
    /// Remap externally delivered TERM into the host's graceful QUIT.
    pub map_term_to_quit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kill_after_requests: Some(10_000),
            gc_after_request_time: Some(Duration::from_secs(10)),
            kill_on_too_much_memory: Some(MemoryLimit::default()),
            map_term_to_quit: false,
        }
    }
}

impl Config {
    /// Load config from a JSON file, merged over the defaults and validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file: FileConfig = serde_json::from_str(&content)?;
        info!("Loaded supervisor config from: {}", path.display());

        let mut config = Self::default();
        config.merge(file)?;
        config.validate()?;
        Ok(config)
    }

    fn merge(&mut self, file: FileConfig) -> Result<(), WardenError> {
        if let Some(v) = file.kill_after_requests {
            self.kill_after_requests = v.into_option("kill_after_requests")?;
        }
        if let Some(v) = file.gc_after_request_time {
            self.gc_after_request_time = match v.into_option("gc_after_request_time")? {
                Some(secs) if !(secs >= 0.0) => {
                    return Err(WardenError::Config(format!(
                        "gc_after_request_time: expected a non-negative number of seconds, got {secs}"
                    )));
                }
                Some(secs) => Some(Duration::from_secs_f64(secs)),
                None => None,
            };
        }
        if let Some(v) = file.kill_on_too_much_memory {
            self.kill_on_too_much_memory = v.into_option("kill_on_too_much_memory")?;
        }
        if let Some(v) = file.map_term_to_quit {
            self.map_term_to_quit = v;
        }
        Ok(())
    }

    /// Reject settings that would misbehave once traffic is flowing.
    /// Called once at setup so misconfiguration fails before serving.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.kill_after_requests == Some(0) {
            return Err(WardenError::Config(
                "kill_after_requests must be at least 1; use false to disable".into(),
            ));
        }
        if let Some(limit) = &self.kill_on_too_much_memory {
            if limit.max == 0 {
                return Err(WardenError::Config(
                    "kill_on_too_much_memory.max must be at least 1MB".into(),
                ));
            }
            if limit.check_every == 0 {
                return Err(WardenError::Config(
                    "kill_on_too_much_memory.check_every must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Config, WardenError> {
        let file: FileConfig = serde_json::from_str(json).map_err(WardenError::from)?;
        let mut config = Config::default();
        config.merge(file)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults_enable_all_recycling_policies() {
        let config = Config::default();
        assert_eq!(config.kill_after_requests, Some(10_000));
        assert_eq!(config.gc_after_request_time, Some(Duration::from_secs(10)));
        let limit = config.kill_on_too_much_memory.unwrap();
        assert_eq!((limit.max, limit.check_every), (20, 250));
        assert!(!config.map_term_to_quit);
    }

    #[test]
    fn false_disables_a_policy() {
        let config = parse(r#"{"kill_after_requests": false, "gc_after_request_time": false}"#).unwrap();
        assert_eq!(config.kill_after_requests, None);
        assert_eq!(config.gc_after_request_time, None);
        // untouched knob keeps its default
        assert!(config.kill_on_too_much_memory.is_some());
    }

    #[test]
    fn values_override_defaults() {
        let config = parse(
            r#"{
                "kill_after_requests": 500,
                "gc_after_request_time": 0.5,
                "kill_on_too_much_memory": {"max": 700, "check_every": 10},
                "map_term_to_quit": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.kill_after_requests, Some(500));
        assert_eq!(config.gc_after_request_time, Some(Duration::from_millis(500)));
        let limit = config.kill_on_too_much_memory.unwrap();
        assert_eq!((limit.max, limit.check_every), (700, 10));
        assert!(config.map_term_to_quit);
    }

    #[test]
    fn memory_limit_fills_partial_objects_with_defaults() {
        let config = parse(r#"{"kill_on_too_much_memory": {"max": 1024}}"#).unwrap();
        let limit = config.kill_on_too_much_memory.unwrap();
        assert_eq!((limit.max, limit.check_every), (1024, 250));
    }

    #[test]
    fn true_is_not_a_valid_toggle_value() {
        assert!(parse(r#"{"kill_after_requests": true}"#).is_err());
    }

    #[test]
    fn zero_thresholds_are_fatal() {
        assert!(parse(r#"{"kill_after_requests": 0}"#).is_err());
        assert!(parse(r#"{"kill_on_too_much_memory": {"check_every": 0}}"#).is_err());
        assert!(parse(r#"{"kill_on_too_much_memory": {"max": 0}}"#).is_err());
        assert!(parse(r#"{"gc_after_request_time": -1.0}"#).is_err());
    }
}
