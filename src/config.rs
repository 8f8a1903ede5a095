// src/config.rs
use crate::error::{VaranError, VaranResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_easy_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenAddr {
    pub ip: String,
    pub port: u16,
}

/// Server configuration, deserialized from a JSON file. Every field the
/// engine cannot run without is checked before a single socket opens.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Main listener for client traffic.
    pub listen: ListenAddr,
    /// Secondary listener answering status requests.
    pub stats: ListenAddr,

    /// Idle connections older than this are evicted by the registry
    /// sweep.
    pub connection_timeout_ms: u64,
    /// Interval of the handler's `idle()` hook; zero runs it once.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_easy_threads")]
    pub easy_threads: usize,
    #[serde(default)]
    pub hard_threads: usize,

    /// Queue capacities; zero means unbounded.
    #[serde(default)]
    pub easy_queue_limit: usize,
    #[serde(default)]
    pub hard_queue_limit: usize,

    /// Opaque parameter blob forwarded to `Handler::configure`.
    #[serde(default)]
    pub handler_params: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> VaranResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VaranError::Config(format!("cannot access '{}': {}", path.display(), e))
        })?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| VaranError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaranResult<()> {
        if self.listen.ip.is_empty() {
            return Err(VaranError::Config("<listen:ip> is empty".into()));
        }
        if self.stats.ip.is_empty() {
            return Err(VaranError::Config("<stats:ip> is empty".into()));
        }
        if self.connection_timeout_ms == 0 {
            return Err(VaranError::Config(
                "<connection_timeout_ms> is not set or set to 0".into(),
            ));
        }
        if self.easy_threads == 0 {
            return Err(VaranError::Config("<easy_threads> is set to 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"{
            "listen": {"ip": "0.0.0.0", "port": 8080},
            "stats": {"ip": "127.0.0.1", "port": 8081},
            "connection_timeout_ms": 60000
        }"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: ServerConfig = serde_json::from_str(minimal()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.easy_threads, num_cpus::get());
        assert_eq!(config.hard_threads, 0);
        assert_eq!(config.easy_queue_limit, 0);
        assert_eq!(config.log_level, "info");
        assert!(config.log_file.is_none());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let raw = r#"{"listen": {"ip": "0.0.0.0", "port": 8080}}"#;
        assert!(serde_json::from_str::<ServerConfig>(raw).is_err());
    }

    #[test]
    fn zero_connection_timeout_is_rejected() {
        let mut config: ServerConfig = serde_json::from_str(minimal()).unwrap();
        config.connection_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_easy_threads_is_rejected() {
        let mut config: ServerConfig = serde_json::from_str(minimal()).unwrap();
        config.easy_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_bind_ip_is_rejected() {
        let mut config: ServerConfig = serde_json::from_str(minimal()).unwrap();
        config.listen.ip.clear();
        assert!(config.validate().is_err());
    }
}
