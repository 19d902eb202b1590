//! Daemon configuration loading.
//!
//! TOML is the sole config source.  Every option has a default so a missing
//! file yields a runnable (if not very useful) daemon; a present file is
//! validated strictly.
//!
//! Default config path: `/etc/tv-daemon/daemon.toml`.

use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tv-daemon/daemon.toml";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Daemon log file; stderr when unset.
    pub log_path: Option<String>,
    pub log_level: String,
    /// Root under which per-stream feedback directories are created.
    pub feedback_dir: String,
    pub pid_file: String,
    /// Advertised to subscribers via `client_get_server_info`.
    pub bandwidth_host: String,
    /// Upstream control endpoint.
    pub control_bind: String,
    /// Subscriber endpoint.
    pub subscribers_bind: String,
    /// TOML subscriber directory; the daemon serves zero users without it.
    pub users_file: Option<String>,
    /// Worker executable; a sibling `stream-worker` of the daemon binary
    /// when unset.
    pub worker_binary: Option<String>,
    /// Cadence of the aggregate `statistic_service` broadcast.
    pub stats_interval_secs: u64,
    /// Cadence of subscriber liveness pings.
    pub ping_timeout_clients_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            log_path: None,
            log_level: "info".to_owned(),
            feedback_dir: "/var/lib/tv-daemon/feedback".to_owned(),
            pid_file: "/run/tv-daemon/daemon.pid".to_owned(),
            bandwidth_host: "0.0.0.0:5000".to_owned(),
            control_bind: "127.0.0.1:6317".to_owned(),
            subscribers_bind: "0.0.0.0:6000".to_owned(),
            users_file: None,
            worker_binary: None,
            stats_interval_secs: 10,
            ping_timeout_clients_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    log_path: Option<String>,
    log_level: Option<String>,
    feedback_dir: Option<String>,
    pid_file: Option<String>,
    bandwidth_host: Option<String>,
    control_bind: Option<String>,
    subscribers_bind: Option<String>,
    users_file: Option<String>,
    worker_binary: Option<String>,
    stats_interval_secs: Option<u64>,
    ping_timeout_clients_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(String),
    #[error("parsing config file: {0}")]
    Parse(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Load from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("'{}': {}", path.display(), e)))?;
    load_config_from_str(&text)
}

pub fn load_config_from_str(text: &str) -> Result<DaemonConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = DaemonConfig::default();

    let stats_interval_secs = raw.stats_interval_secs.unwrap_or(defaults.stats_interval_secs);
    if stats_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "stats_interval_secs must be positive".to_owned(),
        ));
    }
    let ping_timeout_clients_secs = raw
        .ping_timeout_clients_secs
        .unwrap_or(defaults.ping_timeout_clients_secs);
    if ping_timeout_clients_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "ping_timeout_clients_secs must be positive".to_owned(),
        ));
    }

    Ok(DaemonConfig {
        log_path: raw.log_path,
        log_level: raw.log_level.unwrap_or(defaults.log_level),
        feedback_dir: raw.feedback_dir.unwrap_or(defaults.feedback_dir),
        pid_file: raw.pid_file.unwrap_or(defaults.pid_file),
        bandwidth_host: raw.bandwidth_host.unwrap_or(defaults.bandwidth_host),
        control_bind: raw.control_bind.unwrap_or(defaults.control_bind),
        subscribers_bind: raw.subscribers_bind.unwrap_or(defaults.subscribers_bind),
        users_file: raw.users_file,
        worker_binary: raw.worker_binary,
        stats_interval_secs,
        ping_timeout_clients_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.control_bind, "127.0.0.1:6317");
        assert_eq!(cfg.stats_interval_secs, 10);
        assert_eq!(cfg.ping_timeout_clients_secs, 60);
        assert!(cfg.users_file.is_none());
    }

    #[test]
    fn values_override_defaults() {
        let cfg = load_config_from_str(
            r#"
            log_level = "debug"
            feedback_dir = "/data/feedback"
            bandwidth_host = "stream.example.com:5000"
            control_bind = "127.0.0.1:7000"
            users_file = "/etc/tv-daemon/users.toml"
            stats_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.feedback_dir, "/data/feedback");
        assert_eq!(cfg.bandwidth_host, "stream.example.com:5000");
        assert_eq!(cfg.control_bind, "127.0.0.1:7000");
        assert_eq!(cfg.users_file.as_deref(), Some("/etc/tv-daemon/users.toml"));
        assert_eq!(cfg.stats_interval_secs, 5);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(load_config_from_str("stats_interval_secs = 0").is_err());
        assert!(load_config_from_str("ping_timeout_clients_secs = 0").is_err());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            load_config_from_str("not toml ["),
            Err(ConfigError::Parse(_))
        ));
    }
}
