//! Client settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file (`AGENT_STREAM_CONFIG`, default `agent-stream.toml`), then
//! `AGENT_STREAM_*` environment variables (`__` separates nested keys).

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use shared_types::{ConnectionConfig, DEFAULT_HEALTH_PATH, DEFAULT_QUERY_PATH, DEFAULT_STREAM_PATH};

use crate::protocol::PatchLimits;
use crate::transport::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_SETTINGS_PATH: &str = "agent-stream.toml";
pub const SETTINGS_PATH_ENV: &str = "AGENT_STREAM_CONFIG";
pub const ENV_PREFIX: &str = "AGENT_STREAM";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub stream_path: String,
    pub query_path: String,
    pub health_path: String,

    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub timeout_ms: u64,

    pub max_children: usize,
    pub max_table_rows: usize,
    pub max_table_columns: usize,
    pub max_chart_points: usize,
    pub max_chart_series: usize,
    pub max_map_features: usize,
    pub max_frame_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        let limits = PatchLimits::default();
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            query_path: DEFAULT_QUERY_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            reconnect_interval_ms: connection.reconnect_interval,
            max_reconnect_attempts: connection.max_reconnect_attempts,
            heartbeat_interval_ms: connection.heartbeat_interval,
            timeout_ms: connection.timeout,
            max_children: limits.max_children,
            max_table_rows: limits.max_table_rows,
            max_table_columns: limits.max_table_columns,
            max_chart_points: limits.max_chart_points,
            max_chart_series: limits.max_chart_series,
            max_map_features: limits.max_map_features,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientSettings {
    /// Loads from the file named by `AGENT_STREAM_CONFIG` (or the default
    /// path) plus the environment.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var(SETTINGS_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        Self::load_from(Some(path.as_path()))
    }

    /// Loads from an optional TOML file plus the environment. A missing file
    /// is not an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "Reading settings file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let settings: ClientSettings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SettingsError::Invalid {
                field: "base_url",
                reason: format!("'{}' is not an http(s) URL", self.base_url),
            });
        }
        for (field, value) in [
            ("stream_path", &self.stream_path),
            ("query_path", &self.query_path),
            ("health_path", &self.health_path),
        ] {
            if !value.starts_with('/') {
                return Err(SettingsError::Invalid {
                    field,
                    reason: format!("'{value}' must start with '/'"),
                });
            }
        }
        if self.max_children == 0 {
            return Err(SettingsError::Invalid {
                field: "max_children",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(SettingsError::Invalid {
                field: "max_frame_bytes",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn stream_url(&self) -> String {
        self.url(&self.stream_path)
    }

    pub fn query_url(&self) -> String {
        self.url(&self.query_path)
    }

    pub fn health_url(&self) -> String {
        self.url(&self.health_path)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_interval: self.reconnect_interval_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: self.heartbeat_interval_ms,
            timeout: self.timeout_ms,
        }
    }

    pub fn patch_limits(&self) -> PatchLimits {
        PatchLimits {
            max_children: self.max_children,
            max_table_rows: self.max_table_rows,
            max_table_columns: self.max_table_columns,
            max_chart_points: self.max_chart_points,
            max_chart_series: self.max_chart_series,
            max_map_features: self.max_map_features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_match_protocol_constants() {
        let settings = ClientSettings::default();
        assert_eq!(settings.stream_url(), "http://127.0.0.1:8000/api/agent/stream");
        assert_eq!(settings.query_url(), "http://127.0.0.1:8000/api/agent/query");
        assert_eq!(settings.health_url(), "http://127.0.0.1:8000/health");
        assert_eq!(settings.connection_config(), ConnectionConfig::default());
        assert_eq!(settings.patch_limits(), PatchLimits::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let _lock = ENV_MUTEX.lock().expect("env mutex poisoned");
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let settings =
            ClientSettings::load_from(Some(temp_dir.path().join("absent.toml").as_path())).expect("load");
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().expect("env mutex poisoned");
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("agent-stream.toml");
        std::fs::write(
            &path,
            r#"
base_url = "https://agent.example.com/"
reconnect_interval_ms = 500
max_children = 10
"#,
        )
        .expect("write settings");

        let settings = ClientSettings::load_from(Some(path.as_path())).expect("load");
        assert_eq!(settings.stream_url(), "https://agent.example.com/api/agent/stream");
        assert_eq!(settings.connection_config().reconnect_interval, 500);
        assert_eq!(settings.patch_limits().max_children, 10);
        assert_eq!(settings.max_table_rows, PatchLimits::default().max_table_rows);
    }

    #[test]
    fn test_environment_overrides_file() {
        let _lock = ENV_MUTEX.lock().expect("env mutex poisoned");
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("agent-stream.toml");
        std::fs::write(&path, "max_reconnect_attempts = 2\n").expect("write settings");

        std::env::set_var("AGENT_STREAM_MAX_RECONNECT_ATTEMPTS", "9");
        let result = ClientSettings::load_from(Some(path.as_path()));
        std::env::remove_var("AGENT_STREAM_MAX_RECONNECT_ATTEMPTS");

        assert_eq!(result.expect("load").max_reconnect_attempts, 9);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let _lock = ENV_MUTEX.lock().expect("env mutex poisoned");
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let path = temp_dir.path().join("agent-stream.toml");
        std::fs::write(&path, "base_url = \"ftp://nope\"\n").expect("write settings");
        assert!(matches!(
            ClientSettings::load_from(Some(path.as_path())),
            Err(SettingsError::Invalid { field: "base_url", .. })
        ));

        std::fs::write(&path, "stream_path = \"api/agent/stream\"\n").expect("write settings");
        assert!(matches!(
            ClientSettings::load_from(Some(path.as_path())),
            Err(SettingsError::Invalid { field: "stream_path", .. })
        ));
    }
}
