//! TOML Configuration File Support
//!
//! Centralized configuration loading for the grid streamer, backed by a TOML
//! file at `~/.config/grid-streamer/streamer.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`], applied by the caller)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:3000"
//! max_connections = 200
//! max_frame_size = 1048576
//!
//! [store]
//! data_dir = "/var/lib/grid-streamer/simulations"
//!
//! [stream]
//! end_on_failed_run = false
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::StreamConfig;

/// Default listen address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3000";

/// Default connection limit
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default maximum inbound frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind_address: Option<String>,

    /// Maximum simultaneous client connections
    pub max_connections: Option<usize>,

    /// Maximum inbound frame size in bytes
    pub max_frame_size: Option<usize>,
}

/// Store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Directory holding one sub-directory per simulation
    pub data_dir: Option<PathBuf>,
}

/// Stream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// End the stream when the run reports `failed`
    pub end_on_failed_run: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerToml {
    /// Server section
    pub server: ServerToml,

    /// Store section
    pub store: StoreToml,

    /// Stream section
    pub stream: StreamToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration for the grid streamer
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Listen address
    pub bind_address: SocketAddr,

    /// Maximum simultaneous client connections
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes
    pub max_frame_size: usize,

    /// Result store data directory
    pub data_dir: PathBuf,

    /// Per-session streaming behaviour
    pub stream: StreamConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            data_dir: default_data_dir(),
            stream: StreamConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StreamerConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Apply CLI overrides (highest priority)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is invalid.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(bind) = &overrides.bind_address {
            self.bind_address = parse_bind_address(bind)?;
            self.source = ConfigSource::Cli;
        }
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
            self.source = ConfigSource::Cli;
        }
        if let Some(max) = overrides.max_connections {
            self.max_connections = max;
            self.source = ConfigSource::Cli;
        }
        if let Some(end) = overrides.end_on_failed_run {
            self.stream.end_on_failed_run = end;
            self.source = ConfigSource::Cli;
        }
        self.validate()
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size < 64 {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be at least 64 bytes, got {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

/// Overrides supplied on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// `--bind`
    pub bind_address: Option<String>,
    /// `--data-dir`
    pub data_dir: Option<PathBuf>,
    /// `--max-connections`
    pub max_connections: Option<usize>,
    /// `--end-on-failed-run`
    pub end_on_failed_run: Option<bool>,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/grid-streamer/streamer.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("grid-streamer").join("streamer.toml"))
}

/// Default data directory (`$XDG_DATA_HOME/grid-streamer/simulations`)
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("grid-streamer")
        .join("simulations")
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<StreamerConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamerConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or a value is invalid.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<StreamerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = StreamerConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamerToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

fn parse_bind_address(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse()
        .map_err(|e| ConfigError::ValidationError(format!("bind_address {raw:?}: {e}")))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut StreamerConfig, toml: &StreamerToml) -> Result<(), ConfigError> {
    if let Some(bind) = &toml.server.bind_address {
        config.bind_address = parse_bind_address(bind)?;
    }
    if let Some(max) = toml.server.max_connections {
        config.max_connections = max;
    }
    if let Some(size) = toml.server.max_frame_size {
        config.max_frame_size = size;
    }
    if let Some(dir) = &toml.store.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(end) = toml.stream.end_on_failed_run {
        config.stream.end_on_failed_run = end;
    }
    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut StreamerConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(bind) = env("GRID_STREAMER_BIND") {
        config.bind_address = parse_bind_address(&bind)?;
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("GRID_STREAMER_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env("GRID_STREAMER_MAX_CONNECTIONS") {
        if let Ok(n) = max.parse::<usize>() {
            config.max_connections = n;
            config.source = ConfigSource::Env;
        } else {
            tracing::warn!(value = %max, "Ignoring unparseable GRID_STREAMER_MAX_CONNECTIONS");
        }
    }
    if let Some(end) = env("GRID_STREAMER_END_ON_FAILED_RUN") {
        if let Some(flag) = parse_bool(&end) {
            config.stream.end_on_failed_run = flag;
            config.source = ConfigSource::Env;
        } else {
            tracing::warn!(value = %end, "Ignoring unparseable GRID_STREAMER_END_ON_FAILED_RUN");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = load_config_with_env(None, no_env).unwrap();
        assert_eq!(config.bind_address.to_string(), DEFAULT_BIND_ADDRESS);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(!config.stream.end_on_failed_run);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_with_env(Some(PathBuf::from("/nonexistent/streamer.toml")), no_env)
                .unwrap();
        assert!(config.config_file_path.is_none());
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_file_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_address = "0.0.0.0:9000"
max_connections = 5

[store]
data_dir = "/srv/sims"

[stream]
end_on_failed_run = true
"#
        )
        .unwrap();

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.data_dir, PathBuf::from("/srv/sims"));
        assert!(config.stream.end_on_failed_run);
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_connections = 5\n").unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("GRID_STREAMER_MAX_CONNECTIONS", "7"),
            ("GRID_STREAMER_END_ON_FAILED_RUN", "yes"),
        ]);
        let config = load_config_with_env(Some(file.path().to_path_buf()), |k| {
            env.get(k).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.max_connections, 7);
        assert!(config.stream.end_on_failed_run);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = load_config_with_env(None, |k| {
            (k == "GRID_STREAMER_DATA_DIR").then(|| "/from/env".to_string())
        })
        .unwrap();
        config
            .apply_overrides(&ConfigOverrides {
                data_dir: Some(PathBuf::from("/from/cli")),
                bind_address: Some("127.0.0.1:4000".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/from/cli"));
        assert_eq!(config.bind_address.port(), 4000);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\nbind_address = ").unwrap();
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_connections = 0\n").unwrap();
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = load_config_with_env(None, |k| {
            (k == "GRID_STREAMER_BIND").then(|| "not-an-address".to_string())
        });
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_unparseable_env_flag_is_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([("GRID_STREAMER_END_ON_FAILED_RUN", "ture")]);
        let config = load_config_with_env(None, |k| env.get(k).map(|v| (*v).to_string())).unwrap();

        assert!(!config.stream.end_on_failed_run);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_env_flag_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("No"), Some(false));
        assert_eq!(parse_bool("ture"), None);
        assert_eq!(parse_bool(""), None);
    }
}
