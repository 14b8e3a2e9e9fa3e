//! Agent configuration loading and validation.
//!
//! The configuration is read once at startup from a TOML file:
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [client.identity]
//! org_id = "myorg"
//! type_id = "gateway-host"
//! device_id = "host-01"
//!
//! [client.auth]
//! token = "s3cr3t"
//!
//! [client.options]
//! keep_alive = 60
//!
//! [agent]
//! status_interval_secs = 30
//! event_id = "status"
//! ```
//!
//! The path comes from `WIOTP_CONFIG`, falling back to
//! `/etc/wiotp/config.toml`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use validator::{Validate, ValidationError};
use wiotp_sdk::{ClientConfig, ClientKind};

use self::logger::LoggerConfig;

pub mod logger;

const CONFIG_ENV: &str = "WIOTP_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/wiotp/config.toml";

/// Current UTC time for the pre-subscriber print macros.
#[doc(hidden)]
pub fn timestamp() -> String {
    time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Timestamped console messages for use before the tracing subscriber is
/// installed.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// What the agent publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds between two status events.
    #[validate(range(min = 1, max = 86400, message = "Status interval must be between 1 and 86400 seconds"))]
    pub status_interval_secs: u64,

    #[validate(length(min = 1, max = 64, message = "Event id must be between 1 and 64 characters"))]
    pub event_id: String,

    /// Codec used for status events: json, text, xml or binary.
    #[validate(custom(function = "validate_status_format"))]
    pub format: String,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,
}

/// Formats the agent knows how to render its status in.
pub const STATUS_FORMATS: [&str; 4] = ["json", "text", "xml", "binary"];

fn validate_status_format(format: &str) -> Result<(), ValidationError> {
    if STATUS_FORMATS.contains(&format) {
        return Ok(());
    }
    let mut err = ValidationError::new("invalid_status_format");
    err.message = Some(format!("Unsupported status format: {format}, expected one of {}", STATUS_FORMATS.join(", ")).into());
    Err(err)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 60,
            event_id: "status".to_string(),
            format: "json".to_string(),
            qos: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Device identity and connection options.
    #[validate(nested)]
    pub client: ClientConfig,

    #[validate(nested)]
    pub agent: AgentConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load(&path)
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Reads, parses and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path)?;
        let config = Self::parse(&raw)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config
            .client
            .validate_for(ClientKind::Device)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const VALID: &str = r#"
        [logger]
        level = "debug"

        [client.identity]
        org_id = "myorg"
        type_id = "host"
        device_id = "host-01"

        [client.auth]
        token = "s3cr3t"

        [agent]
        status_interval_secs = 15
    "#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.client.identity.device_id.as_deref(), Some("host-01"));
        assert_eq!(config.agent.status_interval_secs, 15);
        assert_eq!(config.agent.event_id, "status");
        assert_eq!(config.client.port(), 8883);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::parse("[agent\nstatus_interval_secs = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_field_validation() {
        let raw = VALID.replace("status_interval_secs = 15", "status_interval_secs = 0");
        let err = Config::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("Status interval"));
    }

    #[test]
    fn test_status_format_must_be_renderable() {
        let raw = format!("{VALID}\nformat = \"yaml\"\n");
        let err = Config::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("Unsupported status format: yaml"));

        for format in STATUS_FORMATS {
            let raw = format!("{VALID}\nformat = \"{format}\"\n");
            assert_eq!(Config::parse(&raw).unwrap().agent.format, format);
        }
    }

    #[test]
    fn test_device_identity_is_required() {
        let raw = VALID.replace("token = \"s3cr3t\"", "");
        let err = Config::parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("auth.token")));
    }

    #[test]
    fn test_quickstart_needs_no_token() {
        let raw = VALID
            .replace("org_id = \"myorg\"", "org_id = \"quickstart\"")
            .replace("token = \"s3cr3t\"", "");
        let config = Config::parse(&raw).unwrap();
        assert!(config.client.is_quickstart());
        assert_eq!(config.client.port(), 1883);
    }
}
