//! Client configuration.
//!
//! A single `ClientConfig` describes device, gateway and application
//! connections. The sections mirror the platform's configuration files:
//!
//! ```toml
//! [identity]
//! org_id = "myorg"
//! type_id = "sensor"
//! device_id = "sensor-001"
//!
//! [auth]
//! token = "secret"
//!
//! [options]
//! domain = "internetofthings.ibmcloud.com"
//! keep_alive = 60
//!
//! [options.reconnect]
//! max_retries = 10
//! ```
//!
//! # Validation
//!
//! Field constraints are checked with the `validator` crate when
//! [`ClientConfig::validate_for`] runs; presence rules that depend on the
//! kind of client (a device needs a token, an application needs an API key)
//! are checked there as well and reported as `IotError::Configuration`.
//!
//! # Derived values
//!
//! - broker host: `{org_id}.messaging.{domain}`
//! - port: 8883 (TLS), 1883 (plain TCP) for the quickstart organization
//! - MQTT client id: `d:{org}:{type}:{device}`, `g:{org}:{type}:{device}`
//!   or `a:{org}:{app}`

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{IotError, Result};

/// Organization id of the unauthenticated quickstart service.
pub const QUICKSTART_ORG: &str = "quickstart";

/// Default platform domain.
pub const DEFAULT_DOMAIN: &str = "internetofthings.ibmcloud.com";

/// MQTT username used with device and gateway tokens.
pub const TOKEN_AUTH_USERNAME: &str = "use-token-auth";

/// The kind of client a configuration is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Device,
    Gateway,
    Application,
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    #[validate(nested)]
    pub identity: IdentityConfig,

    pub auth: AuthConfig,

    #[validate(nested)]
    pub options: OptionsConfig,
}

/// Who the client is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IdentityConfig {
    /// Organization id, or `quickstart`.
    #[validate(length(min = 1, max = 64, message = "Organization id must be between 1 and 64 characters"))]
    pub org_id: String,

    /// Device type (devices and gateways).
    pub type_id: Option<String>,

    /// Device id (devices and gateways).
    pub device_id: Option<String>,

    /// Application id (applications).
    pub app_id: Option<String>,
}

/// Credentials. Devices and gateways use `token`; applications use
/// `api_key` + `api_token`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub api_token: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("AuthConfig")
            .field("token", &redact(&self.token))
            .field("api_key", &self.api_key)
            .field("api_token", &redact(&self.api_token))
            .finish()
    }
}

/// Connection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OptionsConfig {
    /// Platform domain appended to the organization id.
    #[validate(length(min = 1, max = 255, message = "Domain must be between 1 and 255 characters"))]
    pub domain: String,

    /// Broker port. `None` selects 8883, or 1883 for quickstart.
    /// Port 1883 always means plain TCP, every other port uses TLS.
    pub port: Option<u16>,

    /// Request a clean session from the broker.
    pub clean_start: bool,

    /// Keep-alive interval in seconds.
    #[validate(range(min = 5, max = 3600, message = "Keep alive must be between 5 and 3600 seconds"))]
    pub keep_alive: u64,

    /// PEM CA bundle used to verify the broker. Platform roots are used
    /// when absent.
    #[validate(custom(function = "validate_ca_file", message = "CA file does not exist"))]
    pub ca_file: Option<String>,

    /// Maximum number of unacknowledged QoS 1/2 publishes.
    #[validate(range(min = 1, max = 1000, message = "Max inflight must be between 1 and 1000"))]
    pub max_inflight: u16,

    /// Capacity of the MQTT client's request channel.
    #[validate(range(min = 1, max = 1024, message = "Request channel capacity must be between 1 and 1024"))]
    pub request_channel_capacity: usize,

    #[validate(nested)]
    pub reconnect: ReconnectConfig,

    /// Per-request timeout for device-management actions, in seconds.
    #[validate(range(min = 1, max = 86400, message = "Action timeout must be between 1 and 86400 seconds"))]
    pub action_timeout_secs: u64,

    /// Upper bound `disconnect()` waits for in-flight publishes, in milliseconds.
    #[validate(range(max = 60000, message = "Drain timeout must not exceed 60000 ms"))]
    pub drain_timeout_ms: u64,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            port: None,
            clean_start: false,
            keep_alive: 60,
            ca_file: None,
            max_inflight: 100,
            request_channel_capacity: 10,
            reconnect: ReconnectConfig::default(),
            action_timeout_secs: 60,
            drain_timeout_ms: 5_000,
        }
    }
}

/// Bounded retry policy used by connect and automatic reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    #[validate(range(min = 1, max = 60000, message = "Initial delay must be between 1 and 60000 ms"))]
    pub initial_delay_ms: u64,

    /// Delay ceiling, in seconds.
    #[validate(range(min = 1, max = 3600, message = "Max delay must be between 1 and 3600 seconds"))]
    pub max_delay_secs: u64,

    /// Growth factor between consecutive delays.
    #[validate(range(min = 1.0, max = 10.0, message = "Multiplier must be between 1.0 and 10.0"))]
    pub multiplier: f64,

    /// Consecutive failures tolerated before giving up.
    #[validate(range(max = 1000, message = "Max retries must not exceed 1000"))]
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_secs: 60,
            multiplier: 2.0,
            max_retries: 10,
        }
    }
}

fn validate_ca_file(path: &str) -> std::result::Result<(), ValidationError> {
    let path_obj = Path::new(path);
    if path.is_empty() || !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("CA file does not exist: {path}").into()));
    }
    Ok(())
}

fn missing(field: &str) -> IotError {
    IotError::Configuration(format!("Missing {field} from configuration"))
}

impl ClientConfig {
    /// Configuration for a registered device authenticating with a token.
    pub fn device(org_id: &str, type_id: &str, device_id: &str, token: &str) -> Self {
        let mut config = Self::default();
        config.identity.org_id = org_id.to_string();
        config.identity.type_id = Some(type_id.to_string());
        config.identity.device_id = Some(device_id.to_string());
        config.auth.token = Some(token.to_string());
        config
    }

    /// Configuration for an unauthenticated quickstart device.
    pub fn quickstart(type_id: &str, device_id: &str) -> Self {
        let mut config = Self::default();
        config.identity.org_id = QUICKSTART_ORG.to_string();
        config.identity.type_id = Some(type_id.to_string());
        config.identity.device_id = Some(device_id.to_string());
        config
    }

    /// Configuration for a gateway; gateways authenticate like devices.
    pub fn gateway(org_id: &str, type_id: &str, device_id: &str, token: &str) -> Self {
        Self::device(org_id, type_id, device_id, token)
    }

    /// Configuration for an application authenticating with an API key.
    /// The organization id is derived from the key (`a-{org}-{suffix}`).
    pub fn application(app_id: &str, api_key: &str, api_token: &str) -> Self {
        let mut config = Self::default();
        config.identity.org_id = api_key.split('-').nth(1).unwrap_or_default().to_string();
        config.identity.app_id = Some(app_id.to_string());
        config.auth.api_key = Some(api_key.to_string());
        config.auth.api_token = Some(api_token.to_string());
        config
    }

    /// Reads the configuration from `WIOTP_*` environment variables.
    pub fn from_env(kind: ClientKind) -> Result<Self> {
        Self::from_lookup(kind, |name| std::env::var(name).ok())
    }

    fn from_lookup(kind: ClientKind, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| IotError::Configuration(format!("Missing {name} environment variable")))
        };
        let mut config = Self::default();

        match kind {
            ClientKind::Device | ClientKind::Gateway => {
                config.identity.org_id = required("WIOTP_IDENTITY_ORGID")?;
                config.identity.type_id = Some(required("WIOTP_IDENTITY_TYPEID")?);
                config.identity.device_id = Some(required("WIOTP_IDENTITY_DEVICEID")?);
                if !config.is_quickstart() {
                    config.auth.token = Some(required("WIOTP_AUTH_TOKEN")?);
                }
            }
            ClientKind::Application => {
                let key = lookup("WIOTP_AUTH_KEY").or_else(|| lookup("WIOTP_API_KEY"));
                let token = lookup("WIOTP_AUTH_TOKEN").or_else(|| lookup("WIOTP_API_TOKEN"));
                let key = key.ok_or_else(|| IotError::Configuration("Missing WIOTP_AUTH_KEY environment variable".into()))?;
                let token = token.ok_or_else(|| IotError::Configuration("Missing WIOTP_AUTH_TOKEN environment variable".into()))?;
                let app_id = lookup("WIOTP_IDENTITY_APPID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                config = Self::application(&app_id, &key, &token);
            }
        }

        if let Some(domain) = lookup("WIOTP_OPTIONS_DOMAIN") {
            config.options.domain = domain;
        }
        if let Some(port) = lookup("WIOTP_OPTIONS_MQTT_PORT") {
            config.options.port = Some(parse_env("WIOTP_OPTIONS_MQTT_PORT", &port)?);
        }
        if let Some(keep_alive) = lookup("WIOTP_OPTIONS_MQTT_KEEPALIVE") {
            config.options.keep_alive = parse_env("WIOTP_OPTIONS_MQTT_KEEPALIVE", &keep_alive)?;
        }
        if let Some(clean_start) = lookup("WIOTP_OPTIONS_MQTT_CLEANSTART") {
            config.options.clean_start = clean_start.eq_ignore_ascii_case("true");
        }
        config.options.ca_file = lookup("WIOTP_OPTIONS_MQTT_CAFILE");

        Ok(config)
    }

    pub fn is_quickstart(&self) -> bool {
        self.identity.org_id == QUICKSTART_ORG
    }

    /// Broker host name.
    pub fn host(&self) -> String {
        format!("{}.messaging.{}", self.identity.org_id, self.options.domain)
    }

    pub fn port(&self) -> u16 {
        match self.options.port {
            Some(port) => port,
            None if self.is_quickstart() => 1883,
            None => 8883,
        }
    }

    /// Whether the connection is wrapped in TLS.
    pub fn uses_tls(&self) -> bool {
        self.port() != 1883
    }

    /// MQTT client id for the given client kind.
    pub fn client_id(&self, kind: ClientKind) -> Result<String> {
        let org = &self.identity.org_id;
        match kind {
            ClientKind::Device | ClientKind::Gateway => {
                let type_id = self.identity.type_id.as_deref().ok_or_else(|| missing("identity.typeId"))?;
                let device_id = self.identity.device_id.as_deref().ok_or_else(|| missing("identity.deviceId"))?;
                let prefix = if kind == ClientKind::Device { "d" } else { "g" };
                Ok(format!("{prefix}:{org}:{type_id}:{device_id}"))
            }
            ClientKind::Application => {
                let app_id = self.identity.app_id.as_deref().ok_or_else(|| missing("identity.appId"))?;
                Ok(format!("a:{org}:{app_id}"))
            }
        }
    }

    /// MQTT username and password, `None` for quickstart.
    pub fn credentials(&self, kind: ClientKind) -> Option<(String, String)> {
        if self.is_quickstart() {
            return None;
        }
        match kind {
            ClientKind::Device | ClientKind::Gateway => self
                .auth
                .token
                .clone()
                .map(|token| (TOKEN_AUTH_USERNAME.to_string(), token)),
            ClientKind::Application => match (&self.auth.api_key, &self.auth.api_token) {
                (Some(key), Some(token)) => Some((key.clone(), token.clone())),
                _ => None,
            },
        }
    }

    /// Validates field constraints and the presence rules for `kind`.
    pub fn validate_for(&self, kind: ClientKind) -> Result<()> {
        self.validate()?;
        self.client_id(kind)?;

        if self.is_quickstart() {
            if kind == ClientKind::Gateway {
                return Err(IotError::Configuration(
                    "Quickstart service does not support gateways".to_string(),
                ));
            }
            if self.auth.token.is_some() {
                return Err(IotError::Configuration(
                    "Quickstart service does not support device authentication".to_string(),
                ));
            }
            return Ok(());
        }

        match kind {
            ClientKind::Device | ClientKind::Gateway => {
                if self.auth.token.is_none() {
                    return Err(missing("auth.token"));
                }
            }
            ClientKind::Application => {
                if self.auth.api_key.is_none() {
                    return Err(missing("auth.key"));
                }
                if self.auth.api_token.is_none() {
                    return Err(missing("auth.token"));
                }
            }
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| IotError::Configuration(format!("{name} must be a number")))
}
