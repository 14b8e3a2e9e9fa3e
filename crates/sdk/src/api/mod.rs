//! REST client for the platform's `api/v0002` endpoints.
//!
//! [`ApiClient`] sits on top of a [`RestTransport`]. [`HttpTransport`] is the
//! `reqwest` implementation authenticating with an API key and token; tests
//! plug in a scripted transport instead.
//!
//! Every non-2xx answer becomes [`IotError::Api`] unless a 404 is a defined
//! outcome of the call (existence checks and optional resources, which
//! return `bool` or `Option`).
//!
//! ```ignore
//! let api = ApiClient::new(ApiConfig::new("a-myorg-k3y", "t0ken"))?;
//! if !api.registry().device_type_exists("sensor").await? {
//!     api.registry().create_device_type(&DeviceType::new("sensor")).await?;
//! }
//! println!("{:?}", api.status().service_status().await?.messaging());
//! ```

mod error;
mod mgmt;
mod registry;
mod status;

pub use error::ApiError;
pub use mgmt::{MgmtRequest, MgmtRequests, RequestParameter};
pub use registry::{
    ClientStatus, ClientStatusQuery, Device, DeviceCreateRequest, DeviceCreateResponse, DeviceLocation, DeviceType,
    DeviceUid, DiagErrorCode, DiagLog, LogEntry, Page, Registry,
};
pub use status::{RegionStatus, ServiceStatus, Status};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};
use validator::Validate;

use crate::config::{ClientConfig, DEFAULT_DOMAIN};
use crate::error::{IotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        })
    }
}

/// What came back from one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    pub reason: String,
    pub url: String,
    pub body: String,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| IotError::InvalidPayload(format!("Unable to decode API response from {}: {e}", self.url)))
    }

    pub fn into_error(self) -> IotError {
        ApiError::new(self.status, self.reason, self.url, self.body).into()
    }
}

/// Performs HTTP requests against the API root.
///
/// `path` is relative to `https://{org}.{domain}/api/v0002/`.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse>;
}

/// REST connection settings.
#[derive(Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ApiConfig {
    #[validate(length(min = 1, max = 64, message = "Organization id must be between 1 and 64 characters"))]
    pub org_id: String,

    #[validate(length(min = 1, message = "Missing required property for API key based authentication: auth-key"))]
    pub api_key: String,

    #[validate(length(min = 1, message = "Missing required property for API key based authentication: auth-token"))]
    pub api_token: String,

    #[validate(length(min = 1, max = 255, message = "Domain must be between 1 and 255 characters"))]
    pub domain: String,

    /// Can be turned off for development systems with self-signed certificates.
    pub verify_tls: bool,

    #[validate(range(min = 1, max = 600, message = "Request timeout must be between 1 and 600 seconds"))]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            org_id: String::new(),
            api_key: String::new(),
            api_token: String::new(),
            domain: DEFAULT_DOMAIN.to_string(),
            verify_tls: true,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("org_id", &self.org_id)
            .field("api_key", &self.api_key)
            .field("api_token", &"***")
            .field("domain", &self.domain)
            .field("verify_tls", &self.verify_tls)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ApiConfig {
    /// The organization id is taken from the key (`a-{org}-{suffix}`).
    pub fn new(api_key: &str, api_token: &str) -> Self {
        Self {
            org_id: api_key.split('-').nth(1).unwrap_or_default().to_string(),
            api_key: api_key.to_string(),
            api_token: api_token.to_string(),
            ..Self::default()
        }
    }

    /// REST settings matching an application's MQTT configuration.
    pub fn from_client(config: &ClientConfig) -> Result<Self> {
        let api_key = config.auth.api_key.as_deref().ok_or_else(|| {
            IotError::Configuration("Missing required property for API key based authentication: auth-key".into())
        })?;
        let api_token = config.auth.api_token.as_deref().ok_or_else(|| {
            IotError::Configuration("Missing required property for API key based authentication: auth-token".into())
        })?;
        Ok(Self {
            org_id: config.identity.org_id.clone(),
            api_key: api_key.to_string(),
            api_token: api_token.to_string(),
            domain: config.options.domain.clone(),
            ..Self::default()
        })
    }

    pub fn base_url(&self) -> String {
        format!("https://{}.{}/api/v0002/", self.org_id, self.domain)
    }
}

/// [`RestTransport`] over `reqwest` with basic authentication.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_token: String,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        config.validate()?;
        if !config.verify_tls {
            warn!(org_id = %config.org_id, "TLS certificate verification is disabled for API requests");
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            api_key: config.api_key.clone(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        let method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.api_key, Some(&self.api_token))
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await?;
        Ok(RestResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            url,
            body,
        })
    }
}

/// Entry point to the REST API.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn RestTransport>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        Ok(Self::with_transport(Arc::new(HttpTransport::new(&config)?)))
    }

    pub fn with_transport(transport: Arc<dyn RestTransport>) -> Self {
        Self { transport }
    }

    pub fn registry(&self) -> Registry<'_> {
        Registry::new(self)
    }

    pub fn status(&self) -> Status<'_> {
        Status::new(self)
    }

    pub fn mgmt(&self) -> MgmtRequests<'_> {
        MgmtRequests::new(self)
    }

    /// Sends a request and returns the answer whatever its status.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        trace!(%method, path, "API request");
        let response = self.transport.request(method, path, query, body).await?;
        debug!(%method, path, status = response.status, "API response");
        Ok(response)
    }

    /// Sends a request; any non-2xx answer is an error.
    pub(crate) async fn checked(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        let response = self.send(method, path, query, body).await?;
        if response.is_success() {
            return Ok(response);
        }
        warn!(%method, path, status = response.status, "API call failed");
        Err(response.into_error())
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.checked(Method::Get, path, query, None).await?.json()
    }

    /// GET where 404 means "not there".
    pub(crate) async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send(Method::Get, path, &[], None).await?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => response.json().map(Some),
            _ => Err(response.into_error()),
        }
    }

    pub(crate) async fn exists(&self, path: &str) -> Result<bool> {
        let response = self.send(Method::Get, path, &[], None).await?;
        match response.status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(response.into_error()),
        }
    }

    pub(crate) async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.checked(Method::Post, path, &[], Some(body)).await?.json()
    }

    pub(crate) async fn put<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.checked(Method::Put, path, &[], Some(body)).await?.json()
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        self.checked(Method::Delete, path, &[], None).await.map(|_| ())
    }
}

pub(crate) fn to_body<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| IotError::Serialization(e.to_string()))
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Recorded {
        pub method: Method,
        pub path: String,
        pub query: Vec<(String, String)>,
        pub body: Option<Value>,
    }

    /// Answers requests from a script, in order.
    #[derive(Default)]
    pub struct MockRest {
        replies: Mutex<VecDeque<(u16, String)>>,
        requests: Mutex<Vec<Recorded>>,
    }

    impl MockRest {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn reply(&self, status: u16, body: impl Into<String>) -> &Self {
            self.replies.lock().unwrap().push_back((status, body.into()));
            self
        }

        pub fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RestTransport for MockRest {
        async fn request(
            &self,
            method: Method,
            path: &str,
            query: &[(&str, String)],
            body: Option<&Value>,
        ) -> Result<RestResponse> {
            self.requests.lock().unwrap().push(Recorded {
                method,
                path: path.to_string(),
                query: query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                body: body.cloned(),
            });
            let (status, body) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((500, "no scripted reply".to_string()));
            let reason = reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default()
                .to_string();
            Ok(RestResponse {
                status,
                reason,
                url: format!("https://myorg.internetofthings.ibmcloud.com/api/v0002/{path}"),
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRest;
    use super::*;

    #[test]
    fn test_config_from_api_key() {
        let config = ApiConfig::new("a-myorg-k3y", "t0ken");
        assert_eq!(config.org_id, "myorg");
        assert_eq!(config.base_url(), "https://myorg.internetofthings.ibmcloud.com/api/v0002/");
        assert!(config.validate().is_ok());
        assert!(!format!("{config:?}").contains("t0ken"));
    }

    #[test]
    fn test_config_from_application() {
        let client = ClientConfig::application("dashboard", "a-myorg-k3y", "t0ken");
        let config = ApiConfig::from_client(&client).unwrap();
        assert_eq!(config.api_key, "a-myorg-k3y");
        assert_eq!(config.org_id, "myorg");

        let device = ClientConfig::device("myorg", "sensor", "dev-1", "secret");
        assert!(matches!(ApiConfig::from_client(&device), Err(IotError::Configuration(_))));
    }

    #[test]
    fn test_http_transport_rejects_missing_token() {
        let config = ApiConfig::new("a-myorg-k3y", "");
        let err = HttpTransport::new(&config).err().unwrap();
        assert!(err.to_string().contains("auth-token"));
    }

    #[tokio::test]
    async fn test_non_success_becomes_api_error() {
        let mock = MockRest::new();
        mock.reply(403, r#"{"message": "CUDRS0005E: Not authorized"}"#);
        let api = ApiClient::with_transport(mock.clone());

        let err = api.get::<Value>("device/types", &[]).await.unwrap_err();
        let api_err = err.as_api().unwrap();
        assert_eq!(api_err.status(), 403);
        assert_eq!(api_err.reason(), "Forbidden");
        assert_eq!(err.to_string(), "CUDRS0005E: Not authorized");
    }

    #[tokio::test]
    async fn test_optional_and_exists() {
        let mock = MockRest::new();
        mock.reply(404, "{}").reply(200, "{}").reply(404, "").reply(500, "boom");
        let api = ApiClient::with_transport(mock.clone());

        assert_eq!(api.get_optional::<Value>("a").await.unwrap(), None);
        assert!(api.exists("b").await.unwrap());
        assert!(!api.exists("c").await.unwrap());
        assert!(matches!(api.exists("d").await, Err(IotError::Api(_))));
    }

    #[tokio::test]
    async fn test_undecodable_body() {
        let mock = MockRest::new();
        mock.reply(200, "not json");
        let api = ApiClient::with_transport(mock.clone());
        assert!(matches!(api.get::<Value>("x", &[]).await, Err(IotError::InvalidPayload(_))));
    }
}
