use std::collections::BTreeMap;

use serde::Deserialize;

use super::ApiClient;
use crate::error::Result;

/// Health of the services in one region, e.g. `"green"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegionStatus {
    pub messaging: Option<String>,
    pub dashboard: Option<String>,
    pub third_party: Option<String>,
}

/// Organization-specific service status, keyed by region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ServiceStatus(BTreeMap<String, RegionStatus>);

impl ServiceStatus {
    /// The organization's region; the platform reports exactly one.
    pub fn region(&self) -> Option<&str> {
        self.0.keys().next().map(String::as_str)
    }

    pub fn regions(&self) -> &BTreeMap<String, RegionStatus> {
        &self.0
    }

    fn current(&self) -> Option<&RegionStatus> {
        self.0.values().next()
    }

    pub fn messaging(&self) -> Option<&str> {
        self.current()?.messaging.as_deref()
    }

    pub fn dashboard(&self) -> Option<&str> {
        self.current()?.dashboard.as_deref()
    }

    pub fn third_party(&self) -> Option<&str> {
        self.current()?.third_party.as_deref()
    }
}

pub struct Status<'a> {
    api: &'a ApiClient,
}

impl<'a> Status<'a> {
    pub(crate) fn new(api: &'a ApiClient) -> Self {
        Self { api }
    }

    pub async fn service_status(&self) -> Result<ServiceStatus> {
        self.api.get("service-status", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockRest;

    #[tokio::test]
    async fn test_service_status() {
        let mock = MockRest::new();
        mock.reply(
            200,
            r#"{"us": {"messaging": "green", "dashboard": "orange", "thirdParty": "green"}}"#,
        );
        let api = ApiClient::with_transport(mock.clone());

        let status = api.status().service_status().await.unwrap();
        assert_eq!(status.region(), Some("us"));
        assert_eq!(status.messaging(), Some("green"));
        assert_eq!(status.dashboard(), Some("orange"));
        assert_eq!(status.third_party(), Some("green"));
        assert_eq!(mock.requests()[0].path, "service-status");
    }

    #[tokio::test]
    async fn test_service_status_failure() {
        let mock = MockRest::new();
        mock.reply(503, "");
        let api = ApiClient::with_transport(mock.clone());

        let err = api.status().service_status().await.unwrap_err();
        assert_eq!(err.as_api().map(|e| e.status()), Some(503));
    }
}
