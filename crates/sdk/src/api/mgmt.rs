//! Device management requests initiated through the REST API.
//!
//! A request names an action (`device/reboot`, `firmware/download`, ...),
//! optional parameters and the target devices. The platform delivers it to
//! each managed device over MQTT and tracks a per-device status.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{to_body, ApiClient, DeviceUid};
use crate::error::Result;

const REQUESTS: &str = "mgmt/requests";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MgmtRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<RequestParameter>,
    pub devices: Vec<DeviceUid>,
}

impl MgmtRequest {
    pub fn new(action: impl Into<String>, devices: Vec<DeviceUid>) -> Self {
        Self {
            action: action.into(),
            parameters: Vec::new(),
            devices,
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(RequestParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

pub struct MgmtRequests<'a> {
    api: &'a ApiClient,
}

impl<'a> MgmtRequests<'a> {
    pub(crate) fn new(api: &'a ApiClient) -> Self {
        Self { api }
    }

    /// Requests in progress or recently completed.
    pub async fn list(&self) -> Result<Value> {
        self.api.get(REQUESTS, &[]).await
    }

    /// Returns the platform's answer, which carries the new `reqId`.
    pub async fn initiate(&self, request: &MgmtRequest) -> Result<Value> {
        info!(action = %request.action, devices = request.devices.len(), "Initiating device management request");
        self.api.post(REQUESTS, &to_body(request)?).await
    }

    pub async fn get(&self, request_id: &str) -> Result<Value> {
        self.api.get(&format!("{REQUESTS}/{request_id}"), &[]).await
    }

    /// Clears the status of a request, completed or not.
    pub async fn delete(&self, request_id: &str) -> Result<()> {
        self.api.delete(&format!("{REQUESTS}/{request_id}")).await
    }

    pub async fn device_statuses(&self, request_id: &str) -> Result<Value> {
        self.api
            .get(&format!("{REQUESTS}/{request_id}/deviceStatus"), &[])
            .await
    }

    pub async fn device_status(&self, request_id: &str, device: &DeviceUid) -> Result<Value> {
        self.api
            .get(
                &format!(
                    "{REQUESTS}/{request_id}/deviceStatus/{}/{}",
                    device.type_id, device.device_id
                ),
                &[],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::mock::MockRest;
    use crate::api::Method;

    #[tokio::test]
    async fn test_initiate_and_follow_request() {
        let mock = MockRest::new();
        mock.reply(202, r#"{"reqId": "f8b4c0de"}"#)
            .reply(200, r#"{"id": "f8b4c0de", "action": "device/reboot", "complete": false}"#)
            .reply(200, r#"{"results": [{"typeId": "sensor", "deviceId": "a", "status": 1}]}"#)
            .reply(200, r#"{"status": 0}"#)
            .reply(204, "");
        let api = ApiClient::with_transport(mock.clone());
        let mgmt = api.mgmt();
        let device = DeviceUid::new("sensor", "a");

        let request = MgmtRequest::new("firmware/download", vec![device.clone()]).parameter("version", "2.0");
        let answer = mgmt.initiate(&request).await.unwrap();
        let req_id = answer["reqId"].as_str().unwrap();

        assert_eq!(mgmt.get(req_id).await.unwrap()["complete"], json!(false));
        assert_eq!(mgmt.device_statuses(req_id).await.unwrap()["results"][0]["status"], json!(1));
        assert_eq!(mgmt.device_status(req_id, &device).await.unwrap(), json!({"status": 0}));
        mgmt.delete(req_id).await.unwrap();

        let requests = mock.requests();
        assert_eq!(
            requests[0].body,
            Some(json!({
                "action": "firmware/download",
                "parameters": [{"name": "version", "value": "2.0"}],
                "devices": [{"typeId": "sensor", "deviceId": "a"}]
            }))
        );
        let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "mgmt/requests",
                "mgmt/requests/f8b4c0de",
                "mgmt/requests/f8b4c0de/deviceStatus",
                "mgmt/requests/f8b4c0de/deviceStatus/sensor/a",
                "mgmt/requests/f8b4c0de",
            ]
        );
        assert_eq!(requests[4].method, Method::Delete);
    }

    #[tokio::test]
    async fn test_list_failure() {
        let mock = MockRest::new();
        mock.reply(401, r#"{"message": "Unauthorized"}"#);
        let api = ApiClient::with_transport(mock.clone());
        assert_eq!(api.mgmt().list().await.unwrap_err().to_string(), "Unauthorized");
    }
}
