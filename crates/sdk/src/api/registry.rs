//! Device type and device registry.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use super::{to_body, ApiClient, Method};
use crate::error::Result;
use crate::mgmt::DeviceInfo;

/// Results per page when listing.
const PAGE_SIZE: u32 = 50;

/// One page of a listing. Pass `bookmark` back to fetch the next page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub bookmark: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl<T> Page<T> {
    /// `meta.total_rows`, when the platform reported it.
    pub fn total_rows(&self) -> Option<u64> {
        self.meta.as_ref()?.get("total_rows")?.as_u64()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceType {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `Device` or `Gateway`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DeviceType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUid {
    pub type_id: String,
    pub device_id: String,
}

impl DeviceUid {
    pub fn new(type_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            device_id: device_id.into(),
        }
    }

    fn path(&self) -> String {
        format!("device/types/{}/devices/{}", self.type_id, self.device_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub type_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<Value>,
}

impl Device {
    pub fn uid(&self) -> DeviceUid {
        DeviceUid::new(&self.type_id, &self.device_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_date_time: Option<String>,
}

/// A device to register. The platform generates a token when none is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCreateRequest {
    pub type_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<DeviceLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DeviceCreateRequest {
    pub fn new(type_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }
}

/// Per-device outcome of a bulk registration. Record `auth_token`: the
/// platform cannot return it again.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceCreateResponse {
    pub type_id: String,
    pub device_id: String,
    pub success: Option<bool>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: String,
}

/// Second-precision RFC 3339 time; the diagnostics API rejects fractions.
fn diag_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0)
        .unwrap_or(now)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// A diagnostic log entry stored against a device. `id`, `type_id` and
/// `device_id` are only present on entries read back from the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagLog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
    /// 0 informational, 1 warning, 2 error.
    pub severity: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl DiagLog {
    pub fn new(message: impl Into<String>, severity: u8) -> Self {
        Self {
            message: message.into(),
            severity,
            timestamp: diag_timestamp(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagErrorCode {
    pub error_code: i64,
    pub timestamp: String,
}

impl DiagErrorCode {
    pub fn new(error_code: i64) -> Self {
        Self {
            error_code,
            timestamp: diag_timestamp(),
        }
    }
}

/// Connection state of one MQTT client as the platform last saw it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientStatus {
    /// Client id, e.g. `d:myorg:sensor:a`.
    pub id: String,
    /// `connected` or `disconnected`.
    pub connection_status: Option<String>,
    pub connected_at: Option<String>,
    pub disconnected_at: Option<String>,
    pub last_activity_date_time: Option<String>,
    pub last_connected_date_time: Option<String>,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        self.connection_status.as_deref() == Some("connected")
    }
}

/// Filters for [`Registry::client_statuses`]; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatusQuery {
    pub type_id: Option<String>,
    pub device_id: Option<String>,
    pub connection_status: Option<String>,
    /// RFC 3339 instant.
    pub connected_after: Option<String>,
}

impl ClientStatusQuery {
    fn params(&self) -> Vec<(&'static str, String)> {
        [
            ("deviceType", &self.type_id),
            ("deviceId", &self.device_id),
            ("connectionStatus", &self.connection_status),
            ("connectedAfter", &self.connected_after),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name, v)))
        .collect()
    }
}

/// Registry operations, from [`ApiClient::registry`].
pub struct Registry<'a> {
    api: &'a ApiClient,
}

impl<'a> Registry<'a> {
    pub(crate) fn new(api: &'a ApiClient) -> Self {
        Self { api }
    }

    pub async fn list_device_types(&self, bookmark: Option<&str>) -> Result<Page<DeviceType>> {
        self.api.get("device/types", &page_query(bookmark)).await
    }

    pub async fn device_type(&self, type_id: &str) -> Result<Option<DeviceType>> {
        self.api.get_optional(&format!("device/types/{type_id}")).await
    }

    pub async fn device_type_exists(&self, type_id: &str) -> Result<bool> {
        self.api.exists(&format!("device/types/{type_id}")).await
    }

    pub async fn create_device_type(&self, device_type: &DeviceType) -> Result<DeviceType> {
        debug!(type_id = %device_type.id, "Creating device type");
        self.api.post("device/types", &to_body(device_type)?).await
    }

    pub async fn update_device_type(
        &self,
        type_id: &str,
        description: Option<&str>,
        device_info: Option<&DeviceInfo>,
        metadata: Option<&Value>,
    ) -> Result<DeviceType> {
        let body = json!({
            "description": description,
            "deviceInfo": device_info.map(to_body).transpose()?,
            "metadata": metadata,
        });
        self.api.put(&format!("device/types/{type_id}"), &body).await
    }

    pub async fn delete_device_type(&self, type_id: &str) -> Result<()> {
        debug!(type_id, "Deleting device type");
        self.api.delete(&format!("device/types/{type_id}")).await
    }

    /// Lists devices of one type, or of every type when `type_id` is `None`.
    pub async fn list_devices(&self, type_id: Option<&str>, bookmark: Option<&str>) -> Result<Page<Device>> {
        let path = match type_id {
            Some(type_id) => format!("device/types/{type_id}/devices"),
            None => "bulk/devices".to_string(),
        };
        self.api.get(&path, &page_query(bookmark)).await
    }

    /// Follows bookmarks until the listing is exhausted.
    pub async fn all_devices(&self, type_id: Option<&str>) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        let mut bookmark: Option<String> = None;
        loop {
            let page = self.list_devices(type_id, bookmark.as_deref()).await?;
            let exhausted = page.results.is_empty() || page.bookmark.is_none() || page.bookmark == bookmark;
            devices.extend(page.results);
            if exhausted {
                return Ok(devices);
            }
            bookmark = page.bookmark;
        }
    }

    pub async fn device(&self, uid: &DeviceUid) -> Result<Option<Device>> {
        self.api.get_optional(&uid.path()).await
    }

    pub async fn device_exists(&self, uid: &DeviceUid) -> Result<bool> {
        self.api.exists(&uid.path()).await
    }

    /// Registers devices in bulk; each request may carry at most 512 KB.
    pub async fn create_devices(&self, devices: &[DeviceCreateRequest]) -> Result<Vec<DeviceCreateResponse>> {
        debug!(count = devices.len(), "Registering devices");
        self.api.post("bulk/devices/add", &to_body(&devices)?).await
    }

    pub async fn update_device(
        &self,
        uid: &DeviceUid,
        metadata: Option<&Value>,
        device_info: Option<&DeviceInfo>,
        status: Option<&Value>,
    ) -> Result<Device> {
        let body = json!({
            "status": status,
            "deviceInfo": device_info.map(to_body).transpose()?,
            "metadata": metadata,
        });
        self.api.put(&uid.path(), &body).await
    }

    /// Removes one device. Returns `false` when it was not registered.
    pub async fn delete_device(&self, uid: &DeviceUid) -> Result<bool> {
        let response = self.api.send(Method::Delete, &uid.path(), &[], None).await?;
        match response.status {
            404 => Ok(false),
            _ if response.is_success() => Ok(true),
            _ => Err(response.into_error()),
        }
    }

    pub async fn delete_devices(&self, devices: &[DeviceUid]) -> Result<Value> {
        debug!(count = devices.len(), "Removing devices");
        self.api.post("bulk/devices/remove", &to_body(&devices)?).await
    }

    /// `None` when the device never reported a location.
    pub async fn device_location(&self, uid: &DeviceUid) -> Result<Option<DeviceLocation>> {
        self.api.get_optional(&format!("{}/location", uid.path())).await
    }

    pub async fn set_device_location(&self, uid: &DeviceUid, location: &DeviceLocation) -> Result<DeviceLocation> {
        self.api
            .put(&format!("{}/location", uid.path()), &to_body(location)?)
            .await
    }

    /// Device-management state, `None` for unmanaged devices.
    pub async fn device_management(&self, uid: &DeviceUid) -> Result<Option<Value>> {
        self.api.get_optional(&format!("{}/mgmt", uid.path())).await
    }

    pub async fn connection_logs(&self, uid: &DeviceUid) -> Result<Vec<LogEntry>> {
        let query = [("typeId", uid.type_id.clone()), ("deviceId", uid.device_id.clone())];
        self.api.get("logs/connection", &query).await
    }

    pub async fn diag_logs(&self, uid: &DeviceUid) -> Result<Vec<DiagLog>> {
        self.api.get(&format!("{}/diag/logs", uid.path()), &[]).await
    }

    pub async fn diag_log(&self, uid: &DeviceUid, log_id: &str) -> Result<Option<DiagLog>> {
        self.api
            .get_optional(&format!("{}/diag/logs/{log_id}", uid.path()))
            .await
    }

    pub async fn diag_log_exists(&self, uid: &DeviceUid, log_id: &str) -> Result<bool> {
        self.api.exists(&format!("{}/diag/logs/{log_id}", uid.path())).await
    }

    pub async fn add_diag_log(&self, uid: &DeviceUid, log: &DiagLog) -> Result<()> {
        let path = format!("{}/diag/logs", uid.path());
        self.api
            .checked(Method::Post, &path, &[], Some(&to_body(log)?))
            .await
            .map(|_| ())
    }

    /// Removes one log entry. Returns `false` when it did not exist.
    pub async fn delete_diag_log(&self, uid: &DeviceUid, log_id: &str) -> Result<bool> {
        let path = format!("{}/diag/logs/{log_id}", uid.path());
        let response = self.api.send(Method::Delete, &path, &[], None).await?;
        match response.status {
            404 => Ok(false),
            _ if response.is_success() => Ok(true),
            _ => Err(response.into_error()),
        }
    }

    pub async fn clear_diag_logs(&self, uid: &DeviceUid) -> Result<()> {
        self.api.delete(&format!("{}/diag/logs", uid.path())).await
    }

    pub async fn diag_error_codes(&self, uid: &DeviceUid) -> Result<Vec<DiagErrorCode>> {
        self.api
            .get(&format!("{}/diag/errorCodes", uid.path()), &[])
            .await
    }

    pub async fn add_diag_error_code(&self, uid: &DeviceUid, code: &DiagErrorCode) -> Result<()> {
        let path = format!("{}/diag/errorCodes", uid.path());
        self.api
            .checked(Method::Post, &path, &[], Some(&to_body(code)?))
            .await
            .map(|_| ())
    }

    pub async fn clear_diag_error_codes(&self, uid: &DeviceUid) -> Result<()> {
        self.api
            .delete(&format!("{}/diag/errorCodes", uid.path()))
            .await
    }

    /// One page of client connection states matching `query`.
    pub async fn client_statuses(
        &self,
        query: &ClientStatusQuery,
        bookmark: Option<&str>,
    ) -> Result<Page<ClientStatus>> {
        let mut params = page_query(bookmark);
        params.extend(query.params());
        self.api.get("clientconnectionstates", &params).await
    }

    /// `None` when the platform holds no state for `client_id`.
    pub async fn client_status(&self, client_id: &str) -> Result<Option<ClientStatus>> {
        self.api
            .get_optional(&format!("clientconnectionstates/{client_id}"))
            .await
    }

    pub async fn client_status_exists(&self, client_id: &str) -> Result<bool> {
        self.api
            .exists(&format!("clientconnectionstates/{client_id}"))
            .await
    }
}

fn page_query(bookmark: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = vec![("_limit", PAGE_SIZE.to_string())];
    if let Some(bookmark) = bookmark {
        query.push(("_bookmark", bookmark.to_string()));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockRest;
    use crate::error::IotError;

    #[tokio::test]
    async fn test_device_type_lifecycle() {
        let mock = MockRest::new();
        mock.reply(404, r#"{"message": "CUDRS0019E: Device type not found"}"#)
            .reply(201, r#"{"id": "sensor", "classId": "Device", "description": "Temp sensor"}"#)
            .reply(200, r#"{"id": "sensor", "description": "Cold sensor"}"#)
            .reply(204, "");
        let api = ApiClient::with_transport(mock.clone());
        let registry = api.registry();

        assert!(!registry.device_type_exists("sensor").await.unwrap());
        let created = registry
            .create_device_type(&DeviceType {
                description: Some("Temp sensor".into()),
                ..DeviceType::new("sensor")
            })
            .await
            .unwrap();
        assert_eq!(created.class_id.as_deref(), Some("Device"));
        let updated = registry
            .update_device_type("sensor", Some("Cold sensor"), None, None)
            .await
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("Cold sensor"));
        registry.delete_device_type("sensor").await.unwrap();

        let requests = mock.requests();
        assert_eq!(requests[1].method, Method::Post);
        assert_eq!(
            requests[1].body,
            Some(serde_json::json!({"id": "sensor", "description": "Temp sensor"}))
        );
        assert_eq!(requests[2].path, "device/types/sensor");
        assert_eq!(requests[2].body.as_ref().unwrap()["description"], "Cold sensor");
        assert_eq!(requests[3].method, Method::Delete);
    }

    #[tokio::test]
    async fn test_paged_device_listing() {
        let mock = MockRest::new();
        mock.reply(
            200,
            r#"{"results": [{"typeId": "sensor", "deviceId": "a"}], "bookmark": "b1", "meta": {"total_rows": 2}}"#,
        )
        .reply(200, r#"{"results": [{"typeId": "sensor", "deviceId": "b"}]}"#);
        let api = ApiClient::with_transport(mock.clone());

        let devices = api.registry().all_devices(Some("sensor")).await.unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let requests = mock.requests();
        assert_eq!(requests[0].path, "device/types/sensor/devices");
        assert_eq!(requests[0].query, vec![("_limit".to_string(), "50".to_string())]);
        assert_eq!(
            requests[1].query,
            vec![
                ("_limit".to_string(), "50".to_string()),
                ("_bookmark".to_string(), "b1".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_total_rows_across_types() {
        let mock = MockRest::new();
        mock.reply(200, r#"{"results": [], "meta": {"total_rows": 0}}"#);
        let api = ApiClient::with_transport(mock.clone());

        let page = api.registry().list_devices(None, None).await.unwrap();
        assert_eq!(page.total_rows(), Some(0));
        assert_eq!(mock.requests()[0].path, "bulk/devices");
    }

    #[tokio::test]
    async fn test_bulk_create_and_delete() {
        let mock = MockRest::new();
        mock.reply(
            201,
            r#"[{"typeId": "sensor", "deviceId": "a", "success": true, "authToken": "generated"}]"#,
        )
        .reply(202, r#"[{"typeId": "sensor", "deviceId": "a", "success": true}]"#);
        let api = ApiClient::with_transport(mock.clone());

        let created = api
            .registry()
            .create_devices(&[DeviceCreateRequest::new("sensor", "a")])
            .await
            .unwrap();
        assert_eq!(created[0].auth_token.as_deref(), Some("generated"));

        api.registry()
            .delete_devices(&[DeviceUid::new("sensor", "a")])
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests[0].path, "bulk/devices/add");
        assert_eq!(
            requests[0].body,
            Some(serde_json::json!([{"typeId": "sensor", "deviceId": "a"}]))
        );
        assert_eq!(requests[1].path, "bulk/devices/remove");
    }

    #[tokio::test]
    async fn test_optional_device_resources() {
        let mock = MockRest::new();
        mock.reply(404, "")
            .reply(200, r#"{"latitude": 1.5, "longitude": 2.5, "measuredDateTime": "2024-01-01T00:00:00Z"}"#)
            .reply(404, "")
            .reply(200, r#"[{"message": "Connected", "timestamp": "2024-01-01T00:00:00Z"}]"#)
            .reply(404, "");
        let api = ApiClient::with_transport(mock.clone());
        let registry = api.registry();
        let uid = DeviceUid::new("sensor", "a");

        assert_eq!(registry.device_location(&uid).await.unwrap(), None);
        let location = registry
            .set_device_location(&uid, &DeviceLocation { latitude: 1.5, longitude: 2.5, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(location.measured_date_time.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(registry.device_management(&uid).await.unwrap(), None);
        assert_eq!(registry.connection_logs(&uid).await.unwrap()[0].message, "Connected");
        assert!(!registry.delete_device(&uid).await.unwrap());

        let requests = mock.requests();
        assert_eq!(requests[1].path, "device/types/sensor/devices/a/location");
        assert_eq!(requests[3].path, "logs/connection");
        assert_eq!(
            requests[3].query,
            vec![
                ("typeId".to_string(), "sensor".to_string()),
                ("deviceId".to_string(), "a".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_update_is_api_error() {
        let mock = MockRest::new();
        mock.reply(400, r#"{"message": "CUDRS0007E: The request was not valid."}"#);
        let api = ApiClient::with_transport(mock.clone());

        let err = api
            .registry()
            .update_device(&DeviceUid::new("sensor", "a"), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IotError::Api(ref e) if e.status() == 400));
    }

    #[tokio::test]
    async fn test_diagnostic_logs() {
        let mock = MockRest::new();
        mock.reply(201, "")
            .reply(
                200,
                r#"[{"id": "l1", "message": "disk full", "severity": 2, "data": "sda1",
                     "timestamp": "2024-01-01T00:00:00Z", "typeId": "sensor", "deviceId": "a"}]"#,
            )
            .reply(404, "")
            .reply(404, "")
            .reply(204, "");
        let api = ApiClient::with_transport(mock.clone());
        let registry = api.registry();
        let uid = DeviceUid::new("sensor", "a");

        let log = DiagLog {
            data: Some("sda1".into()),
            ..DiagLog::new("disk full", 2)
        };
        assert!(!log.timestamp.contains('.'));
        registry.add_diag_log(&uid, &log).await.unwrap();

        let logs = registry.diag_logs(&uid).await.unwrap();
        assert_eq!(logs[0].id.as_deref(), Some("l1"));
        assert_eq!(logs[0].severity, 2);
        assert!(!registry.diag_log_exists(&uid, "l2").await.unwrap());
        assert!(!registry.delete_diag_log(&uid, "l2").await.unwrap());
        registry.clear_diag_logs(&uid).await.unwrap();

        let requests = mock.requests();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].path, "device/types/sensor/devices/a/diag/logs");
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["message"], "disk full");
        assert_eq!(body["data"], "sda1");
        assert!(body.get("id").is_none());
        assert_eq!(requests[2].path, "device/types/sensor/devices/a/diag/logs/l2");
        assert_eq!(requests[4].method, Method::Delete);
        assert_eq!(requests[4].path, "device/types/sensor/devices/a/diag/logs");
    }

    #[tokio::test]
    async fn test_diagnostic_error_codes() {
        let mock = MockRest::new();
        mock.reply(201, "")
            .reply(200, r#"[{"errorCode": 12, "timestamp": "2024-01-01T00:00:00Z"}]"#)
            .reply(500, r#"{"message": "CUDRS0000E: Internal error"}"#);
        let api = ApiClient::with_transport(mock.clone());
        let registry = api.registry();
        let uid = DeviceUid::new("sensor", "a");

        registry
            .add_diag_error_code(&uid, &DiagErrorCode::new(12))
            .await
            .unwrap();
        let codes = registry.diag_error_codes(&uid).await.unwrap();
        assert_eq!(codes, vec![DiagErrorCode { error_code: 12, timestamp: "2024-01-01T00:00:00Z".into() }]);

        let err = registry.clear_diag_error_codes(&uid).await.unwrap_err();
        assert!(matches!(err, IotError::Api(ref e) if e.status() == 500));

        let requests = mock.requests();
        assert_eq!(requests[0].path, "device/types/sensor/devices/a/diag/errorCodes");
        assert_eq!(requests[0].body.as_ref().unwrap()["errorCode"], 12);
        assert_eq!(requests[2].method, Method::Delete);
    }

    #[tokio::test]
    async fn test_client_connection_states() {
        let mock = MockRest::new();
        mock.reply(
            200,
            r#"{"results": [{"id": "d:myorg:sensor:a", "connectionStatus": "connected",
                             "connectedAt": "2024-01-01T00:00:00Z"}]}"#,
        )
        .reply(404, "")
        .reply(200, r#"{"id": "d:myorg:sensor:b", "connectionStatus": "disconnected"}"#);
        let api = ApiClient::with_transport(mock.clone());
        let registry = api.registry();

        let query = ClientStatusQuery {
            type_id: Some("sensor".into()),
            connection_status: Some("connected".into()),
            ..Default::default()
        };
        let page = registry.client_statuses(&query, None).await.unwrap();
        assert!(page.results[0].is_connected());
        assert_eq!(page.results[0].connected_at.as_deref(), Some("2024-01-01T00:00:00Z"));

        assert_eq!(registry.client_status("d:myorg:sensor:x").await.unwrap(), None);
        let status = registry.client_status("d:myorg:sensor:b").await.unwrap().unwrap();
        assert!(!status.is_connected());

        let requests = mock.requests();
        assert_eq!(requests[0].path, "clientconnectionstates");
        assert_eq!(
            requests[0].query,
            vec![
                ("_limit".to_string(), "50".to_string()),
                ("deviceType".to_string(), "sensor".to_string()),
                ("connectionStatus".to_string(), "connected".to_string())
            ]
        );
        assert_eq!(requests[2].path, "clientconnectionstates/d:myorg:sensor:b");
    }
}
