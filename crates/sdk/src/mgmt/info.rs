use serde::{Deserialize, Serialize};

/// Descriptive attributes a managed device reports when it registers for
/// device management.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptive_location: Option<String>,
}
