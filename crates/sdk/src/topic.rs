//! Topic grammar of the platform.
//!
//! ```text
//! iot-2/evt/{event}/fmt/{format}                         device publishes an event
//! iot-2/cmd/{command}/fmt/{format}                       device receives a command
//! iot-2/type/{type}/id/{device}/evt/{event}/fmt/{format} application/gateway scope
//! iot-2/type/{type}/id/{device}/cmd/{command}/fmt/{format}
//! iot-2/type/{type}/id/{device}/notify                   gateway notification
//! iotdm-1/{path...}                                      device management (JSON)
//! ```
//!
//! [`parse`] turns an inbound topic into a [`TopicInfo`]; [`TopicAddress`]
//! builds outbound topics. Identifiers are validated on the way out: they
//! must be non-empty and must not contain `/`, `+` or `#`.

use std::fmt;

use crate::error::{IotError, Result};

/// Wildcard subscription for every command sent to a device.
pub const DEVICE_COMMANDS: &str = "iot-2/cmd/+/fmt/+";

/// Root of the platform-to-device management topics.
pub const MANAGEMENT_ROOT: &str = "iotdm-1";

/// Management payloads are always JSON.
pub const MANAGEMENT_FORMAT: &str = "json";

const NOTIFICATION_FORMAT: &str = "json";

/// What kind of message a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Event,
    Command,
    Notification,
    Management,
}

impl MessageClass {
    fn segment(self) -> &'static str {
        match self {
            MessageClass::Event => "evt",
            MessageClass::Command => "cmd",
            MessageClass::Notification => "notify",
            MessageClass::Management => MANAGEMENT_ROOT,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageClass::Event => "event",
            MessageClass::Command => "command",
            MessageClass::Notification => "notification",
            MessageClass::Management => "management",
        };
        f.write_str(name)
    }
}

/// Where a message goes, minus its format.
///
/// `device_type`/`device_id` are `None` on the device-scoped topics a
/// device uses for itself (`iot-2/evt/...`, `iot-2/cmd/...`). For
/// management messages `id` holds the path below `iotdm-1/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAddress {
    pub class: MessageClass,
    pub device_type: Option<String>,
    pub device_id: Option<String>,
    pub id: String,
}

impl TopicAddress {
    /// An event the connected device publishes for itself.
    pub fn device_event(event_id: impl Into<String>) -> Self {
        Self {
            class: MessageClass::Event,
            device_type: None,
            device_id: None,
            id: event_id.into(),
        }
    }

    /// A command addressed to the connected device itself.
    pub fn device_command(command_id: impl Into<String>) -> Self {
        Self {
            class: MessageClass::Command,
            device_type: None,
            device_id: None,
            id: command_id.into(),
        }
    }

    /// An event on behalf of a specific device.
    pub fn event(device_type: impl Into<String>, device_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            class: MessageClass::Event,
            device_type: Some(device_type.into()),
            device_id: Some(device_id.into()),
            id: event_id.into(),
        }
    }

    /// A command for a specific device.
    pub fn command(
        device_type: impl Into<String>,
        device_id: impl Into<String>,
        command_id: impl Into<String>,
    ) -> Self {
        Self {
            class: MessageClass::Command,
            device_type: Some(device_type.into()),
            device_id: Some(device_id.into()),
            id: command_id.into(),
        }
    }

    /// Renders the concrete topic for `format`.
    pub fn topic(&self, format: &str) -> Result<String> {
        match self.class {
            MessageClass::Event | MessageClass::Command => {
                check_segment("id", &self.id)?;
                check_segment("format", format)?;
                let class = self.class.segment();
                match (&self.device_type, &self.device_id) {
                    (Some(device_type), Some(device_id)) => {
                        check_segment("device type", device_type)?;
                        check_segment("device id", device_id)?;
                        Ok(format!(
                            "iot-2/type/{device_type}/id/{device_id}/{class}/{}/fmt/{format}",
                            self.id
                        ))
                    }
                    (None, None) => Ok(format!("iot-2/{class}/{}/fmt/{format}", self.id)),
                    _ => Err(IotError::InvalidTopic(
                        "device type and device id must be given together".to_string(),
                    )),
                }
            }
            MessageClass::Notification => {
                let (Some(device_type), Some(device_id)) = (&self.device_type, &self.device_id) else {
                    return Err(IotError::InvalidTopic(
                        "notifications need a device type and id".to_string(),
                    ));
                };
                check_segment("device type", device_type)?;
                check_segment("device id", device_id)?;
                Ok(format!("iot-2/type/{device_type}/id/{device_id}/notify"))
            }
            MessageClass::Management => {
                if self.id.is_empty() || self.id.split('/').any(str::is_empty) {
                    return Err(IotError::InvalidTopic(format!("invalid management path '{}'", self.id)));
                }
                Ok(format!("{MANAGEMENT_ROOT}/{}", self.id))
            }
        }
    }
}

/// A parsed inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub address: TopicAddress,
    pub format: String,
}

impl TopicInfo {
    pub fn class(&self) -> MessageClass {
        self.address.class
    }

    pub fn device_type(&self) -> Option<&str> {
        self.address.device_type.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.address.device_id.as_deref()
    }

    /// Event id, command id, or the management path.
    pub fn id(&self) -> &str {
        &self.address.id
    }

    pub fn format(&self) -> &str {
        &self.format
    }
}

/// Parses an inbound topic.
pub fn parse(topic: &str) -> Result<TopicInfo> {
    let unsupported = || IotError::InvalidTopic(format!("unsupported topic '{topic}'"));

    if let Some(path) = topic.strip_prefix("iotdm-1/") {
        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(unsupported());
        }
        return Ok(TopicInfo {
            address: TopicAddress {
                class: MessageClass::Management,
                device_type: None,
                device_id: None,
                id: path.to_string(),
            },
            format: MANAGEMENT_FORMAT.to_string(),
        });
    }

    let parts: Vec<&str> = topic.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(unsupported());
    }

    match parts.as_slice() {
        ["iot-2", class, id, "fmt", format] => Ok(TopicInfo {
            address: TopicAddress {
                class: parse_class(class).ok_or_else(unsupported)?,
                device_type: None,
                device_id: None,
                id: id.to_string(),
            },
            format: format.to_string(),
        }),
        ["iot-2", "type", device_type, "id", device_id, class, id, "fmt", format] => Ok(TopicInfo {
            address: TopicAddress {
                class: parse_class(class).ok_or_else(unsupported)?,
                device_type: Some(device_type.to_string()),
                device_id: Some(device_id.to_string()),
                id: id.to_string(),
            },
            format: format.to_string(),
        }),
        ["iot-2", "type", device_type, "id", device_id, "notify"] => Ok(TopicInfo {
            address: TopicAddress {
                class: MessageClass::Notification,
                device_type: Some(device_type.to_string()),
                device_id: Some(device_id.to_string()),
                id: "notify".to_string(),
            },
            format: NOTIFICATION_FORMAT.to_string(),
        }),
        _ => Err(unsupported()),
    }
}

fn parse_class(segment: &str) -> Option<MessageClass> {
    match segment {
        "evt" => Some(MessageClass::Event),
        "cmd" => Some(MessageClass::Command),
        _ => None,
    }
}

/// Builds a subscription filter for scoped events or commands. Any argument
/// may be the single-level wildcard `+`.
pub fn scoped_filter(
    class: MessageClass,
    device_type: &str,
    device_id: &str,
    id: &str,
    format: &str,
) -> Result<String> {
    for (name, value) in [("device type", device_type), ("device id", device_id), ("id", id), ("format", format)] {
        if value != "+" {
            check_segment(name, value)?;
        }
    }
    match class {
        MessageClass::Event | MessageClass::Command => Ok(format!(
            "iot-2/type/{device_type}/id/{device_id}/{}/{id}/fmt/{format}",
            class.segment()
        )),
        other => Err(IotError::InvalidTopic(format!("no scoped filter for {other} topics"))),
    }
}

fn check_segment(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(IotError::InvalidTopic(format!("{name} must not be empty")));
    }
    if value.contains(['/', '+', '#']) {
        return Err(IotError::InvalidTopic(format!(
            "{name} '{value}' must not contain '/', '+' or '#'"
        )));
    }
    Ok(())
}
