//! Firmware description of a managed device.
//!
//! The platform encodes firmware state and update status as small integers
//! under `mgmt.firmware`:
//!
//! | state | value |   | update status        | value |
//! |-------|-------|---|----------------------|-------|
//! | Idle        | 0 | | Success              | 0 |
//! | Downloading | 1 | | InProgress           | 1 |
//! | Downloaded  | 2 | | OutOfMemory          | 2 |
//! |             |   | | ConnectionLost       | 3 |
//! |             |   | | VerificationFailed   | 4 |
//! |             |   | | UnsupportedImage     | 5 |
//! |             |   | | InvalidUri           | 6 |

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FirmwareState {
    #[default]
    Idle,
    Downloading,
    Downloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UpdateStatus {
    Success,
    InProgress,
    OutOfMemory,
    ConnectionLost,
    VerificationFailed,
    UnsupportedImage,
    InvalidUri,
}

impl UpdateStatus {
    /// Whether the status reports a failed update.
    pub fn is_failure(self) -> bool {
        !matches!(self, UpdateStatus::Success | UpdateStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCode {
    kind: &'static str,
    code: u8,
}

impl fmt::Display for UnknownCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} code {}", self.kind, self.code)
    }
}

impl std::error::Error for UnknownCode {}

impl TryFrom<u8> for FirmwareState {
    type Error = UnknownCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(FirmwareState::Idle),
            1 => Ok(FirmwareState::Downloading),
            2 => Ok(FirmwareState::Downloaded),
            code => Err(UnknownCode {
                kind: "firmware state",
                code,
            }),
        }
    }
}

impl From<FirmwareState> for u8 {
    fn from(state: FirmwareState) -> u8 {
        match state {
            FirmwareState::Idle => 0,
            FirmwareState::Downloading => 1,
            FirmwareState::Downloaded => 2,
        }
    }
}

impl TryFrom<u8> for UpdateStatus {
    type Error = UnknownCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(UpdateStatus::Success),
            1 => Ok(UpdateStatus::InProgress),
            2 => Ok(UpdateStatus::OutOfMemory),
            3 => Ok(UpdateStatus::ConnectionLost),
            4 => Ok(UpdateStatus::VerificationFailed),
            5 => Ok(UpdateStatus::UnsupportedImage),
            6 => Ok(UpdateStatus::InvalidUri),
            code => Err(UnknownCode {
                kind: "update status",
                code,
            }),
        }
    }
}

impl From<UpdateStatus> for u8 {
    fn from(status: UpdateStatus) -> u8 {
        match status {
            UpdateStatus::Success => 0,
            UpdateStatus::InProgress => 1,
            UpdateStatus::OutOfMemory => 2,
            UpdateStatus::ConnectionLost => 3,
            UpdateStatus::VerificationFailed => 4,
            UpdateStatus::UnsupportedImage => 5,
            UpdateStatus::InvalidUri => 6,
        }
    }
}

/// Firmware the platform asked the device to download and install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceFirmware {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(alias = "uri", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Checksum or signature of the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<FirmwareState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_status: Option<UpdateStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_date_time: Option<String>,
}

impl DeviceFirmware {
    /// The reported state; an unset state counts as idle.
    pub fn current_state(&self) -> FirmwareState {
        self.state.unwrap_or_default()
    }
}
