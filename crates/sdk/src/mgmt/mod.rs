//! Device management for managed devices.
//!
//! A [`ManagedDevice`] is a [`DeviceClient`] that additionally speaks the
//! platform's device-management protocol:
//!
//! - Device-originated requests (`manage`, `unmanage`, location, error
//!   codes, log entries) are published on `iotdevice-1/...` under a fresh
//!   `reqId` and completed by the platform's answer on `iotdm-1/response`.
//! - Platform-initiated actions (reboot, factory reset, firmware download
//!   and update, custom actions) arrive on `iotdm-1/...`; the device answers
//!   on `iotdevice-1/response`.
//!
//! Every exchange is tracked in an [`ActionTable`]; a background sweeper
//! expires requests that see no update within `action_timeout_secs`.
//!
//! ```ignore
//! let device = ManagedDevice::new(config, DeviceInfo::default())?;
//! device.on_device_action(|req_id, action| schedule(req_id.clone(), action));
//! device.connect().await?;
//! device.manage(3600, true, true).await?.outcome().await?;
//! ```

mod action;
mod firmware;
mod info;

pub use action::{
    ActionKind, ActionState, ActionTable, ManagedActionRequest, PendingAction, RequestId, Transition,
};
pub use firmware::{DeviceFirmware, FirmwareState, UnknownCode, UpdateStatus};
pub use info::DeviceInfo;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::device::DeviceClient;
use crate::dispatcher::{Handler, Message, Pattern};
use crate::error::{IotError, Result};
use crate::topic::MANAGEMENT_ROOT;
use crate::transport::{EventSource, Transport};

const MANAGE_TOPIC: &str = "iotdevice-1/mgmt/manage";
const UNMANAGE_TOPIC: &str = "iotdevice-1/mgmt/unmanage";
const UPDATE_LOCATION_TOPIC: &str = "iotdevice-1/device/update/location";
const ADD_ERROR_CODE_TOPIC: &str = "iotdevice-1/add/diag/errorCodes";
const CLEAR_ERROR_CODES_TOPIC: &str = "iotdevice-1/clear/diag/errorCodes";
const ADD_LOG_TOPIC: &str = "iotdevice-1/add/diag/log";
const CLEAR_LOG_TOPIC: &str = "iotdevice-1/clear/diag/log";
const NOTIFY_TOPIC: &str = "iotdevice-1/notify";
const RESPONSE_TOPIC: &str = "iotdevice-1/response";

/// Platform-to-device topics a managed device subscribes to.
pub const MANAGEMENT_TOPICS: [&str; 9] = [
    "iotdm-1/response",
    "iotdm-1/observe",
    "iotdm-1/cancel",
    "iotdm-1/mgmt/initiate/device/reboot",
    "iotdm-1/mgmt/initiate/device/factory_reset",
    "iotdm-1/device/update",
    "iotdm-1/mgmt/initiate/firmware/download",
    "iotdm-1/mgmt/initiate/firmware/update",
    "iotdm-1/mgmt/custom/#",
];

const CUSTOM_ACTION_PREFIX: &str = "mgmt/custom/";

/// Lifetimes below this are sent as 0 (never expires).
const MIN_LIFETIME_SECS: u64 = 3600;

/// A positive lifetime is renewed this long before it runs out.
const REMANAGE_MARGIN_SECS: u64 = 120;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Reboot,
    FactoryReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareAction {
    Download,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Informational,
    Warning,
    Error,
}

impl LogSeverity {
    fn code(self) -> u8 {
        match self {
            LogSeverity::Informational => 0,
            LogSeverity::Warning => 1,
            LogSeverity::Error => 2,
        }
    }
}

type DeviceActionCallback = Arc<dyn Fn(&RequestId, DeviceAction) + Send + Sync>;
type FirmwareActionCallback = Arc<dyn Fn(FirmwareAction, &DeviceFirmware) + Send + Sync>;
type CustomActionCallback = Arc<dyn Fn(&str, &Value, &RequestId) -> bool + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    device_action: Option<DeviceActionCallback>,
    firmware_action: Option<FirmwareActionCallback>,
    custom_action: Option<CustomActionCallback>,
}

#[derive(Default)]
struct Tasks {
    sweeper: Option<JoinHandle<()>>,
    remanage: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    lifetime: u64,
    device_actions: bool,
    firmware_actions: bool,
}

/// A device client with device-management support.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ManagedDevice {
    shared: Arc<Shared>,
}

struct Shared {
    device: DeviceClient,
    actions: Arc<ActionTable>,
    info: RwLock<DeviceInfo>,
    firmware: RwLock<DeviceFirmware>,
    metadata: RwLock<Value>,
    ready: watch::Sender<bool>,
    callbacks: RwLock<Callbacks>,
    tasks: Mutex<Tasks>,
    cancel: CancellationToken,
}

impl ManagedDevice {
    pub fn new(config: ClientConfig, info: DeviceInfo) -> Result<Self> {
        reject_quickstart(&config)?;
        Ok(Self::wrap(DeviceClient::new(config)?, info))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: impl Transport + 'static,
        events: impl EventSource + 'static,
        info: DeviceInfo,
    ) -> Result<Self> {
        reject_quickstart(&config)?;
        Ok(Self::wrap(DeviceClient::with_transport(config, transport, events)?, info))
    }

    fn wrap(device: DeviceClient, info: DeviceInfo) -> Self {
        let timeout = Duration::from_secs(device.config().options.action_timeout_secs);
        let (ready, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            device,
            actions: Arc::new(ActionTable::new(timeout)),
            info: RwLock::new(info),
            firmware: RwLock::new(DeviceFirmware::default()),
            metadata: RwLock::new(Value::Object(Default::default())),
            ready,
            callbacks: RwLock::new(Callbacks::default()),
            tasks: Mutex::new(Tasks::default()),
            cancel: CancellationToken::new(),
        });
        register_handlers(&shared);
        Self { shared }
    }

    /// Subscribes to the management topics and connects.
    pub async fn connect(&self) -> Result<()> {
        let connection = self.shared.device.connection();
        for topic in MANAGEMENT_TOPICS {
            connection.subscribe(topic, 1).await?;
        }
        self.shared.device.connect().await?;

        let mut tasks = self.shared.tasks();
        if tasks.sweeper.is_none() {
            tasks.sweeper = Some(
                self.shared
                    .actions
                    .spawn_sweeper(SWEEP_INTERVAL, self.shared.cancel.child_token()),
            );
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.shared.cancel.cancel();
        self.shared.ready.send_replace(false);
        self.shared.actions.clear();
        self.shared.device.disconnect().await
    }

    /// Registers the device for management.
    ///
    /// `lifetime_secs` below 3600 is sent as 0 (the registration never
    /// expires). A positive lifetime is renewed automatically 120 s before
    /// it runs out.
    pub async fn manage(
        &self,
        lifetime_secs: u64,
        supports_device_actions: bool,
        supports_firmware_actions: bool,
    ) -> Result<PendingAction> {
        let registration = Registration {
            lifetime: if lifetime_secs < MIN_LIFETIME_SECS { 0 } else { lifetime_secs },
            device_actions: supports_device_actions,
            firmware_actions: supports_firmware_actions,
        };
        let pending = self.shared.send_manage(&registration).await?;
        self.shared.schedule_remanage(registration);
        Ok(pending)
    }

    pub async fn unmanage(&self) -> Result<PendingAction> {
        self.shared.wait_ready().await?;
        if let Some(handle) = self.shared.tasks().remanage.take() {
            handle.abort();
        }
        self.shared.request(ActionKind::Unmanage, UNMANAGE_TOPIC, None).await
    }

    /// Reports the device location, measured now.
    pub async fn set_location(
        &self,
        longitude: f64,
        latitude: f64,
        elevation: Option<f64>,
        accuracy: Option<f64>,
    ) -> Result<PendingAction> {
        let mut location = json!({
            "longitude": longitude,
            "latitude": latitude,
            "measuredDateTime": now_rfc3339()?,
        });
        if let Some(elevation) = elevation {
            location["elevation"] = json!(elevation);
        }
        if let Some(accuracy) = accuracy {
            location["accuracy"] = json!(accuracy);
        }

        self.shared.wait_ready().await?;
        self.shared
            .request(ActionKind::UpdateLocation, UPDATE_LOCATION_TOPIC, Some(location))
            .await
    }

    pub async fn add_error_code(&self, error_code: i64) -> Result<PendingAction> {
        self.shared.wait_ready().await?;
        self.shared
            .request(
                ActionKind::AddErrorCode,
                ADD_ERROR_CODE_TOPIC,
                Some(json!({ "errorCode": error_code })),
            )
            .await
    }

    pub async fn clear_error_codes(&self) -> Result<PendingAction> {
        self.shared.wait_ready().await?;
        self.shared
            .request(ActionKind::ClearErrorCodes, CLEAR_ERROR_CODES_TOPIC, None)
            .await
    }

    pub async fn add_log(&self, message: &str, data: &str, severity: LogSeverity) -> Result<PendingAction> {
        let entry = json!({
            "message": message,
            "timestamp": now_rfc3339()?,
            "data": data,
            "severity": severity.code(),
        });
        self.shared.wait_ready().await?;
        self.shared.request(ActionKind::AddLog, ADD_LOG_TOPIC, Some(entry)).await
    }

    pub async fn clear_log(&self) -> Result<PendingAction> {
        self.shared.wait_ready().await?;
        self.shared.request(ActionKind::ClearLog, CLEAR_LOG_TOPIC, None).await
    }

    /// Answers a reboot or factory reset handed to the device-action
    /// callback: 202 when accepted, 500 otherwise.
    pub async fn respond_device_action(&self, request_id: &RequestId, accepted: bool, message: &str) -> Result<()> {
        let rc = if accepted { 202 } else { 500 };
        self.shared.respond(request_id, rc, message).await
    }

    /// Reports a new firmware state and advances the tracked download.
    pub async fn set_firmware_state(&self, state: FirmwareState) -> Result<()> {
        self.shared.firmware_mut().state = Some(state);
        let notify = json!({"d": {"fields": [
            {"field": "mgmt.firmware", "value": {"state": u8::from(state)}}
        ]}});
        info!(?state, "Publishing firmware state");
        self.shared.publish_json(NOTIFY_TOPIC, &notify).await?;

        match state {
            FirmwareState::Downloading => self.shared.advance(ActionKind::FirmwareDownload, Transition::Progress),
            FirmwareState::Downloaded => {
                self.shared
                    .advance(ActionKind::FirmwareDownload, Transition::Complete { rc: 200 })
            }
            FirmwareState::Idle => {}
        }
        Ok(())
    }

    /// Reports an update status (resetting the state to idle) and advances
    /// the tracked firmware action.
    pub async fn set_update_status(&self, status: UpdateStatus) -> Result<()> {
        {
            let mut firmware = self.shared.firmware_mut();
            firmware.state = Some(FirmwareState::Idle);
            firmware.update_status = Some(status);
        }
        let notify = json!({"d": {"fields": [
            {"field": "mgmt.firmware", "value": {"state": u8::from(FirmwareState::Idle), "updateStatus": u8::from(status)}}
        ]}});
        info!(?status, "Publishing firmware update status");
        self.shared.publish_json(NOTIFY_TOPIC, &notify).await?;

        match status {
            UpdateStatus::InProgress => self.shared.advance(ActionKind::FirmwareUpdate, Transition::Progress),
            UpdateStatus::Success => {
                self.shared
                    .advance(ActionKind::FirmwareUpdate, Transition::Complete { rc: 200 })
            }
            failure => {
                let transition = Transition::Fail {
                    rc: 500,
                    message: Some(format!("{failure:?}")),
                };
                let kind = if self.shared.actions.find_kind(ActionKind::FirmwareUpdate).is_some() {
                    ActionKind::FirmwareUpdate
                } else {
                    ActionKind::FirmwareDownload
                };
                self.shared.advance(kind, transition);
            }
        }
        Ok(())
    }

    /// Called for reboot and factory reset requests. The callback must
    /// eventually answer with [`ManagedDevice::respond_device_action`].
    pub fn on_device_action(&self, callback: impl Fn(&RequestId, DeviceAction) + Send + Sync + 'static) {
        self.shared.callbacks_mut().device_action = Some(Arc::new(callback));
    }

    /// Called for accepted firmware download and update requests.
    pub fn on_firmware_action(&self, callback: impl Fn(FirmwareAction, &DeviceFirmware) + Send + Sync + 'static) {
        self.shared.callbacks_mut().firmware_action = Some(Arc::new(callback));
    }

    /// Called for `iotdm-1/mgmt/custom/{bundle}/{action}` requests with the
    /// topic, the request document and its id. Returning `true` answers 200.
    pub fn on_custom_action(
        &self,
        callback: impl Fn(&str, &Value, &RequestId) -> bool + Send + Sync + 'static,
    ) {
        self.shared.callbacks_mut().custom_action = Some(Arc::new(callback));
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.shared.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the device info sent with the next `manage`.
    pub fn set_device_info(&self, info: DeviceInfo) {
        *self.shared.info.write().unwrap_or_else(|e| e.into_inner()) = info;
    }

    pub fn firmware(&self) -> DeviceFirmware {
        self.shared.firmware()
    }

    pub fn metadata(&self) -> Value {
        self.shared.metadata.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_metadata(&self, metadata: Value) {
        *self.shared.metadata.write().unwrap_or_else(|e| e.into_inner()) = metadata;
    }

    pub fn actions(&self) -> &Arc<ActionTable> {
        &self.shared.actions
    }

    pub fn device(&self) -> &DeviceClient {
        &self.shared.device
    }
}

fn reject_quickstart(config: &ClientConfig) -> Result<()> {
    if config.is_quickstart() {
        return Err(IotError::Configuration(
            "QuickStart does not support device management".to_string(),
        ));
    }
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| IotError::Serialization(e.to_string()))
}

fn request_id(msg: &Message) -> Option<RequestId> {
    msg.data()
        .as_json()?
        .get("reqId")?
        .as_str()
        .map(RequestId::from)
}

fn field_value<'a>(msg: &'a Message, field: &str) -> Option<&'a Value> {
    msg.data()
        .as_json()?
        .pointer("/d/fields")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("field").and_then(Value::as_str) == Some(field))?
        .get("value")
}

type Route = fn(&Arc<Shared>, &Message);

fn register_handlers(shared: &Arc<Shared>) {
    let routes: [(&str, Route); 8] = [
        ("response", Shared::on_response),
        ("observe", Shared::on_observe),
        ("cancel", Shared::on_observe),
        ("mgmt/initiate/device/reboot", Shared::on_reboot),
        ("mgmt/initiate/device/factory_reset", Shared::on_factory_reset),
        ("device/update", Shared::on_device_update),
        ("mgmt/initiate/firmware/download", Shared::on_firmware_download),
        ("mgmt/initiate/firmware/update", Shared::on_firmware_update),
    ];

    let connection = shared.device.connection();
    for (path, route) in routes {
        let weak = Arc::downgrade(shared);
        connection.register(
            Pattern::any().id(path),
            Handler::management(move |msg| {
                if let Some(shared) = weak.upgrade() {
                    route(&shared, msg);
                }
            }),
        );
    }

    let weak = Arc::downgrade(shared);
    connection.register(
        Pattern::any(),
        Handler::management(move |msg| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if msg.id().starts_with(CUSTOM_ACTION_PREFIX) {
                shared.on_custom_action(msg);
            } else {
                warn!(path = %msg.id(), "Unhandled device management message");
            }
        }),
    );
}

impl Shared {
    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks(&self) -> std::sync::RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn firmware(&self) -> DeviceFirmware {
        self.firmware.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn firmware_mut(&self) -> std::sync::RwLockWriteGuard<'_, DeviceFirmware> {
        self.firmware.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let outcome = tokio::time::timeout(READY_TIMEOUT, ready.wait_for(|ready| *ready))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            _ => Err(IotError::RequestTimedOut(
                "device is not ready for device management".to_string(),
            )),
        }
    }

    async fn publish_json(&self, topic: &str, value: &Value) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|e| IotError::Serialization(e.to_string()))?;
        self.device.connection().publish_raw(topic, payload, 1, false).await
    }

    /// Publishes a device-originated request under a fresh `reqId`.
    async fn request(&self, kind: ActionKind, topic: &str, data: Option<Value>) -> Result<PendingAction> {
        let pending = self.actions.issue(kind);
        let mut message = json!({ "reqId": pending.request_id().as_str() });
        if let Some(data) = data {
            message["d"] = data;
        }

        debug!(request_id = %pending.request_id(), %kind, topic, "Sending device management request");
        if let Err(e) = self.publish_json(topic, &message).await {
            self.actions.remove(pending.request_id());
            return Err(e);
        }
        Ok(pending)
    }

    async fn send_manage(&self, registration: &Registration) -> Result<PendingAction> {
        let info = serde_json::to_value(&*self.info.read().unwrap_or_else(|e| e.into_inner()))
            .map_err(|e| IotError::Serialization(e.to_string()))?;
        let metadata = self.metadata.read().unwrap_or_else(|e| e.into_inner()).clone();
        let data = json!({
            "lifetime": registration.lifetime,
            "supports": {
                "deviceActions": registration.device_actions,
                "firmwareActions": registration.firmware_actions,
            },
            "deviceInfo": info,
            "metadata": metadata,
        });
        self.request(ActionKind::Manage, MANAGE_TOPIC, Some(data)).await
    }

    fn schedule_remanage(self: &Arc<Self>, registration: Registration) {
        let mut tasks = self.tasks();
        if let Some(previous) = tasks.remanage.take() {
            debug!("Cancelling existing manage renewal");
            previous.abort();
        }
        if registration.lifetime == 0 {
            return;
        }

        let period = Duration::from_secs(registration.lifetime - REMANAGE_MARGIN_SECS);
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tasks.remanage = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                debug!(lifetime = registration.lifetime, "Renewing device management registration");
                if let Err(e) = shared.send_manage(&registration).await {
                    warn!(error = %e, "Failed to renew device management registration");
                }
            }
        }));
    }

    /// Publishes the device's answer to a platform request and records it.
    async fn respond(&self, request_id: &RequestId, rc: u16, message: &str) -> Result<()> {
        let response = json!({ "rc": rc, "message": message, "reqId": request_id.as_str() });
        info!(request_id = %request_id, rc, "Responding to device management request");
        self.publish_json(RESPONSE_TOPIC, &response).await?;

        let message = (!message.is_empty()).then(|| message.to_string());
        self.actions.respond(request_id, rc, message);
        Ok(())
    }

    /// Answers from a delivery callback without blocking it.
    fn spawn_response(self: &Arc<Self>, request_id: RequestId, rc: u16, message: &str) {
        let shared = Arc::clone(self);
        let message = message.to_string();
        tokio::spawn(async move {
            if let Err(e) = shared.respond(&request_id, rc, &message).await {
                warn!(request_id = %request_id, rc, error = %e, "Failed to publish device management response");
            }
        });
    }

    fn advance(&self, kind: ActionKind, transition: Transition) {
        if let Some(request_id) = self.actions.find_kind(kind) {
            self.actions.apply(&request_id, transition);
        }
    }

    fn on_response(self: &Arc<Self>, msg: &Message) {
        let Some(data) = msg.data().as_json() else {
            return;
        };
        let Some(rc) = data.get("rc").and_then(Value::as_u64) else {
            trace!("Ignoring management response without rc");
            return;
        };
        let Some(request_id) = request_id(msg) else {
            warn!(rc, "Management response without reqId");
            return;
        };
        let Some(request) = self.actions.get(&request_id) else {
            warn!(request_id = %request_id, "Received unexpected response from device management");
            return;
        };

        let rc = u16::try_from(rc).unwrap_or(u16::MAX);
        let message = data.get("message").and_then(Value::as_str).map(str::to_string);
        match self.actions.respond(&request_id, rc, message) {
            Some(ActionState::Completed) => {
                info!(request_id = %request_id, kind = %request.kind, rc, "Device management action completed");
                match request.kind {
                    ActionKind::Manage => {
                        self.ready.send_replace(true);
                    }
                    ActionKind::Unmanage => {
                        self.ready.send_replace(false);
                    }
                    _ => {}
                }
            }
            Some(ActionState::Failed) => {
                error!(request_id = %request_id, kind = %request.kind, rc, "Device management action failed");
            }
            _ => {}
        }
    }

    fn on_observe(self: &Arc<Self>, msg: &Message) {
        let Some(request_id) = request_id(msg) else {
            warn!(path = %msg.id(), "Management request without reqId");
            return;
        };
        self.spawn_response(request_id, 200, "");
    }

    fn on_reboot(self: &Arc<Self>, msg: &Message) {
        self.on_device_action(msg, DeviceAction::Reboot, ActionKind::Reboot);
    }

    fn on_factory_reset(self: &Arc<Self>, msg: &Message) {
        self.on_device_action(msg, DeviceAction::FactoryReset, ActionKind::FactoryReset);
    }

    fn on_device_action(self: &Arc<Self>, msg: &Message, action: DeviceAction, kind: ActionKind) {
        let Some(request_id) = request_id(msg) else {
            warn!(%kind, "Device action request without reqId");
            return;
        };
        info!(request_id = %request_id, %kind, "Device action requested");
        let _ = self.actions.track(request_id.clone(), kind);

        let callback = self.callbacks().device_action.clone();
        match callback {
            None => self.spawn_response(request_id, 501, "Operation not implemented"),
            Some(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(&request_id, action))).is_err() {
                    error!(request_id = %request_id, %kind, "Device action callback panicked");
                    self.spawn_response(request_id, 500, "Unexpected device error");
                }
            }
        }
    }

    fn on_device_update(self: &Arc<Self>, msg: &Message) {
        match request_id(msg) {
            Some(request_id) => {
                if let Some(value) = field_value(msg, "mgmt.firmware") {
                    match serde_json::from_value::<DeviceFirmware>(value.clone()) {
                        Ok(firmware) => {
                            info!(version = ?firmware.version, "Firmware description updated");
                            *self.firmware_mut() = firmware;
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed firmware description"),
                    }
                }
                self.spawn_response(request_id, 204, "");
            }
            None => {
                if let Some(value) = field_value(msg, "metadata") {
                    debug!("Device metadata updated");
                    *self.metadata.write().unwrap_or_else(|e| e.into_inner()) = value.clone();
                }
            }
        }
    }

    fn on_firmware_download(self: &Arc<Self>, msg: &Message) {
        self.on_firmware_action(
            msg,
            FirmwareAction::Download,
            FirmwareState::Idle,
            "Cannot download as the device is not in idle state",
        );
    }

    fn on_firmware_update(self: &Arc<Self>, msg: &Message) {
        self.on_firmware_action(
            msg,
            FirmwareAction::Update,
            FirmwareState::Downloaded,
            "Firmware is still not successfully downloaded.",
        );
    }

    fn on_firmware_action(
        self: &Arc<Self>,
        msg: &Message,
        action: FirmwareAction,
        required: FirmwareState,
        refusal: &str,
    ) {
        let Some(request_id) = request_id(msg) else {
            warn!(?action, "Firmware request without reqId");
            return;
        };
        let firmware = self.firmware();
        if firmware.current_state() != required {
            warn!(request_id = %request_id, ?action, state = ?firmware.current_state(), "Refusing firmware request");
            self.spawn_response(request_id, 400, refusal);
            return;
        }

        let kind = match action {
            FirmwareAction::Download => ActionKind::FirmwareDownload,
            FirmwareAction::Update => ActionKind::FirmwareUpdate,
        };
        let _ = self.actions.track(request_id.clone(), kind);
        self.spawn_response(request_id, 202, "");

        let callback = self.callbacks().firmware_action.clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(action, &firmware))).is_err() {
                error!(?action, "Firmware action callback panicked");
            }
        }
    }

    fn on_custom_action(self: &Arc<Self>, msg: &Message) {
        let Some(request_id) = request_id(msg) else {
            warn!(path = %msg.id(), "Custom action without reqId");
            return;
        };
        let topic = format!("{MANAGEMENT_ROOT}/{}", msg.id());
        let data = msg.data().as_json().cloned().unwrap_or(Value::Null);

        let callback = self.callbacks().custom_action.clone();
        let (rc, message) = match callback {
            None => (501, "Operation not implemented"),
            Some(callback) => match catch_unwind(AssertUnwindSafe(|| callback(&topic, &data, &request_id))) {
                Ok(true) => (200, "DME Action successfully completed from Callback"),
                Ok(false) | Err(_) => (500, "Unexpected device error"),
            },
        };
        self.spawn_response(request_id, rc, message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::memory::{self, Broker};
    use crate::topic::DEVICE_COMMANDS;

    fn managed() -> (ManagedDevice, Broker) {
        let (transport, events, broker) = memory::pair();
        let info = DeviceInfo {
            serial_number: Some("SN-7".into()),
            ..Default::default()
        };
        let device = ManagedDevice::with_transport(
            ClientConfig::device("myorg", "sensor", "dev-1", "secret"),
            transport,
            events,
            info,
        )
        .unwrap();
        (device, broker)
    }

    async fn connected() -> (ManagedDevice, Broker) {
        let (device, broker) = managed();
        broker.connack();
        device.connect().await.unwrap();
        (device, broker)
    }

    async fn ready() -> (ManagedDevice, Broker) {
        let (device, broker) = connected().await;
        let pending = device.manage(0, true, true).await.unwrap();
        respond(&broker, pending.request_id(), 200);
        pending.outcome().await.unwrap();
        (device, broker)
    }

    fn respond(broker: &Broker, request_id: &RequestId, rc: u16) {
        let body = json!({"rc": rc, "reqId": request_id.as_str()}).to_string();
        broker.deliver("iotdm-1/response", body.into_bytes());
    }

    fn request(broker: &Broker, topic: &str, body: Value) {
        broker.deliver(topic, body.to_string().into_bytes());
    }

    async fn responses(broker: &Broker, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let published = broker.published_json(RESPONSE_TOPIC);
            if published.len() >= count {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} device management responses");
    }

    #[test]
    fn test_quickstart_is_rejected() {
        let (transport, events, _broker) = memory::pair();
        let result = ManagedDevice::with_transport(
            ClientConfig::quickstart("sensor", "dev-1"),
            transport,
            events,
            DeviceInfo::default(),
        );
        assert_eq!(
            result.err().map(|e| e.to_string()),
            Some("Configuration error: QuickStart does not support device management".to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_subscribes_management_topics() {
        let (_device, broker) = connected().await;
        let subscriptions = broker.subscriptions();

        assert!(subscriptions.contains(&DEVICE_COMMANDS.to_string()));
        for topic in MANAGEMENT_TOPICS {
            assert!(subscriptions.contains(&topic.to_string()), "missing {topic}");
        }
    }

    #[tokio::test]
    async fn test_manage_round_trip() {
        let (device, broker) = connected().await;
        assert!(!device.is_ready());

        let pending = device.manage(100, true, false).await.unwrap();
        let sent = broker.published_json(MANAGE_TOPIC);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["reqId"], json!(pending.request_id().as_str()));
        assert_eq!(sent[0]["d"]["lifetime"], json!(0));
        assert_eq!(
            sent[0]["d"]["supports"],
            json!({"deviceActions": true, "firmwareActions": false})
        );
        assert_eq!(sent[0]["d"]["deviceInfo"], json!({"serialNumber": "SN-7"}));

        respond(&broker, pending.request_id(), 200);
        let outcome = pending.outcome().await.unwrap();
        assert_eq!(outcome.state, ActionState::Completed);
        assert!(device.is_ready());
    }

    #[tokio::test]
    async fn test_failed_manage_leaves_device_unready() {
        let (device, broker) = connected().await;
        let pending = device.manage(0, true, true).await.unwrap();

        respond(&broker, pending.request_id(), 403);
        assert_eq!(pending.outcome().await.unwrap().state, ActionState::Failed);
        assert!(!device.is_ready());
    }

    #[tokio::test]
    async fn test_response_without_rc_is_ignored() {
        let (device, broker) = connected().await;
        let pending = device.manage(0, true, true).await.unwrap();

        request(&broker, "iotdm-1/response", json!({"reqId": pending.request_id().as_str()}));
        respond(&broker, &"someone-else".into(), 200);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(device.actions().get(pending.request_id()).unwrap().state, ActionState::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_wait_for_readiness() {
        let (device, _broker) = managed();
        let err = device.add_error_code(3).await.unwrap_err();
        assert!(matches!(err, IotError::RequestTimedOut(_)));
    }

    #[tokio::test]
    async fn test_diagnostics_payloads() {
        let (device, broker) = ready().await;

        device.set_location(-98.5, 39.8, Some(120.0), None).await.unwrap();
        device.add_error_code(12).await.unwrap();
        device.add_log("disk full", "sda1", LogSeverity::Error).await.unwrap();
        device.clear_error_codes().await.unwrap();
        device.clear_log().await.unwrap();

        let location = &broker.published_json(UPDATE_LOCATION_TOPIC)[0]["d"];
        assert_eq!(location["longitude"], json!(-98.5));
        assert_eq!(location["elevation"], json!(120.0));
        assert!(location.get("accuracy").is_none());
        assert!(location["measuredDateTime"].as_str().unwrap().ends_with('Z'));

        assert_eq!(broker.published_json(ADD_ERROR_CODE_TOPIC)[0]["d"], json!({"errorCode": 12}));
        let log = &broker.published_json(ADD_LOG_TOPIC)[0]["d"];
        assert_eq!(log["message"], json!("disk full"));
        assert_eq!(log["severity"], json!(2));
        assert!(broker.published_json(CLEAR_ERROR_CODES_TOPIC)[0]["d"].is_null());
        assert_eq!(broker.published_json(CLEAR_LOG_TOPIC).len(), 1);
        assert_eq!(device.actions().pending_len(), 5);
    }

    #[tokio::test]
    async fn test_unmanage_clears_readiness() {
        let (device, broker) = ready().await;
        let pending = device.unmanage().await.unwrap();
        respond(&broker, pending.request_id(), 200);
        pending.outcome().await.unwrap();
        assert!(!device.is_ready());
    }

    #[tokio::test]
    async fn test_reboot_goes_to_device_action_callback() {
        let (device, broker) = connected().await;
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let sink = requested.clone();
        device.on_device_action(move |id, action| sink.lock().unwrap().push((id.clone(), action)));

        request(&broker, "iotdm-1/mgmt/initiate/device/reboot", json!({"reqId": "r-1"}));
        for _ in 0..200 {
            if !requested.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (id, action) = requested.lock().unwrap()[0].clone();
        assert_eq!((id.as_str(), action), ("r-1", DeviceAction::Reboot));
        assert_eq!(device.actions().get(&id).unwrap().state, ActionState::Requested);

        device.respond_device_action(&id, true, "").await.unwrap();
        assert_eq!(
            broker.published_json(RESPONSE_TOPIC),
            vec![json!({"rc": 202, "message": "", "reqId": "r-1"})]
        );
        assert_eq!(device.actions().get(&id).unwrap().state, ActionState::Accepted);
    }

    #[tokio::test]
    async fn test_device_action_without_callback_is_not_implemented() {
        let (_device, broker) = connected().await;
        request(&broker, "iotdm-1/mgmt/initiate/device/factory_reset", json!({"reqId": "f-1"}));

        let sent = responses(&broker, 1).await;
        assert_eq!(sent[0], json!({"rc": 501, "message": "Operation not implemented", "reqId": "f-1"}));
    }

    #[tokio::test]
    async fn test_firmware_download_then_update() {
        let (device, broker) = connected().await;
        let actions = Arc::new(StdMutex::new(Vec::new()));
        let sink = actions.clone();
        device.on_firmware_action(move |action, firmware| {
            sink.lock().unwrap().push((action, firmware.version.clone()))
        });

        request(
            &broker,
            "iotdm-1/device/update",
            json!({"reqId": "u-1", "d": {"fields": [
                {"field": "mgmt.firmware", "value": {"version": "2.0", "uri": "https://fw/2.0.bin", "state": 0}}
            ]}}),
        );
        request(&broker, "iotdm-1/mgmt/initiate/firmware/download", json!({"reqId": "dl-1"}));

        let sent = responses(&broker, 2).await;
        assert_eq!(sent[0], json!({"rc": 204, "message": "", "reqId": "u-1"}));
        assert_eq!(sent[1], json!({"rc": 202, "message": "", "reqId": "dl-1"}));
        assert_eq!(device.firmware().url.as_deref(), Some("https://fw/2.0.bin"));
        assert_eq!(*actions.lock().unwrap(), vec![(FirmwareAction::Download, Some("2.0".to_string()))]);

        device.set_firmware_state(FirmwareState::Downloading).await.unwrap();
        assert_eq!(
            device.actions().get(&"dl-1".into()).unwrap().state,
            ActionState::InProgress
        );
        device.set_firmware_state(FirmwareState::Downloaded).await.unwrap();
        assert!(device.actions().get(&"dl-1".into()).is_none());
        assert_eq!(
            broker.published_json(NOTIFY_TOPIC).last().unwrap(),
            &json!({"d": {"fields": [{"field": "mgmt.firmware", "value": {"state": 2}}]}})
        );

        request(&broker, "iotdm-1/mgmt/initiate/firmware/update", json!({"reqId": "up-1"}));
        let sent = responses(&broker, 3).await;
        assert_eq!(sent[2]["rc"], json!(202));

        device.set_update_status(UpdateStatus::Success).await.unwrap();
        assert!(device.actions().get(&"up-1".into()).is_none());
        assert_eq!(
            broker.published_json(NOTIFY_TOPIC).last().unwrap(),
            &json!({"d": {"fields": [{"field": "mgmt.firmware", "value": {"state": 0, "updateStatus": 0}}]}})
        );
        assert_eq!(device.firmware().current_state(), FirmwareState::Idle);
    }

    #[tokio::test]
    async fn test_firmware_requests_check_state() {
        let (device, broker) = connected().await;

        request(&broker, "iotdm-1/mgmt/initiate/firmware/update", json!({"reqId": "up-1"}));
        let sent = responses(&broker, 1).await;
        assert_eq!(
            sent[0],
            json!({"rc": 400, "message": "Firmware is still not successfully downloaded.", "reqId": "up-1"})
        );

        device.set_firmware_state(FirmwareState::Downloading).await.unwrap();
        request(&broker, "iotdm-1/mgmt/initiate/firmware/download", json!({"reqId": "dl-2"}));
        let sent = responses(&broker, 2).await;
        assert_eq!(
            sent[1],
            json!({"rc": 400, "message": "Cannot download as the device is not in idle state", "reqId": "dl-2"})
        );
        assert_eq!(device.actions().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_update_status_fails_action() {
        let (device, broker) = connected().await;
        device.set_firmware_state(FirmwareState::Downloaded).await.unwrap();
        request(&broker, "iotdm-1/mgmt/initiate/firmware/update", json!({"reqId": "up-2"}));
        responses(&broker, 1).await;
        assert!(device.actions().get(&"up-2".into()).is_some());

        device.set_update_status(UpdateStatus::VerificationFailed).await.unwrap();
        assert!(device.actions().get(&"up-2".into()).is_none());
        assert_eq!(device.firmware().update_status, Some(UpdateStatus::VerificationFailed));
    }

    #[tokio::test]
    async fn test_custom_actions() {
        let (device, broker) = connected().await;

        request(&broker, "iotdm-1/mgmt/custom/bundle/ping", json!({"reqId": "c-1"}));
        let sent = responses(&broker, 1).await;
        assert_eq!(sent[0], json!({"rc": 501, "message": "Operation not implemented", "reqId": "c-1"}));

        device.on_custom_action(|topic, data, _id| {
            topic == "iotdm-1/mgmt/custom/bundle/ping" && data["d"]["ok"] == json!(true)
        });
        request(&broker, "iotdm-1/mgmt/custom/bundle/ping", json!({"reqId": "c-2", "d": {"ok": true}}));
        request(&broker, "iotdm-1/mgmt/custom/bundle/ping", json!({"reqId": "c-3", "d": {"ok": false}}));

        let sent = responses(&broker, 3).await;
        assert_eq!(sent[1]["rc"], json!(200));
        assert_eq!(sent[1]["message"], json!("DME Action successfully completed from Callback"));
        assert_eq!(sent[2]["rc"], json!(500));
        assert_eq!(sent[2]["message"], json!("Unexpected device error"));
    }

    #[tokio::test]
    async fn test_observe_cancel_and_metadata() {
        let (device, broker) = connected().await;

        request(&broker, "iotdm-1/observe", json!({"reqId": "o-1"}));
        request(&broker, "iotdm-1/cancel", json!({"reqId": "o-2"}));
        request(
            &broker,
            "iotdm-1/device/update",
            json!({"d": {"fields": [{"field": "metadata", "value": {"room": "7b"}}]}}),
        );

        let sent = responses(&broker, 2).await;
        assert_eq!(sent[0]["rc"], json!(200));
        assert_eq!(sent[1]["rc"], json!(200));
        for _ in 0..200 {
            if device.metadata() == json!({"room": "7b"}) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(device.metadata(), json!({"room": "7b"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_lifetime_is_renewed() {
        let (device, broker) = connected().await;
        device.manage(3600, true, true).await.unwrap();
        assert_eq!(broker.published_json(MANAGE_TOPIC).len(), 1);

        tokio::time::sleep(Duration::from_secs(3480 + 1)).await;
        for _ in 0..100 {
            if broker.published_json(MANAGE_TOPIC).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let sent = broker.published_json(MANAGE_TOPIC);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["d"]["lifetime"], json!(3600));
        assert_ne!(sent[0]["reqId"], sent[1]["reqId"]);
    }

    #[tokio::test]
    async fn test_disconnect_abandons_pending_actions() {
        let (device, _broker) = connected().await;
        let pending = device.manage(0, true, true).await.unwrap();

        device.disconnect().await.unwrap();
        assert!(matches!(pending.outcome().await, Err(IotError::ClientClosed)));
        assert!(matches!(device.manage(0, true, true).await, Err(IotError::ClientClosed)));
    }
}
