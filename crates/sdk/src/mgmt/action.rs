//! Correlation of device-management requests.
//!
//! Every management exchange is keyed by a request id (`reqId`). A request
//! moves through
//!
//! ```text
//! Requested -> Accepted -> InProgress -> Completed | Failed | TimedOut
//! ```
//!
//! and may skip intermediate states (a 200 response completes a request
//! that was never accepted). Responses for unknown ids are ignored. A
//! request with no update for longer than the table's timeout expires into
//! `TimedOut`. Terminal requests leave the table immediately; whoever waits
//! on a [`PendingAction`] receives the final snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{IotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Manage,
    Unmanage,
    UpdateLocation,
    AddErrorCode,
    ClearErrorCodes,
    AddLog,
    ClearLog,
    Reboot,
    FactoryReset,
    FirmwareDownload,
    FirmwareUpdate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Manage => "manage",
            ActionKind::Unmanage => "unmanage",
            ActionKind::UpdateLocation => "update-location",
            ActionKind::AddErrorCode => "add-error-code",
            ActionKind::ClearErrorCodes => "clear-error-codes",
            ActionKind::AddLog => "add-log",
            ActionKind::ClearLog => "clear-log",
            ActionKind::Reboot => "reboot",
            ActionKind::FactoryReset => "factory-reset",
            ActionKind::FirmwareDownload => "firmware-download",
            ActionKind::FirmwareUpdate => "firmware-update",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Requested,
    Accepted,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Failed | ActionState::TimedOut)
    }

    fn rank(self) -> u8 {
        match self {
            ActionState::Requested => 0,
            ActionState::Accepted => 1,
            ActionState::InProgress => 2,
            _ => 3,
        }
    }
}

/// Correlation id of a management exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of one management exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedActionRequest {
    pub request_id: RequestId,
    pub kind: ActionKind,
    pub state: ActionState,
    pub created_at: Instant,
    pub last_updated_at: Instant,
    /// Last return code reported for the request.
    pub rc: Option<u16>,
    pub message: Option<String>,
}

/// An update to a tracked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Accept,
    Progress,
    Complete { rc: u16 },
    Fail { rc: u16, message: Option<String> },
}

impl Transition {
    /// Maps a platform return code: 200/204 complete, 202 accepts,
    /// anything else fails.
    pub fn from_rc(rc: u16, message: Option<String>) -> Self {
        match rc {
            200 | 204 => Transition::Complete { rc },
            202 => Transition::Accept,
            _ => Transition::Fail { rc, message },
        }
    }

    fn target(&self) -> ActionState {
        match self {
            Transition::Accept => ActionState::Accepted,
            Transition::Progress => ActionState::InProgress,
            Transition::Complete { .. } => ActionState::Completed,
            Transition::Fail { .. } => ActionState::Failed,
        }
    }
}

struct Entry {
    request: ManagedActionRequest,
    waiter: Option<oneshot::Sender<ManagedActionRequest>>,
}

/// Handle on an issued request.
#[derive(Debug)]
pub struct PendingAction {
    request_id: RequestId,
    rx: oneshot::Receiver<ManagedActionRequest>,
}

impl PendingAction {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Waits for the terminal snapshot (`Completed`, `Failed` or
    /// `TimedOut`). Fails with `ClientClosed` when the table was cleared.
    pub async fn outcome(self) -> Result<ManagedActionRequest> {
        self.rx.await.map_err(|_| IotError::ClientClosed)
    }
}

/// Pending management requests.
pub struct ActionTable {
    entries: Mutex<HashMap<RequestId, Entry>>,
    timeout: Duration,
}

impl ActionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Creates a `Requested` entry under a fresh id.
    pub fn issue(&self, kind: ActionKind) -> PendingAction {
        self.insert(RequestId::new(), kind)
    }

    /// Creates a `Requested` entry under an id chosen by the platform.
    pub fn track(&self, request_id: RequestId, kind: ActionKind) -> PendingAction {
        self.insert(request_id, kind)
    }

    fn insert(&self, request_id: RequestId, kind: ActionKind) -> PendingAction {
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        let request = ManagedActionRequest {
            request_id: request_id.clone(),
            kind,
            state: ActionState::Requested,
            created_at: now,
            last_updated_at: now,
            rc: None,
            message: None,
        };
        debug!(request_id = %request_id, %kind, "Tracking management request");
        self.lock().insert(
            request_id.clone(),
            Entry {
                request,
                waiter: Some(tx),
            },
        );
        PendingAction { request_id, rx }
    }

    /// Applies `transition` and returns the resulting state, or `None` for
    /// an unknown id. Transitions never move a request backwards.
    pub fn apply(&self, request_id: &RequestId, transition: Transition) -> Option<ActionState> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(request_id) else {
            trace!(request_id = %request_id, "Ignoring update for unknown request");
            return None;
        };

        let target = transition.target();
        let request = &mut entry.request;
        if target.rank() < request.state.rank() {
            trace!(request_id = %request_id, from = ?request.state, to = ?target, "Ignoring stale transition");
            return Some(request.state);
        }

        request.state = target;
        request.last_updated_at = Instant::now();
        match transition {
            Transition::Complete { rc } => request.rc = Some(rc),
            Transition::Fail { rc, message } => {
                request.rc = Some(rc);
                request.message = message;
            }
            Transition::Accept | Transition::Progress => {}
        }
        debug!(request_id = %request_id, kind = %request.kind, state = ?target, "Management request updated");

        if target.is_terminal() {
            if let Some(entry) = entries.remove(request_id) {
                finish(entry);
            }
        }
        Some(target)
    }

    /// Applies a platform return code, see [`Transition::from_rc`].
    pub fn respond(&self, request_id: &RequestId, rc: u16, message: Option<String>) -> Option<ActionState> {
        self.apply(request_id, Transition::from_rc(rc, message))
    }

    /// Moves every request idle for longer than the timeout to `TimedOut`
    /// and removes it.
    pub fn expire(&self, now: Instant) -> Vec<ManagedActionRequest> {
        let mut entries = self.lock();
        let overdue: Vec<RequestId> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.request.last_updated_at) >= self.timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for id in overdue {
            if let Some(mut entry) = entries.remove(&id) {
                entry.request.state = ActionState::TimedOut;
                entry.request.last_updated_at = now;
                expired.push(entry.request.clone());
                finish(entry);
            }
        }
        expired
    }

    pub fn get(&self, request_id: &RequestId) -> Option<ManagedActionRequest> {
        self.lock().get(request_id).map(|entry| entry.request.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// The most recently created pending request of `kind`.
    pub fn find_kind(&self, kind: ActionKind) -> Option<RequestId> {
        self.lock()
            .values()
            .filter(|entry| entry.request.kind == kind)
            .max_by_key(|entry| entry.request.created_at)
            .map(|entry| entry.request.request_id.clone())
    }

    /// Stops tracking a request without completing it.
    pub fn remove(&self, request_id: &RequestId) -> Option<ManagedActionRequest> {
        self.lock().remove(request_id).map(|entry| entry.request)
    }

    /// Drops every pending request; their waiters observe `ClientClosed`.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Periodically expires overdue requests until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for request in table.expire(Instant::now()) {
                            warn!(
                                request_id = %request.request_id,
                                kind = %request.kind,
                                "Management request timed out"
                            );
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn finish(mut entry: Entry) {
    if let Some(waiter) = entry.waiter.take() {
        let _ = waiter.send(entry.request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_happy_path() {
        let table = ActionTable::new(TIMEOUT);
        let pending = table.issue(ActionKind::FirmwareUpdate);
        let id = pending.request_id().clone();

        assert_eq!(table.apply(&id, Transition::Accept), Some(ActionState::Accepted));
        assert_eq!(table.apply(&id, Transition::Progress), Some(ActionState::InProgress));
        assert_eq!(table.get(&id).unwrap().state, ActionState::InProgress);
        assert_eq!(
            table.apply(&id, Transition::Complete { rc: 200 }),
            Some(ActionState::Completed)
        );

        assert_eq!(table.pending_len(), 0);
        let done = pending.outcome().await.unwrap();
        assert_eq!(done.state, ActionState::Completed);
        assert_eq!(done.rc, Some(200));
    }

    #[test]
    fn test_unknown_request_is_ignored() {
        let table = ActionTable::new(TIMEOUT);
        let _pending = table.issue(ActionKind::Reboot);

        assert_eq!(table.respond(&"not-mine".into(), 200, None), None);
        assert_eq!(table.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_return_codes() {
        let table = ActionTable::new(TIMEOUT);

        let accepted = table.issue(ActionKind::Manage);
        assert_eq!(table.respond(accepted.request_id(), 202, None), Some(ActionState::Accepted));

        let no_content = table.issue(ActionKind::Unmanage);
        assert_eq!(table.respond(no_content.request_id(), 204, None), Some(ActionState::Completed));

        let failed = table.issue(ActionKind::AddLog);
        assert_eq!(
            table.respond(failed.request_id(), 400, Some("bad log".into())),
            Some(ActionState::Failed)
        );
        let snapshot = failed.outcome().await.unwrap();
        assert_eq!(snapshot.rc, Some(400));
        assert_eq!(snapshot.message.as_deref(), Some("bad log"));
    }

    #[test]
    fn test_no_backwards_transition() {
        let table = ActionTable::new(TIMEOUT);
        let pending = table.issue(ActionKind::FirmwareDownload);
        let id = pending.request_id().clone();

        table.apply(&id, Transition::Progress);
        assert_eq!(table.apply(&id, Transition::Accept), Some(ActionState::InProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_without_response_times_out() {
        let table = ActionTable::new(TIMEOUT);
        let pending = table.track("platform-1".into(), ActionKind::Reboot);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(table.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let expired = table.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state, ActionState::TimedOut);
        assert_eq!(table.pending_len(), 0);

        assert_eq!(pending.outcome().await.unwrap().state, ActionState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_last_update() {
        let table = ActionTable::new(TIMEOUT);
        let pending = table.issue(ActionKind::FirmwareDownload);

        tokio::time::advance(Duration::from_secs(50)).await;
        table.apply(pending.request_id(), Transition::Progress);
        tokio::time::advance(Duration::from_secs(50)).await;

        assert!(table.expire(Instant::now()).is_empty());
        assert_eq!(table.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_requests() {
        let table = Arc::new(ActionTable::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let sweeper = table.spawn_sweeper(Duration::from_secs(1), cancel.clone());
        let pending = table.issue(ActionKind::FactoryReset);

        let outcome = pending.outcome().await.unwrap();
        assert_eq!(outcome.state, ActionState::TimedOut);

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_abandons_waiters() {
        let table = ActionTable::new(TIMEOUT);
        let pending = table.issue(ActionKind::ClearLog);
        table.clear();
        assert!(matches!(pending.outcome().await, Err(IotError::ClientClosed)));
    }

    #[test]
    fn test_find_kind_prefers_latest() {
        let table = ActionTable::new(TIMEOUT);
        let _first = table.track("a".into(), ActionKind::FirmwareDownload);
        std::thread::sleep(Duration::from_millis(2));
        let _second = table.track("b".into(), ActionKind::FirmwareDownload);
        let _other = table.track("c".into(), ActionKind::Reboot);

        assert_eq!(table.find_kind(ActionKind::FirmwareDownload), Some("b".into()));
        assert_eq!(table.find_kind(ActionKind::FirmwareUpdate), None);
    }
}
