//! Routing of inbound messages to user handlers.
//!
//! Handlers register against a [`Pattern`] (device type, id, format, each
//! optional) for one message class. For every inbound message the
//! dispatcher:
//!
//! 1. parses the topic (unknown topics are logged and dropped),
//! 2. selects the single best registration: the one with the fewest
//!    wildcard fields, the earliest registration winning ties,
//! 3. decodes the payload with the codec named by the topic's format,
//! 4. invokes the handler.
//!
//! Decode failures and panicking handlers are reported to the error
//! callback (or logged when none is set); they never propagate into the
//! transport loop that called [`Dispatcher::dispatch`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, trace, warn};

use crate::codec::CodecRegistry;
use crate::error::IotError;
use crate::message::{Envelope, Payload};
use crate::topic::{self, MessageClass, TopicInfo};

/// A decoded inbound message handed to handlers.
#[derive(Debug, Clone)]
pub struct Message {
    topic: TopicInfo,
    envelope: Envelope,
}

impl Message {
    pub fn new(topic: TopicInfo, envelope: Envelope) -> Self {
        Self { topic, envelope }
    }

    pub fn topic(&self) -> &TopicInfo {
        &self.topic
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn data(&self) -> &Payload {
        self.envelope.data()
    }

    /// Event id, command id or management path.
    pub fn id(&self) -> &str {
        self.topic.id()
    }

    pub fn device_type(&self) -> Option<&str> {
        self.topic.device_type()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.topic.device_id()
    }

    pub fn format(&self) -> &str {
        self.topic.format()
    }
}

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Receives `(topic, raw payload, error)` for every message that could not
/// be delivered.
pub type ErrorCallback = Arc<dyn Fn(&str, &[u8], &IotError) + Send + Sync>;

/// A handler for one message class.
#[derive(Clone)]
pub enum Handler {
    Command(Callback),
    Event(Callback),
    Notification(Callback),
    Management(Callback),
}

impl Handler {
    pub fn command(f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Handler::Command(Arc::new(f))
    }

    pub fn event(f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Handler::Event(Arc::new(f))
    }

    pub fn notification(f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Handler::Notification(Arc::new(f))
    }

    pub fn management(f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Handler::Management(Arc::new(f))
    }

    pub fn class(&self) -> MessageClass {
        match self {
            Handler::Command(_) => MessageClass::Command,
            Handler::Event(_) => MessageClass::Event,
            Handler::Notification(_) => MessageClass::Notification,
            Handler::Management(_) => MessageClass::Management,
        }
    }

    fn callback(&self) -> &Callback {
        match self {
            Handler::Command(cb) | Handler::Event(cb) | Handler::Notification(cb) | Handler::Management(cb) => cb,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.class())
    }
}

/// Which messages a handler wants. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern {
    device_type: Option<String>,
    id: Option<String>,
    format: Option<String>,
}

impl Pattern {
    /// Matches everything of the handler's class.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Event id, command id or management path.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Number of wildcard fields; lower is more specific.
    pub fn wildcards(&self) -> usize {
        [&self.device_type, &self.id, &self.format]
            .iter()
            .filter(|field| field.is_none())
            .count()
    }

    pub fn matches(&self, info: &TopicInfo) -> bool {
        let field_matches = |want: &Option<String>, have: Option<&str>| match want {
            None => true,
            Some(want) => have == Some(want.as_str()),
        };
        field_matches(&self.device_type, info.device_type())
            && field_matches(&self.id, Some(info.id()))
            && field_matches(&self.format, Some(info.format()))
    }
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran to completion.
    Handled,
    /// No registration matched, or the topic is not a platform topic.
    Unmatched,
    /// Decoding failed or the handler panicked.
    Failed,
}

struct Registration {
    pattern: Pattern,
    handler: Handler,
}

/// Routes inbound messages to registered handlers.
pub struct Dispatcher {
    codecs: Arc<CodecRegistry>,
    routes: RwLock<Vec<Registration>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

impl Dispatcher {
    pub fn new(codecs: Arc<CodecRegistry>) -> Self {
        Self {
            codecs,
            routes: RwLock::new(Vec::new()),
            on_error: RwLock::new(None),
        }
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Adds a handler. Registration order breaks specificity ties.
    pub fn register(&self, pattern: Pattern, handler: Handler) {
        debug!(class = %handler.class(), ?pattern, "Registering message handler");
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.push(Registration { pattern, handler });
    }

    /// Sets the callback that receives undeliverable messages.
    pub fn on_error(&self, callback: impl Fn(&str, &[u8], &IotError) + Send + Sync + 'static) {
        let mut slot = self.on_error.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(callback));
    }

    pub fn handler_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The handler that would receive a message on `info`, if any.
    pub fn best_match(&self, info: &TopicInfo) -> Option<Handler> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<&Registration> = None;
        for route in routes.iter() {
            if route.handler.class() != info.class() || !route.pattern.matches(info) {
                continue;
            }
            // Strictly fewer wildcards replaces; ties keep the earlier one.
            if best.map_or(true, |b| route.pattern.wildcards() < b.pattern.wildcards()) {
                best = Some(route);
            }
        }
        best.map(|route| route.handler.clone())
    }

    /// Delivers one inbound message.
    pub fn dispatch(&self, topic: &str, raw: &[u8]) -> Dispatched {
        let info = match topic::parse(topic) {
            Ok(info) => info,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping message on unsupported topic");
                return Dispatched::Unmatched;
            }
        };

        let Some(handler) = self.best_match(&info) else {
            debug!(topic = %topic, class = %info.class(), "No handler registered, dropping message");
            return Dispatched::Unmatched;
        };

        let envelope = match self.codecs.decode(info.format(), raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(topic, raw, &e);
                return Dispatched::Failed;
            }
        };

        trace!(topic = %topic, format = %info.format(), "Dispatching message");
        let message = Message::new(info, envelope);
        let callback = handler.callback();
        match catch_unwind(AssertUnwindSafe(|| callback(&message))) {
            Ok(()) => Dispatched::Handled,
            Err(panic) => {
                let err = IotError::Handler(panic_message(panic.as_ref()));
                self.report(topic, raw, &err);
                Dispatched::Failed
            }
        }
    }

    fn report(&self, topic: &str, raw: &[u8], err: &IotError) {
        let callback = self.on_error.read().unwrap_or_else(|e| e.into_inner()).clone();
        match callback {
            Some(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(topic, raw, err))).is_err() {
                    error!(topic = %topic, error = %err, "Error callback panicked");
                }
            }
            None => error!(topic = %topic, error = %err, "Failed to deliver message"),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
