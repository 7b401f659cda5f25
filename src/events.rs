use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};
use url::Url;

pub const PLAYER_EVENT_TYPE: &str = "PLAYER_EVENT";
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Signal broadcast after every successful write of the progress table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdated;

/// Raw message posted by an embedded player, before any validation.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub origin: String,
    pub payload: String,
}

/// A validated `PLAYER_EVENT` message.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerEvent {
    pub origin: String,
    pub data: Value,
}

impl PlayerEvent {
    pub fn event_name(&self) -> Option<&str> {
        self.data.get("event").and_then(Value::as_str)
    }

    pub fn current_time(&self) -> Option<f64> {
        self.data.get("currentTime").and_then(Value::as_f64)
    }

    pub fn duration(&self) -> Option<f64> {
        self.data.get("duration").and_then(Value::as_f64)
    }

    /// Catalog id of the playing title. Players send it either as a number or
    /// as a numeric string.
    pub fn media_id(&self) -> Option<u64> {
        lenient_u64(self.data.get("id")?)
    }

    pub fn episode(&self) -> Option<u32> {
        lenient_u64(self.data.get("episode")?).and_then(|ep| u32::try_from(ep).ok())
    }
}

fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RejectReason {
    #[error("origin {0} is not allow-listed")]
    UntrustedOrigin(String),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected message type {0:?}")]
    UnexpectedType(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Origins whose player messages are trusted. Entries are compared by
/// scheme, host and port.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowList {
    origins: HashSet<String>,
}

impl OriginAllowList {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = HashSet::new();
        for origin in origins {
            match normalize_origin(origin.as_ref()) {
                Some(normalized) => {
                    allowed.insert(normalized);
                }
                None => warn!(origin = origin.as_ref(), "ignoring invalid allow-list origin"),
            }
        }
        Self { origins: allowed }
    }

    pub fn allows(&self, origin: &str) -> bool {
        normalize_origin(origin).is_some_and(|normalized| self.origins.contains(&normalized))
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

pub type ListenerId = u64;
type Listener = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

/// Fans progress notifications and player events out to decoupled observers.
pub struct EventBus {
    updates: broadcast::Sender<ProgressUpdated>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    allow_list: OriginAllowList,
}

impl EventBus {
    pub fn new(allow_list: OriginAllowList) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            updates,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            allow_list,
        }
    }

    pub fn notify_changed(&self) {
        let receivers = self.updates.send(ProgressUpdated).unwrap_or(0);
        trace!(receivers, "progress update broadcast");
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ProgressUpdated> {
        self.updates.subscribe()
    }

    pub fn subscribe<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Validates a raw message at the trust boundary.
    pub fn accept(&self, message: &InboundMessage) -> Result<PlayerEvent, RejectReason> {
        if !self.allow_list.allows(&message.origin) {
            return Err(RejectReason::UntrustedOrigin(message.origin.clone()));
        }
        let envelope: Envelope = serde_json::from_str(&message.payload)?;
        if envelope.kind != PLAYER_EVENT_TYPE {
            return Err(RejectReason::UnexpectedType(envelope.kind));
        }
        Ok(PlayerEvent {
            origin: message.origin.clone(),
            data: envelope.data,
        })
    }

    /// Delivers an accepted message to every listener and returns how many
    /// were invoked. Rejected messages reach no listener.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let event = match self.accept(message) {
            Ok(event) => event,
            Err(reason) => {
                debug!(origin = %message.origin, "dropping player message: {reason}");
                return 0;
            }
        };
        // Handlers may (un)subscribe, so call them outside the lock.
        let listeners: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &listeners {
            listener(&event);
        }
        listeners.len()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sending half of the inbound player channel. Any transport (a socket, a
/// webview bridge, stdin) posts raw messages here.
#[derive(Debug, Clone)]
pub struct PlayerInbox {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl PlayerInbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the listener side has gone away.
    pub fn post(&self, origin: impl Into<String>, payload: impl Into<String>) -> bool {
        self.tx
            .send(InboundMessage {
                origin: origin.into(),
                payload: payload.into(),
            })
            .is_ok()
    }
}

pub(crate) async fn run_listener(
    bus: Arc<EventBus>,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = rx.recv().await {
        bus.dispatch(&message);
    }
    debug!("player inbox closed");
}
