use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Lifecycle event names forwarded from the remote session.
///
/// The forwarder treats every variant identically — no filtering, no
/// coalescing — so extending the set is a one-line change here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    Ready,
    NotConnected,
    Connected,
    Disconnected,
    Error,
    FeaturesLoaded,
    Connecting,
    Authing,
    WireBusy,
    WireDone,
    SyncReqDone,
    SyncDone,
    NetworkOffline,
    NetworkOnline,
    SyncIntervalChange,
}

impl EventName {
    /// Every known lifecycle event, in the order the session emits them
    /// during a typical connect/sync cycle.
    pub const ALL: [EventName; 15] = [
        EventName::Ready,
        EventName::NotConnected,
        EventName::Connected,
        EventName::Disconnected,
        EventName::Error,
        EventName::FeaturesLoaded,
        EventName::Connecting,
        EventName::Authing,
        EventName::WireBusy,
        EventName::WireDone,
        EventName::SyncReqDone,
        EventName::SyncDone,
        EventName::NetworkOffline,
        EventName::NetworkOnline,
        EventName::SyncIntervalChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Ready => "ready",
            EventName::NotConnected => "not-connected",
            EventName::Connected => "connected",
            EventName::Disconnected => "disconnected",
            EventName::Error => "error",
            EventName::FeaturesLoaded => "features-loaded",
            EventName::Connecting => "connecting",
            EventName::Authing => "authing",
            EventName::WireBusy => "wire-busy",
            EventName::WireDone => "wire-done",
            EventName::SyncReqDone => "sync-req-done",
            EventName::SyncDone => "sync-done",
            EventName::NetworkOffline => "network-offline",
            EventName::NetworkOnline => "network-online",
            EventName::SyncIntervalChange => "sync-interval-change",
        }
    }
}

/// One fired lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub name: EventName,
    pub data: Value,
}

/// Fans session lifecycle events out to every bridge connection.
#[derive(Clone)]
pub struct SessionBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Fire an event. No subscribers is fine.
    pub fn emit(&self, name: EventName, data: Value) {
        let _ = self.tx.send(SessionEvent { name, data });
    }

    /// Subscribe to all events fired after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
