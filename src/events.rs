// src/events.rs
//
// Room events and the SFU event fanout.
//
// Every asynchronous notification — SFU traffic (peer joined, unpublished,
// talking, ...) and link lifecycle transitions — flows through one
// subscription point: the fanout task demultiplexes by kind, performs
// event-driven registry cleanup, and re-publishes a scoped `RoomEvent` on a
// broadcast bus. Consumers (the SSE push channel) subscribe to the bus and
// filter by room.
//
// Explicit leave/kick and event-driven cleanup converge on the same
// `retire_feed` path, so both end with the handle closed, the registry entry
// removed, and a room event emitted.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::link::LinkEvent;
use crate::registry::{Handle, HandleRegistry};
use crate::wire::{FeedId, RoomId, SfuEvent};

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and SSE filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "room.created")]
    RoomCreated,
    #[serde(rename = "room.destroyed")]
    RoomDestroyed,
    #[serde(rename = "peer.joined")]
    PeerJoined,
    #[serde(rename = "peer.leaving")]
    PeerLeaving,
    #[serde(rename = "peer.kicked")]
    PeerKicked,
    #[serde(rename = "feed.unpublished")]
    FeedUnpublished,
    #[serde(rename = "feed.closed")]
    FeedClosed,
    #[serde(rename = "feed.renegotiate")]
    FeedRenegotiate,
    #[serde(rename = "feed.talking")]
    FeedTalking,
    #[serde(rename = "feed.slow_link")]
    FeedSlowLink,
}

impl EventType {
    /// Stable string form used in SSE `event:` fields and filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoomCreated => "room.created",
            Self::RoomDestroyed => "room.destroyed",
            Self::PeerJoined => "peer.joined",
            Self::PeerLeaving => "peer.leaving",
            Self::PeerKicked => "peer.kicked",
            Self::FeedUnpublished => "feed.unpublished",
            Self::FeedClosed => "feed.closed",
            Self::FeedRenegotiate => "feed.renegotiate",
            Self::FeedTalking => "feed.talking",
            Self::FeedSlowLink => "feed.slow_link",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A room-scoped notification ready for serialisation.
///
/// ```json
/// {
///   "id":         "evt_a1b2c3d4",
///   "type":       "peer.joined",
///   "created_at": "2026-08-06T14:22:33.123Z",
///   "room_id":    1001,
///   "feed_id":    55,
///   "display":    "Alice"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    pub room_id: RoomId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<FeedId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    /// Kind-specific extras (talking level, slow-link counters).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl RoomEvent {
    fn new(event_type: EventType, room_id: RoomId) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            room_id,
            feed_id: None,
            display: None,
            detail: None,
        }
    }

    fn with_feed(mut self, feed_id: FeedId) -> Self {
        self.feed_id = Some(feed_id);
        self
    }

    pub fn room_created(room_id: RoomId) -> Self {
        Self::new(EventType::RoomCreated, room_id)
    }

    pub fn room_destroyed(room_id: RoomId) -> Self {
        Self::new(EventType::RoomDestroyed, room_id)
    }

    pub fn peer_joined(room_id: RoomId, feed_id: FeedId, display: String) -> Self {
        let mut ev = Self::new(EventType::PeerJoined, room_id).with_feed(feed_id);
        ev.display = Some(display);
        ev
    }

    pub fn peer_leaving(room_id: RoomId, feed_id: FeedId) -> Self {
        Self::new(EventType::PeerLeaving, room_id).with_feed(feed_id)
    }

    pub fn feed_unpublished(room_id: RoomId, feed_id: FeedId) -> Self {
        Self::new(EventType::FeedUnpublished, room_id).with_feed(feed_id)
    }

    pub fn feed_renegotiate(room_id: RoomId, feed_id: FeedId) -> Self {
        Self::new(EventType::FeedRenegotiate, room_id).with_feed(feed_id)
    }

    pub fn feed_talking(room_id: RoomId, feed_id: FeedId, talking: bool, level: i32) -> Self {
        let mut ev = Self::new(EventType::FeedTalking, room_id).with_feed(feed_id);
        ev.detail = Some(serde_json::json!({ "talking": talking, "audio_level": level }));
        ev
    }

    pub fn feed_slow_link(room_id: RoomId, feed_id: FeedId, uplink: bool, lost: u32) -> Self {
        let mut ev = Self::new(EventType::FeedSlowLink, room_id).with_feed(feed_id);
        ev.detail = Some(serde_json::json!({ "uplink": uplink, "lost": lost }));
        ev
    }

    pub(crate) fn retired(event_type: EventType, handle: &Handle) -> Self {
        let mut ev = Self::new(event_type, handle.room_id).with_feed(handle.feed_id);
        ev.display = Some(handle.display.clone());
        ev
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `RoomEvent`.
///
/// Subscribers that lag more than the channel capacity skip events (the
/// `broadcast::RecvError::Lagged` semantic). Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }

    /// Publish an event. Returns the number of active subscribers; zero
    /// subscribers is normal when no push channel is connected.
    pub fn emit(&self, event: RoomEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, room_id = event.room_id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver. Each receiver sees every event published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Retirement (the single cleanup path) ───────────────────────────────────

/// Close a feed's handle, drop its registry entry, and announce it.
///
/// Both explicit teardown (leave, kick) and event-driven cleanup (destroyed,
/// kicked, detached from the SFU; link recovery) go through here, so there is
/// exactly one way a feed dies.
pub fn retire_feed(
    registry: &HandleRegistry,
    bus: &EventBus,
    feed_id: FeedId,
    event_type: EventType,
) -> Option<Arc<Handle>> {
    let handle = registry.remove(feed_id)?;
    handle.close();
    bus.emit(RoomEvent::retired(event_type, &handle));
    Some(handle)
}

// ─── Fanout task ────────────────────────────────────────────────────────────

/// Spawn the background task that consumes SFU events and link transitions.
///
/// Returns a `JoinHandle` so the caller can await or abort on shutdown.
pub fn spawn_event_fanout(
    mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    registry: Arc<HandleRegistry>,
    bus: EventBus,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("event fanout started");
        while let Some(event) = link_rx.recv().await {
            match event {
                LinkEvent::Sfu(sfu_event) => apply_sfu_event(sfu_event, &registry, &bus),
                LinkEvent::Lost => {
                    warn!("control link lost, per-feed operations fail fast until recovery");
                }
                LinkEvent::Recovered => {
                    let purged = registry.purge_all();
                    warn!(
                        handles = purged.len(),
                        "control session recreated, invalidating all handles"
                    );
                    for handle in purged {
                        handle.close();
                        bus.emit(RoomEvent::feed_renegotiate(handle.room_id, handle.feed_id));
                    }
                }
            }
        }
        info!("event fanout stopped (link gone)");
    })
}

fn apply_sfu_event(event: SfuEvent, registry: &HandleRegistry, bus: &EventBus) {
    match event {
        SfuEvent::PeerJoined {
            room,
            feed,
            display,
        } => {
            bus.emit(RoomEvent::peer_joined(room, feed, display));
        }
        SfuEvent::Unpublished { room, feed } => {
            bus.emit(RoomEvent::feed_unpublished(room, feed));
        }
        SfuEvent::Leaving { room, feed } => {
            bus.emit(RoomEvent::peer_leaving(room, feed));
        }
        SfuEvent::Kicked { room, feed } => {
            if retire_feed(registry, bus, feed, EventType::PeerKicked).is_none() {
                // Already gone via the explicit kick path.
                debug!(room, feed, "kicked event for an unknown feed");
            }
        }
        SfuEvent::Talking {
            room,
            feed,
            talking,
            audio_level,
        } => {
            bus.emit(RoomEvent::feed_talking(room, feed, talking, audio_level));
        }
        SfuEvent::SlowLink {
            room,
            feed,
            uplink,
            lost,
        } => {
            bus.emit(RoomEvent::feed_slow_link(room, feed, uplink, lost));
        }
        SfuEvent::RoomDestroyed { room } => {
            for handle in registry.remove_room(room) {
                handle.close();
                bus.emit(RoomEvent::retired(EventType::FeedClosed, &handle));
            }
            bus.emit(RoomEvent::room_destroyed(room));
        }
        SfuEvent::Detached { room, feed } => {
            if retire_feed(registry, bus, feed, EventType::FeedClosed).is_none() {
                debug!(room, feed, "detached event for an unknown feed");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
