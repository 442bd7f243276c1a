// src/wire.rs
//
// Control-channel wire types.
//
// The SFU is driven over a WebSocket carrying JSON frames. Outgoing frames
// are requests tagged with a per-request `transaction` id; incoming frames
// are either replies (carrying the originating transaction) or unsolicited
// events. The media plane never crosses this channel — only session
// descriptions and ICE candidates do.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

// ─── Identifiers ────────────────────────────────────────────────────────────

/// Room ids are chosen by the administrative caller.
pub type RoomId = u64;
/// Feed ids are assigned by the SFU at join/subscribe time.
pub type FeedId = u64;
/// SFU-side endpoint handle ids, assigned at attach time.
pub type HandleId = u64;
/// Control session id, assigned once per connection.
pub type SessionId = u64;

/// Fresh transaction id for request/reply correlation.
pub fn new_transaction() -> String {
    format!("txn_{}", uuid::Uuid::new_v4().simple())
}

// ─── SFU error codes we act on ──────────────────────────────────────────────

/// The targeted room is not known to the SFU.
pub const ERR_NO_SUCH_ROOM: u16 = 426;
/// The targeted feed is not known to the SFU.
pub const ERR_NO_SUCH_FEED: u16 = 428;
/// The supplied room secret was rejected.
pub const ERR_UNAUTHORIZED: u16 = 403;

// ─── Negotiation payloads ───────────────────────────────────────────────────

/// An SDP offer or answer, as exchanged with browsers and the SFU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[allow(dead_code)]
impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// A single trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// A publisher as reported by the SFU in join replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub feed: FeedId,
    pub display: String,
}

// ─── Requests ───────────────────────────────────────────────────────────────

/// One control request to the SFU.
///
/// `candidate: None` on `Trickle` is the end-of-candidates marker; it is
/// serialized as an explicit `null` so the SFU can tell the two apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum RequestBody {
    CreateSession,
    Attach,
    CreateRoom {
        room: RoomId,
        description: String,
        is_private: bool,
        permanent: bool,
        secret: String,
    },
    Join {
        handle: HandleId,
        room: RoomId,
        display: String,
    },
    JoinListener {
        handle: HandleId,
        room: RoomId,
        feed: FeedId,
    },
    Configure {
        handle: HandleId,
        jsep: SessionDescription,
        audio: bool,
        video: bool,
        data: bool,
    },
    Start {
        handle: HandleId,
        jsep: SessionDescription,
    },
    Trickle {
        handle: HandleId,
        candidate: Option<IceCandidate>,
    },
    Pause {
        handle: HandleId,
    },
    Switch {
        handle: HandleId,
        to_feed: FeedId,
        audio: bool,
        video: bool,
        data: bool,
    },
    Leave {
        handle: HandleId,
    },
    Detach {
        handle: HandleId,
    },
    Kick {
        room: RoomId,
        feed: FeedId,
        secret: String,
    },
    DestroyRoom {
        room: RoomId,
        permanent: bool,
        secret: String,
    },
}

/// The frame actually written to the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(flatten)]
    pub body: RequestBody,
}

// ─── Replies ────────────────────────────────────────────────────────────────

/// Error object attached to a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub reason: String,
}

/// Union of all reply payload fields. Each operation reads the fields it
/// expects and treats their absence as a protocol error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<HandleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publishers: Option<Vec<PublisherInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsep: Option<SessionDescription>,
    /// Server-internal negotiation bookkeeping. Stripped before any reply
    /// payload reaches a client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireReply {
    pub transaction: String,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub data: Option<ReplyData>,
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Unsolicited events pushed by the SFU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SfuEvent {
    PeerJoined {
        room: RoomId,
        feed: FeedId,
        display: String,
    },
    Unpublished {
        room: RoomId,
        feed: FeedId,
    },
    Leaving {
        room: RoomId,
        feed: FeedId,
    },
    Kicked {
        room: RoomId,
        feed: FeedId,
    },
    Talking {
        room: RoomId,
        feed: FeedId,
        talking: bool,
        audio_level: i32,
    },
    SlowLink {
        room: RoomId,
        feed: FeedId,
        uplink: bool,
        lost: u32,
    },
    RoomDestroyed {
        room: RoomId,
    },
    Detached {
        room: RoomId,
        feed: FeedId,
    },
}

/// Any frame read from the socket. Replies carry a `transaction`, events an
/// `event` tag — the two shapes are disjoint, so untagged deserialization is
/// unambiguous.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Reply(WireReply),
    Event(SfuEvent),
}

// ─── Tests ──────────────────────────────────────────────────────────────────
