// src/sse.rs
//
// Server-Sent Events push channel.
//
// ─ Usage ────────────────────────────────────────────────────────────────────
//
//   GET /v1/events?room_id=<room_id>
//
//   The connection stays open and streams room events as they occur.
//
//   Optional query parameters:
//     room_id   -- filter events to a specific room (omit for all rooms).
//     types     -- comma-separated event types to receive
//                  (e.g. "peer.joined,feed.renegotiate").
//
//   Each SSE message has:
//     event: <event_type>       (e.g. "peer.joined")
//     id:    <event_id>         (e.g. "evt_a1b2c3d4")
//     data:  <json payload>
//
// ─ Implementation ───────────────────────────────────────────────────────────
//
//   The handler subscribes to the event bus and converts each received event
//   into an SSE frame. Filtering happens in the stream itself so only
//   matching events go over the wire. Clients that receive a
//   `feed.renegotiate` event must tear down and re-join: their SFU-side
//   handle no longer exists.
//
// ────────────────────────────────────────────────────────────────────────────

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::events::{EventType, RoomEvent};
use crate::wire::RoomId;

// ─── Query parameters ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    /// Filter to a specific room.
    pub room_id: Option<RoomId>,

    /// Comma-separated list of event types.  Example: "peer.joined,peer.kicked"
    pub types: Option<String>,
}

impl SseQuery {
    /// Parse the `types` param into a set of `EventType`.
    fn parsed_types(&self) -> Option<Vec<EventType>> {
        self.types.as_ref().map(|s| {
            s.split(',')
                .filter_map(|t| {
                    let trimmed = t.trim();
                    serde_json::from_str::<EventType>(&format!("\"{trimmed}\"")).ok()
                })
                .collect()
        })
    }

    /// Returns `true` if the event matches this query's filters.
    fn matches(&self, event: &RoomEvent) -> bool {
        if let Some(room_id) = self.room_id {
            if event.room_id != room_id {
                return false;
            }
        }

        if let Some(types) = self.parsed_types() {
            if !types.is_empty() && !types.contains(&event.event_type) {
                return false;
            }
        }

        true
    }
}

// ─── SSE handler ────────────────────────────────────────────────────────────

/// `GET /v1/events` -- SSE stream of room events.
///
/// The stream emits a heartbeat comment every 15 seconds to keep the
/// connection alive through proxies and load balancers.
pub async fn sse_events(
    State(state): State<Arc<crate::AppState>>,
    Query(query): Query<SseQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.event_bus.subscribe();

    let room_filter = query
        .room_id
        .map(|r| r.to_string())
        .unwrap_or_else(|| "*".to_string());
    info!(
        room_id = %room_filter,
        types = query.types.as_deref().unwrap_or("*"),
        "SSE client connected"
    );

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !query.matches(&event) {
                        continue;
                    }

                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("SSE: failed to serialize event: {e}");
                            continue;
                        }
                    };

                    let sse_event = SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.clone())
                        .data(json);

                    yield Ok(sse_event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged, skipped {n} events");
                    // Tell the client it missed data.
                    let warning = SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}"));
                    yield Ok(warning);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_no_filter() {
        let query = SseQuery {
            room_id: None,
            types: None,
        };
        let evt = RoomEvent::room_created(1001);
        assert!(query.matches(&evt));
    }

    #[test]
    fn query_matches_room_filter() {
        let query = SseQuery {
            room_id: Some(1001),
            types: None,
        };
        let evt1 = RoomEvent::room_created(1001);
        let evt2 = RoomEvent::room_created(2002);
        assert!(query.matches(&evt1));
        assert!(!query.matches(&evt2));
    }

    #[test]
    fn query_matches_type_filter() {
        let query = SseQuery {
            room_id: None,
            types: Some("peer.joined,peer.kicked".to_string()),
        };
        let evt1 = RoomEvent::peer_joined(1, 2, "Alice".into());
        let evt2 = RoomEvent::room_created(1);
        assert!(query.matches(&evt1));
        assert!(!query.matches(&evt2));
    }

    #[test]
    fn query_matches_combined_filters() {
        let query = SseQuery {
            room_id: Some(7),
            types: Some("feed.renegotiate".to_string()),
        };
        let good = RoomEvent::feed_renegotiate(7, 55);
        let wrong_room = RoomEvent::feed_renegotiate(8, 55);
        let wrong_type = RoomEvent::peer_joined(7, 55, "Alice".into());

        assert!(query.matches(&good));
        assert!(!query.matches(&wrong_room));
        assert!(!query.matches(&wrong_type));
    }

    #[test]
    fn unknown_type_names_are_ignored() {
        let query = SseQuery {
            room_id: None,
            types: Some("nonsense,peer.joined".to_string()),
        };
        let types = query.parsed_types().unwrap();
        assert_eq!(types, vec![EventType::PeerJoined]);
    }
}
