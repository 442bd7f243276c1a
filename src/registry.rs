use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::wire::{FeedId, HandleId, RoomId};

// ---------------------------------------------------------------------------
// FeedRole
// ---------------------------------------------------------------------------

/// Which side of the SFU a handle sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedRole {
    /// Sends media into a room.
    Publisher,
    /// Receives one publisher's media.
    Subscriber,
}

// ---------------------------------------------------------------------------
// NegotiationState
// ---------------------------------------------------------------------------

/// Per-feed negotiation progress.
///
/// The legal transitions form a strict forward path with a single rollback
/// edge (`Configuring` back to `Published` when the SFU rejects an offer)
/// and a terminal `Closed` reachable from everywhere. Closed means gone:
/// a closed handle never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Idle,
    Joining,
    Published,
    Subscribed,
    Configuring,
    Active,
    Leaving,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Published => "published",
            Self::Subscribed => "subscribed",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

fn transition_is_legal(from: NegotiationState, to: NegotiationState) -> bool {
    use NegotiationState::*;
    matches!(
        (from, to),
        (Idle, Joining)
            | (Joining, Published)
            | (Joining, Subscribed)
            | (Published, Configuring)
            | (Configuring, Active)
            | (Configuring, Published)
            | (Subscribed, Active)
            | (Joining, Leaving)
            | (Published, Leaving)
            | (Subscribed, Leaving)
            | (Configuring, Leaving)
            | (Active, Leaving)
    )
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// One SFU-side endpoint bound to one role in one room.
///
/// The registry owns the entry; callers borrow `Arc`s but must treat a
/// removed entry as dead — every operation re-checks `is_closed` under the
/// op lock before touching the SFU.
#[derive(Debug)]
pub struct Handle {
    pub feed_id: FeedId,
    pub handle_id: HandleId,
    pub room_id: RoomId,
    pub role: FeedRole,
    pub display: String,
    /// Publisher feed a subscriber is currently attached to. Publishers
    /// carry `None`; switch re-points it.
    pub target: RwLock<Option<FeedId>>,
    state: RwLock<NegotiationState>,
    /// Serializes all state-mutating operations on this feed. Held across
    /// the remote call so two negotiations can never interleave.
    pub op_lock: Mutex<()>,
    /// Cancelled by leave/kick; any in-flight negotiation step observes it
    /// and bails out.
    pub cancel: CancellationToken,
}

impl Handle {
    pub fn new_publisher(
        feed_id: FeedId,
        handle_id: HandleId,
        room_id: RoomId,
        display: String,
    ) -> Self {
        Self::new(feed_id, handle_id, room_id, FeedRole::Publisher, display, None)
    }

    pub fn new_subscriber(
        feed_id: FeedId,
        handle_id: HandleId,
        room_id: RoomId,
        display: String,
        target: FeedId,
    ) -> Self {
        Self::new(
            feed_id,
            handle_id,
            room_id,
            FeedRole::Subscriber,
            display,
            Some(target),
        )
    }

    fn new(
        feed_id: FeedId,
        handle_id: HandleId,
        room_id: RoomId,
        role: FeedRole,
        display: String,
        target: Option<FeedId>,
    ) -> Self {
        let handle = Self {
            feed_id,
            handle_id,
            room_id,
            role,
            display,
            target: RwLock::new(target),
            state: RwLock::new(NegotiationState::Idle),
            op_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        };
        // A fresh handle is already mid-join by the time it exists.
        let _ = handle.transition(NegotiationState::Joining);
        handle
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.read().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    /// Attempt a state transition. Returns the previous state on success and
    /// the unchanged current state when the transition is not legal.
    ///
    /// `Closed` is always reachable from any live state; nothing is reachable
    /// from `Closed`.
    pub fn transition(
        &self,
        to: NegotiationState,
    ) -> Result<NegotiationState, NegotiationState> {
        let mut state = self.state.write().unwrap();
        let from = *state;
        if from == NegotiationState::Closed {
            return Err(from);
        }
        if to == NegotiationState::Closed || transition_is_legal(from, to) {
            *state = to;
            Ok(from)
        } else {
            Err(from)
        }
    }

    /// Terminal shutdown: cancel anything in flight and pin the state to
    /// `Closed`. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let _ = self.transition(NegotiationState::Closed);
    }
}

// ---------------------------------------------------------------------------
// HandleRegistry
// ---------------------------------------------------------------------------

/// The single source of truth for which handle belongs to which feed.
///
/// Replaces ad-hoc shared maps with explicit atomic allocate/lookup/remove;
/// all mutations go through one write lock, so a feed id can never point at
/// two handles.
#[derive(Default)]
pub struct HandleRegistry {
    inner: RwLock<HashMap<FeedId, Arc<Handle>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly negotiated handle under its SFU-assigned feed id.
    pub fn allocate(&self, handle: Handle) -> Result<Arc<Handle>, GatewayError> {
        let mut map = self.inner.write().unwrap();
        if map.contains_key(&handle.feed_id) {
            return Err(GatewayError::FeedCollision(handle.feed_id));
        }
        let entry = Arc::new(handle);
        map.insert(entry.feed_id, entry.clone());
        Ok(entry)
    }

    /// Fetch a live handle. Closed entries count as gone.
    pub fn lookup(&self, feed_id: FeedId) -> Result<Arc<Handle>, GatewayError> {
        let map = self.inner.read().unwrap();
        match map.get(&feed_id) {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(GatewayError::HandleNotFound(feed_id)),
        }
    }

    /// Raw fetch, closed entries included. Used by idempotent teardown.
    pub fn get(&self, feed_id: FeedId) -> Option<Arc<Handle>> {
        self.inner.read().unwrap().get(&feed_id).cloned()
    }

    pub fn remove(&self, feed_id: FeedId) -> Option<Arc<Handle>> {
        self.inner.write().unwrap().remove(&feed_id)
    }

    /// Snapshot of the live publishers in a room.
    pub fn publishers_of(&self, room_id: RoomId) -> Vec<Arc<Handle>> {
        let map = self.inner.read().unwrap();
        map.values()
            .filter(|h| h.room_id == room_id && h.role == FeedRole::Publisher && !h.is_closed())
            .cloned()
            .collect()
    }

    /// Live publisher handle for a given display name in a room, if any.
    pub fn publisher_in_room(&self, room_id: RoomId, display: &str) -> Option<Arc<Handle>> {
        let map = self.inner.read().unwrap();
        map.values()
            .find(|h| {
                h.room_id == room_id
                    && h.role == FeedRole::Publisher
                    && h.display == display
                    && !h.is_closed()
            })
            .cloned()
    }

    /// Detach every handle in a room, returning the removed entries.
    pub fn remove_room(&self, room_id: RoomId) -> Vec<Arc<Handle>> {
        let mut map = self.inner.write().unwrap();
        let feeds: Vec<FeedId> = map
            .values()
            .filter(|h| h.room_id == room_id)
            .map(|h| h.feed_id)
            .collect();
        feeds.iter().filter_map(|f| map.remove(f)).collect()
    }

    /// Drop every entry. Used when the control session is lost: all
    /// SFU-side state is gone, so every handle is invalid.
    pub fn purge_all(&self) -> Vec<Arc<Handle>> {
        let mut map = self.inner.write().unwrap();
        map.drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(feed: FeedId, room: RoomId, display: &str) -> Handle {
        Handle::new_publisher(feed, feed + 1000, room, display.to_string())
    }

    #[test]
    fn publisher_path_advances_strictly() {
        let h = publisher(1, 10, "Alice");
        assert_eq!(h.state(), NegotiationState::Joining);
        assert!(h.transition(NegotiationState::Published).is_ok());
        assert!(h.transition(NegotiationState::Configuring).is_ok());
        assert!(h.transition(NegotiationState::Active).is_ok());

        // No regression, no skipping.
        assert_eq!(
            h.transition(NegotiationState::Published),
            Err(NegotiationState::Active)
        );
        assert_eq!(
            h.transition(NegotiationState::Configuring),
            Err(NegotiationState::Active)
        );
    }

    #[test]
    fn configure_rejection_rolls_back_to_published() {
        let h = publisher(1, 10, "Alice");
        h.transition(NegotiationState::Published).unwrap();
        h.transition(NegotiationState::Configuring).unwrap();
        assert_eq!(
            h.transition(NegotiationState::Published),
            Ok(NegotiationState::Configuring)
        );
    }

    #[test]
    fn closed_is_terminal() {
        let h = publisher(1, 10, "Alice");
        h.close();
        assert!(h.is_closed());
        assert!(h.cancel.is_cancelled());
        for to in [
            NegotiationState::Joining,
            NegotiationState::Published,
            NegotiationState::Active,
            NegotiationState::Closed,
        ] {
            assert_eq!(h.transition(to), Err(NegotiationState::Closed));
        }
    }

    #[test]
    fn allocate_rejects_feed_collision() {
        let reg = HandleRegistry::new();
        reg.allocate(publisher(7, 10, "Alice")).unwrap();
        let err = reg.allocate(publisher(7, 10, "Bob")).unwrap_err();
        assert_eq!(err, GatewayError::FeedCollision(7));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookup_treats_closed_as_gone() {
        let reg = HandleRegistry::new();
        let h = reg.allocate(publisher(7, 10, "Alice")).unwrap();
        assert!(reg.lookup(7).is_ok());

        h.close();
        assert_eq!(reg.lookup(7).unwrap_err(), GatewayError::HandleNotFound(7));
        // The raw accessor still sees the entry until teardown removes it.
        assert!(reg.get(7).is_some());
    }

    #[test]
    fn publisher_snapshot_excludes_subscribers_and_other_rooms() {
        let reg = HandleRegistry::new();
        reg.allocate(publisher(1, 10, "Alice")).unwrap();
        reg.allocate(publisher(2, 11, "Bob")).unwrap();
        reg.allocate(Handle::new_subscriber(3, 1003, 10, "Alice".into(), 1))
            .unwrap();

        let pubs = reg.publishers_of(10);
        assert_eq!(pubs.len(), 1);
        assert_eq!(pubs[0].feed_id, 1);
    }

    #[test]
    fn publisher_in_room_matches_display() {
        let reg = HandleRegistry::new();
        reg.allocate(publisher(1, 10, "Alice")).unwrap();
        assert!(reg.publisher_in_room(10, "Alice").is_some());
        assert!(reg.publisher_in_room(10, "Bob").is_none());
        assert!(reg.publisher_in_room(11, "Alice").is_none());
    }

    #[test]
    fn remove_room_detaches_every_handle() {
        let reg = HandleRegistry::new();
        reg.allocate(publisher(1, 10, "Alice")).unwrap();
        reg.allocate(Handle::new_subscriber(2, 1002, 10, "Alice".into(), 1))
            .unwrap();
        reg.allocate(publisher(3, 11, "Carol")).unwrap();

        let removed = reg.remove_room(10);
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.lookup(3).is_ok());
    }

    #[test]
    fn purge_all_empties_the_registry() {
        let reg = HandleRegistry::new();
        reg.allocate(publisher(1, 10, "Alice")).unwrap();
        reg.allocate(publisher(2, 10, "Bob")).unwrap();

        let purged = reg.purge_all();
        assert_eq!(purged.len(), 2);
        assert!(reg.is_empty());
    }
}
