// src/orchestrator.rs
//
// The per-feed negotiation state machine.
//
// Every control operation lands here: the orchestrator borrows handles from
// the registry, talks to the SFU through the `SfuChannel` seam, and keeps
// the per-feed state machine honest:
//
//   Joining → Published ──→ Configuring → Active → Leaving → Closed
//         └──→ Subscribed ─────────────────┘
//
// Per-feed serialization: every state-mutating operation holds the handle's
// op lock across the remote call. Cross-feed operations never contend.
// Leave and kick cancel the handle's token first, so an in-flight
// configure/start observes the cancellation, bails out with
// `HandleNotFound`, and releases the lock — the terminating operation
// always wins.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::directory::{RoomDirectory, RoomListing};
use crate::error::GatewayError;
use crate::events::{retire_feed, EventBus, EventType, RoomEvent};
use crate::link::{LinkStatus, SfuChannel};
use crate::registry::{FeedRole, Handle, HandleRegistry, NegotiationState};
use crate::wire::{
    FeedId, HandleId, IceCandidate, RequestBody, RoomId, SessionDescription, ERR_NO_SUCH_FEED,
    ERR_NO_SUCH_ROOM, ERR_UNAUTHORIZED,
};

// ─── Results handed back to the control surface ─────────────────────────────

/// Read-only projection of one publisher, for join replies and listings.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    pub feed_id: FeedId,
    pub display: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedRoom {
    pub feed_id: FeedId,
    pub display: String,
    pub publishers: Vec<ParticipantView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub feed_id: FeedId,
    pub display: String,
    pub sdp_offer: SessionDescription,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Orchestrator {
    channel: Arc<dyn SfuChannel>,
    registry: Arc<HandleRegistry>,
    directory: Arc<RoomDirectory>,
    bus: EventBus,
}

impl Orchestrator {
    pub fn new(
        channel: Arc<dyn SfuChannel>,
        registry: Arc<HandleRegistry>,
        directory: Arc<RoomDirectory>,
        bus: EventBus,
    ) -> Self {
        Self {
            channel,
            registry,
            directory,
            bus,
        }
    }

    // ── Room administration ─────────────────────────────────────────────

    /// Register the room with the SFU and mirror it into the directory.
    /// Returns the one-time admin secret. Either both sides know the room
    /// afterwards or neither does.
    pub async fn create_room(
        &self,
        room_id: RoomId,
        description: String,
        is_private: bool,
        permanent: bool,
    ) -> Result<String, GatewayError> {
        let secret = self
            .directory
            .create(room_id, &description, is_private, permanent)?;

        let request = RequestBody::CreateRoom {
            room: room_id,
            description,
            is_private,
            permanent,
            secret: secret.clone(),
        };
        if let Err(err) = self.channel.request(request).await {
            // No join can succeed against a room the SFU doesn't know, so an
            // advisory-only record would be a lie.
            self.directory.destroy(room_id);
            return Err(err);
        }

        self.bus.emit(RoomEvent::room_created(room_id));
        info!(room_id, "room created");
        Ok(secret)
    }

    pub fn list_rooms(&self) -> Vec<RoomListing> {
        self.directory.list()
    }

    pub async fn destroy_room(
        &self,
        room_id: RoomId,
        permanent: bool,
        secret: String,
    ) -> Result<(), GatewayError> {
        self.directory.authorize(room_id, &secret)?;

        let request = RequestBody::DestroyRoom {
            room: room_id,
            permanent,
            secret,
        };
        self.channel.request(request).await.map_err(|err| match err {
            GatewayError::Rejected {
                code: ERR_UNAUTHORIZED,
                ..
            } => GatewayError::Unauthorized,
            GatewayError::Rejected {
                code: ERR_NO_SUCH_ROOM,
                ..
            } => GatewayError::RoomNotFound(room_id),
            other => other,
        })?;

        for handle in self.registry.remove_room(room_id) {
            handle.close();
            self.bus
                .emit(RoomEvent::retired(EventType::FeedClosed, &handle));
        }
        if let Some(record) = self.directory.destroy(room_id) {
            let lived_secs = (chrono::Utc::now() - record.created_at).num_seconds();
            info!(room_id, permanent = record.permanent, lived_secs, "room destroyed");
        }
        self.bus.emit(RoomEvent::room_destroyed(room_id));
        Ok(())
    }

    pub fn list_participants(
        &self,
        room_id: RoomId,
    ) -> Result<Vec<ParticipantView>, GatewayError> {
        if !self.directory.exists(room_id) {
            return Err(GatewayError::RoomNotFound(room_id));
        }
        Ok(self
            .registry
            .publishers_of(room_id)
            .into_iter()
            .map(|h| ParticipantView {
                feed_id: h.feed_id,
                display: h.display.clone(),
            })
            .collect())
    }

    // ── Publisher path ──────────────────────────────────────────────────

    /// Join a room as a publisher. Returns the SFU-assigned feed id and the
    /// publishers already present, so the client can subscribe immediately.
    ///
    /// Allocation and the remote join are transactionally linked: if any
    /// step fails, the attached SFU handle is released and nothing is
    /// registered.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        display: String,
    ) -> Result<JoinedRoom, GatewayError> {
        if self.registry.publisher_in_room(room_id, &display).is_some() {
            // Re-joining over a live feed signals a client-side bug; an
            // idempotent no-op would hide it.
            return Err(GatewayError::AlreadyJoined { room_id, display });
        }

        let handle_id = self.attach().await?;

        let reply = match self
            .channel
            .request(RequestBody::Join {
                handle: handle_id,
                room: room_id,
                display: display.clone(),
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                self.detach_quietly(handle_id).await;
                return Err(match err {
                    GatewayError::Rejected {
                        code: ERR_NO_SUCH_ROOM,
                        ..
                    } => GatewayError::RoomNotFound(room_id),
                    GatewayError::Rejected { reason, .. } => GatewayError::JoinFailed(reason),
                    other => other,
                });
            }
        };

        let feed_id = match reply.feed {
            Some(feed) => feed,
            None => {
                self.detach_quietly(handle_id).await;
                return Err(GatewayError::Protocol("join reply missing feed id".into()));
            }
        };
        let display = reply.display.unwrap_or(display);
        let publishers = reply
            .publishers
            .unwrap_or_default()
            .into_iter()
            .map(|p| ParticipantView {
                feed_id: p.feed,
                display: p.display,
            })
            .collect();

        let handle = Handle::new_publisher(feed_id, handle_id, room_id, display.clone());
        let handle = match self.registry.allocate(handle) {
            Ok(handle) => handle,
            Err(err) => {
                self.detach_quietly(handle_id).await;
                return Err(err);
            }
        };
        let _ = handle.transition(NegotiationState::Published);

        let display_field = &display;
        info!(room_id, feed_id, display = %display_field, "publisher joined");
        Ok(JoinedRoom {
            feed_id,
            display,
            publishers,
        })
    }

    /// Send the publisher's SDP offer and media flags; returns the SFU's
    /// answer. The feed is `Active` only once the answer is back.
    pub async fn configure(
        &self,
        feed_id: FeedId,
        offer: SessionDescription,
        audio: bool,
        video: bool,
        data: bool,
    ) -> Result<SessionDescription, GatewayError> {
        let handle = self.registry.lookup(feed_id)?;
        let _guard = handle.op_lock.lock().await;
        if handle.is_closed() {
            return Err(GatewayError::HandleNotFound(feed_id));
        }
        if let Err(current) = handle.transition(NegotiationState::Configuring) {
            return Err(if current == NegotiationState::Closed {
                GatewayError::HandleNotFound(feed_id)
            } else {
                GatewayError::ConfigureFailed(format!(
                    "feed is {current}, expected published"
                ))
            });
        }

        let result = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(GatewayError::HandleNotFound(feed_id)),
            r = self.channel.request(RequestBody::Configure {
                handle: handle.handle_id,
                jsep: offer,
                audio,
                video,
                data,
            }) => r,
        };

        match result {
            Ok(reply) => {
                if handle.is_closed() {
                    // A leave/kick won while the answer was in flight.
                    return Err(GatewayError::HandleNotFound(feed_id));
                }
                // The reply's `configured` bookkeeping never leaves the
                // server; only the SDP answer goes back to the client.
                match reply.jsep {
                    Some(answer) => {
                        let _ = handle.transition(NegotiationState::Active);
                        debug!(feed_id, "feed negotiated");
                        Ok(answer)
                    }
                    None => {
                        let _ = handle.transition(NegotiationState::Published);
                        Err(GatewayError::Protocol(
                            "configure reply missing SDP answer".into(),
                        ))
                    }
                }
            }
            Err(err) => {
                if !handle.is_closed() {
                    let _ = handle.transition(NegotiationState::Published);
                }
                Err(match err {
                    GatewayError::Rejected { reason, .. } => {
                        GatewayError::ConfigureFailed(reason)
                    }
                    other => other,
                })
            }
        }
    }

    // ── Subscriber path ─────────────────────────────────────────────────

    /// Subscribe to a publisher's feed. Returns the subscriber's own feed id
    /// and the SDP offer generated by the SFU.
    pub async fn subscribe(
        &self,
        room_id: RoomId,
        target_feed: FeedId,
    ) -> Result<Subscription, GatewayError> {
        // A dangling subscription to a destroyed publisher is an error, not
        // a silent no-op.
        let publisher = self.registry.lookup(target_feed)?;
        if publisher.role != FeedRole::Publisher || publisher.room_id != room_id {
            return Err(GatewayError::HandleNotFound(target_feed));
        }

        let handle_id = self.attach().await?;

        let reply = match self
            .channel
            .request(RequestBody::JoinListener {
                handle: handle_id,
                room: room_id,
                feed: target_feed,
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                self.detach_quietly(handle_id).await;
                return Err(match err {
                    GatewayError::Rejected {
                        code: ERR_NO_SUCH_FEED,
                        ..
                    } => GatewayError::HandleNotFound(target_feed),
                    GatewayError::Rejected {
                        code: ERR_NO_SUCH_ROOM,
                        ..
                    } => GatewayError::RoomNotFound(room_id),
                    GatewayError::Rejected { reason, .. } => GatewayError::JoinFailed(reason),
                    other => other,
                });
            }
        };

        let (sub_feed, offer) = match (reply.feed, reply.jsep) {
            (Some(feed), Some(jsep)) => (feed, jsep),
            _ => {
                self.detach_quietly(handle_id).await;
                return Err(GatewayError::Protocol(
                    "listener reply missing feed id or SDP offer".into(),
                ));
            }
        };
        let display = reply
            .display
            .unwrap_or_else(|| publisher.display.clone());

        let handle =
            Handle::new_subscriber(sub_feed, handle_id, room_id, display.clone(), target_feed);
        let handle = match self.registry.allocate(handle) {
            Ok(handle) => handle,
            Err(err) => {
                self.detach_quietly(handle_id).await;
                return Err(err);
            }
        };
        let _ = handle.transition(NegotiationState::Subscribed);

        info!(room_id, subscriber_feed = sub_feed, target_feed, "listener joined");
        Ok(Subscription {
            feed_id: sub_feed,
            display,
            sdp_offer: offer,
        })
    }

    /// Forward the subscriber's SDP answer; the feed goes `Active`.
    pub async fn start(
        &self,
        feed_id: FeedId,
        answer: SessionDescription,
    ) -> Result<(), GatewayError> {
        let handle = self.registry.lookup(feed_id)?;
        let _guard = handle.op_lock.lock().await;
        if handle.is_closed() {
            return Err(GatewayError::HandleNotFound(feed_id));
        }
        let state = handle.state();
        if state != NegotiationState::Subscribed {
            return Err(GatewayError::StartFailed(format!(
                "feed is {state}, expected subscribed"
            )));
        }

        let result = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(GatewayError::HandleNotFound(feed_id)),
            r = self.channel.request(RequestBody::Start {
                handle: handle.handle_id,
                jsep: answer,
            }) => r,
        };
        result.map_err(|err| match err {
            GatewayError::Rejected { reason, .. } => GatewayError::StartFailed(reason),
            other => other,
        })?;

        if handle.transition(NegotiationState::Active).is_err() {
            return Err(GatewayError::HandleNotFound(feed_id));
        }
        debug!(feed_id, "subscriber started");
        Ok(())
    }

    // ── Shared feed operations ──────────────────────────────────────────

    /// Forward one ICE candidate, or the end-of-candidates marker when
    /// `candidate` is `None`. Legal in every state except `Closed` —
    /// trickling may race ahead of or behind the SDP exchange.
    pub async fn trickle(
        &self,
        feed_id: FeedId,
        candidate: Option<IceCandidate>,
    ) -> Result<(), GatewayError> {
        let handle = self.registry.lookup(feed_id)?;
        let _guard = handle.op_lock.lock().await;
        if handle.is_closed() {
            return Err(GatewayError::HandleNotFound(feed_id));
        }

        let result = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(GatewayError::HandleNotFound(feed_id)),
            r = self.channel.request(RequestBody::Trickle {
                handle: handle.handle_id,
                candidate,
            }) => r,
        };
        result
            .map(|_| ())
            .map_err(|err| Self::map_feed_rejection(err, feed_id))
    }

    /// Suspend media delivery without destroying the handle.
    pub async fn pause(&self, feed_id: FeedId) -> Result<(), GatewayError> {
        let handle = self.registry.lookup(feed_id)?;
        let _guard = handle.op_lock.lock().await;
        if handle.is_closed() {
            return Err(GatewayError::HandleNotFound(feed_id));
        }

        let result = tokio::select! {
            _ = handle.cancel.cancelled() => return Err(GatewayError::HandleNotFound(feed_id)),
            r = self.channel.request(RequestBody::Pause { handle: handle.handle_id }) => r,
        };
        result
            .map(|_| ())
            .map_err(|err| Self::map_feed_rejection(err, feed_id))?;
        debug!(feed_id, "feed paused");
        Ok(())
    }

    /// Re-point a subscriber handle at another live publisher without a full
    /// renegotiation teardown.
    pub async fn switch(
        &self,
        from_feed: FeedId,
        to_feed: FeedId,
        audio: bool,
        video: bool,
        data: bool,
    ) -> Result<(), GatewayError> {
        let subscriber = self.registry.lookup(from_feed)?;
        if subscriber.role != FeedRole::Subscriber {
            return Err(GatewayError::HandleNotFound(from_feed));
        }
        let target = self.registry.lookup(to_feed)?;
        if target.role != FeedRole::Publisher {
            return Err(GatewayError::HandleNotFound(to_feed));
        }

        let _guard = subscriber.op_lock.lock().await;
        if subscriber.is_closed() {
            return Err(GatewayError::HandleNotFound(from_feed));
        }

        let result = tokio::select! {
            _ = subscriber.cancel.cancelled() => return Err(GatewayError::HandleNotFound(from_feed)),
            r = self.channel.request(RequestBody::Switch {
                handle: subscriber.handle_id,
                to_feed,
                audio,
                video,
                data,
            }) => r,
        };
        result
            .map(|_| ())
            .map_err(|err| Self::map_feed_rejection(err, from_feed))?;

        *subscriber.target.write().unwrap() = Some(to_feed);
        info!(from_feed, to_feed, "subscriber switched source");
        Ok(())
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Detach the feed from the SFU and drop its registry entry.
    /// Idempotent: leaving a feed that is already gone is a no-op.
    pub async fn leave(&self, feed_id: FeedId) -> Result<(), GatewayError> {
        let Some(handle) = self.registry.get(feed_id) else {
            return Ok(());
        };

        // Interrupt any in-flight negotiation step, then wait for it to
        // release the op lock.
        handle.cancel.cancel();
        let guard = handle.op_lock.lock().await;
        let _ = handle.transition(NegotiationState::Leaving);

        if self.channel.status() == LinkStatus::Connected {
            if let Err(err) = self
                .channel
                .request(RequestBody::Leave {
                    handle: handle.handle_id,
                })
                .await
            {
                debug!(feed_id, error = %err, "best-effort leave failed");
            }
            self.detach_quietly(handle.handle_id).await;
        }
        drop(guard);

        retire_feed(&self.registry, &self.bus, feed_id, EventType::FeedClosed);
        info!(feed_id, room_id = handle.room_id, "feed left");
        Ok(())
    }

    /// Administrative removal of a feed. Requires the room secret.
    pub async fn kick(
        &self,
        room_id: RoomId,
        feed_id: FeedId,
        secret: String,
    ) -> Result<(), GatewayError> {
        self.directory.authorize(room_id, &secret)?;
        let handle = self.registry.lookup(feed_id)?;
        if handle.room_id != room_id {
            return Err(GatewayError::HandleNotFound(feed_id));
        }

        self.channel
            .request(RequestBody::Kick {
                room: room_id,
                feed: feed_id,
                secret,
            })
            .await
            .map_err(|err| match err {
                GatewayError::Rejected {
                    code: ERR_UNAUTHORIZED,
                    ..
                } => GatewayError::Unauthorized,
                other => Self::map_feed_rejection(other, feed_id),
            })?;

        // Same retirement path as leave; the cancellation inside close()
        // interrupts any negotiation step still holding the op lock.
        retire_feed(&self.registry, &self.bus, feed_id, EventType::PeerKicked);
        info!(room_id, feed_id, "feed kicked");
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    async fn attach(&self) -> Result<HandleId, GatewayError> {
        let reply = self.channel.request(RequestBody::Attach).await?;
        reply
            .handle
            .ok_or_else(|| GatewayError::Protocol("attach reply missing handle id".into()))
    }

    /// Best-effort detach during rollback; failures are logged, not surfaced.
    async fn detach_quietly(&self, handle_id: HandleId) {
        if let Err(err) = self
            .channel
            .request(RequestBody::Detach { handle: handle_id })
            .await
        {
            debug!(handle_id, error = %err, "best-effort detach failed");
        }
    }

    fn map_feed_rejection(err: GatewayError, feed_id: FeedId) -> GatewayError {
        match err {
            GatewayError::Rejected {
                code: ERR_NO_SUCH_FEED,
                ..
            } => GatewayError::HandleNotFound(feed_id),
            other => other,
        }
    }
}

// ─── Test harness ───────────────────────────────────────────────────────────


// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::{harness, StubSfu};
    use super::*;
    use std::time::Duration;

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0 client-offer")
    }

    fn answer() -> SessionDescription {
        SessionDescription::answer("v=0 client-answer")
    }

    #[tokio::test]
    async fn alice_then_bob_sees_alice() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();

        let alice = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();
        assert!(alice.publishers.is_empty());

        let bob = h.orchestrator.join_room(1001, "Bob".into()).await.unwrap();
        assert_ne!(bob.feed_id, alice.feed_id);
        assert_eq!(bob.publishers.len(), 1);
        assert_eq!(bob.publishers[0].feed_id, alice.feed_id);
        assert_eq!(bob.publishers[0].display, "Alice");
    }

    #[tokio::test]
    async fn join_unknown_room_is_room_not_found_and_leaves_no_trace() {
        let h = harness(StubSfu::new());
        let err = h
            .orchestrator
            .join_room(4242, "Alice".into())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::RoomNotFound(4242));
        assert_eq!(h.registry.len(), 0);
    }

    #[tokio::test]
    async fn rejoining_a_live_feed_is_a_conflict() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        let err = h
            .orchestrator
            .join_room(1001, "Alice".into())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::AlreadyJoined {
                room_id: 1001,
                display: "Alice".into()
            }
        );

        // A different display name is fine.
        assert!(h.orchestrator.join_room(1001, "Bob".into()).await.is_ok());
    }

    #[tokio::test]
    async fn publisher_advances_to_active_through_configure() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        let handle = h.registry.lookup(joined.feed_id).unwrap();
        assert_eq!(handle.state(), NegotiationState::Published);

        let sdp_answer = h
            .orchestrator
            .configure(joined.feed_id, offer(), true, true, false)
            .await
            .unwrap();
        assert_eq!(sdp_answer.sdp_type, "answer");
        assert_eq!(handle.state(), NegotiationState::Active);
    }

    #[tokio::test]
    async fn second_configure_observes_the_advanced_state() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();
        h.orchestrator
            .configure(joined.feed_id, offer(), true, true, false)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .configure(joined.feed_id, offer(), true, true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigureFailed(_)));
    }

    #[tokio::test]
    async fn concurrent_configures_exactly_one_wins() {
        let sfu = StubSfu::new();
        sfu.set_delay(Duration::from_millis(50));
        let h = harness(sfu);
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        let (o1, o2) = (h.orchestrator.clone(), h.orchestrator.clone());
        let feed = joined.feed_id;
        let t1 = tokio::spawn(async move { o1.configure(feed, offer(), true, true, false).await });
        let t2 = tokio::spawn(async move { o2.configure(feed, offer(), true, true, false).await });
        let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());

        assert!(r1.is_ok() != r2.is_ok(), "exactly one configure must win");
        let loser = if r1.is_ok() { r2 } else { r1 };
        assert!(matches!(loser.unwrap_err(), GatewayError::ConfigureFailed(_)));
        assert_eq!(
            h.registry.lookup(feed).unwrap().state(),
            NegotiationState::Active
        );
    }

    #[tokio::test]
    async fn subscribe_start_and_switch() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let alice = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();
        let bob = h.orchestrator.join_room(1001, "Bob".into()).await.unwrap();

        let sub = h
            .orchestrator
            .subscribe(1001, alice.feed_id)
            .await
            .unwrap();
        assert_eq!(sub.display, "Alice");
        assert_eq!(sub.sdp_offer.sdp_type, "offer");
        let handle = h.registry.lookup(sub.feed_id).unwrap();
        assert_eq!(handle.state(), NegotiationState::Subscribed);

        h.orchestrator.start(sub.feed_id, answer()).await.unwrap();
        assert_eq!(handle.state(), NegotiationState::Active);

        h.orchestrator
            .switch(sub.feed_id, bob.feed_id, true, true, false)
            .await
            .unwrap();
        assert_eq!(*handle.target.read().unwrap(), Some(bob.feed_id));

        let err = h
            .orchestrator
            .switch(sub.feed_id, 9999, true, true, false)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::HandleNotFound(9999));
    }

    #[tokio::test]
    async fn subscribe_to_missing_feed_fails() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let err = h.orchestrator.subscribe(1001, 777).await.unwrap_err();
        assert_eq!(err, GatewayError::HandleNotFound(777));
        assert_eq!(h.registry.len(), 0);
    }

    #[tokio::test]
    async fn start_without_subscribe_fails() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        // Unknown feed: never subscribed.
        let err = h.orchestrator.start(777, answer()).await.unwrap_err();
        assert_eq!(err, GatewayError::HandleNotFound(777));

        // Known feed, wrong role/state.
        let err = h
            .orchestrator
            .start(joined.feed_id, answer())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::StartFailed(_)));
    }

    #[tokio::test]
    async fn trickle_tolerates_every_live_state_but_not_closed() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };

        // Before configure (Published): allowed.
        h.orchestrator
            .trickle(joined.feed_id, Some(candidate.clone()))
            .await
            .unwrap();
        // End-of-candidates marker: allowed.
        h.orchestrator.trickle(joined.feed_id, None).await.unwrap();

        h.orchestrator.leave(joined.feed_id).await.unwrap();

        // Closed means gone, for any payload.
        assert_eq!(
            h.orchestrator
                .trickle(joined.feed_id, Some(candidate))
                .await
                .unwrap_err(),
            GatewayError::HandleNotFound(joined.feed_id)
        );
        assert_eq!(
            h.orchestrator.trickle(joined.feed_id, None).await.unwrap_err(),
            GatewayError::HandleNotFound(joined.feed_id)
        );
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_total() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        h.orchestrator.leave(joined.feed_id).await.unwrap();

        // Gone from the registry and the participant listing.
        assert!(h.registry.get(joined.feed_id).is_none());
        assert!(h
            .orchestrator
            .list_participants(1001)
            .unwrap()
            .is_empty());

        // Every subsequent operation fails with HandleNotFound.
        assert_eq!(
            h.orchestrator
                .configure(joined.feed_id, offer(), true, true, false)
                .await
                .unwrap_err(),
            GatewayError::HandleNotFound(joined.feed_id)
        );
        assert_eq!(
            h.orchestrator.pause(joined.feed_id).await.unwrap_err(),
            GatewayError::HandleNotFound(joined.feed_id)
        );

        // Leaving again is a no-op.
        h.orchestrator.leave(joined.feed_id).await.unwrap();
    }

    #[tokio::test]
    async fn leave_interrupts_an_inflight_configure() {
        let sfu = StubSfu::new();
        sfu.set_delay(Duration::from_millis(300));
        let h = harness(sfu);
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        let orch = h.orchestrator.clone();
        let feed = joined.feed_id;
        let configure = tokio::spawn(async move {
            orch.configure(feed, offer(), true, true, false).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.orchestrator.leave(feed).await.unwrap();

        let result = configure.await.unwrap();
        assert_eq!(result.unwrap_err(), GatewayError::HandleNotFound(feed));
        assert!(h.registry.get(feed).is_none());
    }

    #[tokio::test]
    async fn pause_suspends_without_destroying() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();
        h.orchestrator
            .configure(joined.feed_id, offer(), true, true, false)
            .await
            .unwrap();

        h.orchestrator.pause(joined.feed_id).await.unwrap();
        assert!(h.registry.lookup(joined.feed_id).is_ok());
        assert_eq!(h.orchestrator.list_participants(1001).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kick_requires_the_room_secret() {
        let h = harness(StubSfu::new());
        let secret = h
            .orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        assert_eq!(
            h.orchestrator
                .kick(1001, joined.feed_id, "wrong".into())
                .await
                .unwrap_err(),
            GatewayError::Unauthorized
        );
        assert!(h.registry.lookup(joined.feed_id).is_ok());

        assert_eq!(
            h.orchestrator
                .kick(1001, 777, secret.clone())
                .await
                .unwrap_err(),
            GatewayError::HandleNotFound(777)
        );

        h.orchestrator
            .kick(1001, joined.feed_id, secret)
            .await
            .unwrap();
        assert!(h.registry.get(joined.feed_id).is_none());
        assert_eq!(
            h.orchestrator.pause(joined.feed_id).await.unwrap_err(),
            GatewayError::HandleNotFound(joined.feed_id)
        );
    }

    #[tokio::test]
    async fn destroy_with_wrong_secret_keeps_the_room_listable() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .destroy_room(1001, true, "wrong".into())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Unauthorized);
        assert_eq!(h.orchestrator.list_rooms().len(), 1);
    }

    #[tokio::test]
    async fn destroy_tears_down_every_feed_in_the_room() {
        let h = harness(StubSfu::new());
        let secret = h
            .orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let alice = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();
        h.orchestrator.subscribe(1001, alice.feed_id).await.unwrap();

        h.orchestrator
            .destroy_room(1001, true, secret)
            .await
            .unwrap();

        assert!(h.orchestrator.list_rooms().is_empty());
        assert_eq!(h.registry.len(), 0);
        assert_eq!(
            h.orchestrator.list_participants(1001).unwrap_err(),
            GatewayError::RoomNotFound(1001)
        );
    }

    #[tokio::test]
    async fn duplicate_room_is_rejected() {
        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let err = h
            .orchestrator
            .create_room(1001, "Again".into(), true, false)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::DuplicateRoom(1001));
    }

    #[tokio::test]
    async fn operations_fail_fast_while_the_link_is_down() {
        let sfu = StubSfu::new();
        let h = harness(sfu.clone());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();

        sfu.set_connected(false);

        assert_eq!(
            h.orchestrator
                .join_room(1001, "Alice".into())
                .await
                .unwrap_err(),
            GatewayError::LinkUnavailable
        );
        // A create that fails SFU-side leaves no directory record behind.
        assert_eq!(
            h.orchestrator
                .create_room(2002, "Other".into(), false, false)
                .await
                .unwrap_err(),
            GatewayError::LinkUnavailable
        );
        assert!(!h.directory.exists(2002));
    }

    #[tokio::test]
    async fn link_recovery_invalidates_old_feeds() {
        use crate::events::spawn_event_fanout;
        use crate::link::LinkEvent;

        let h = harness(StubSfu::new());
        h.orchestrator
            .create_room(1001, "Test".into(), false, false)
            .await
            .unwrap();
        let joined = h.orchestrator.join_room(1001, "Alice".into()).await.unwrap();

        let (link_tx, link_rx) = tokio::sync::mpsc::unbounded_channel();
        let fanout = spawn_event_fanout(link_rx, h.registry.clone(), h.bus.clone());
        let mut events = h.bus.subscribe();

        link_tx.send(LinkEvent::Lost).unwrap();
        link_tx.send(LinkEvent::Recovered).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, crate::events::EventType::FeedRenegotiate);

        assert_eq!(h.registry.len(), 0);
        assert_eq!(
            h.orchestrator
                .trickle(joined.feed_id, None)
                .await
                .unwrap_err(),
            GatewayError::HandleNotFound(joined.feed_id)
        );
        assert!(h
            .orchestrator
            .list_participants(1001)
            .unwrap()
            .is_empty());

        drop(link_tx);
        fanout.await.unwrap();
    }
}
