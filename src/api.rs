use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::directory::RoomListing;
use crate::error::ApiError;
use crate::orchestrator::{JoinedRoom, ParticipantView, Subscription};
use crate::wire::{FeedId, IceCandidate, RoomId, SessionDescription};

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub permanent: bool,
}

/// The admin `secret` is shown once -- the caller must store it to destroy
/// the room or kick participants later.
#[derive(Serialize)]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
    pub secret: String,
}

#[derive(Deserialize)]
pub struct JoinRoomRequest {
    pub display: String,
}

#[derive(Deserialize)]
pub struct ConfigureRequest {
    pub sdp_offer: SessionDescription,
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default)]
    pub data: bool,
}

#[derive(Serialize)]
pub struct ConfigureResponse {
    pub sdp_answer: SessionDescription,
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    /// The publisher feed to receive.
    pub feed_id: FeedId,
}

#[derive(Deserialize)]
pub struct StartRequest {
    pub sdp_answer: SessionDescription,
}

#[derive(Serialize)]
pub struct StartResponse {
    pub ok: bool,
}

/// Absent candidate = end-of-candidates marker.
#[derive(Deserialize)]
pub struct TrickleRequest {
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

#[derive(Deserialize)]
pub struct SwitchRequest {
    pub to_feed: FeedId,
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default)]
    pub data: bool,
}

#[derive(Deserialize)]
pub struct KickRequest {
    pub feed_id: FeedId,
    pub secret: String,
}

#[derive(Deserialize)]
pub struct DestroyRoomRequest {
    #[serde(default)]
    pub permanent: bool,
    pub secret: String,
}

#[derive(Serialize)]
pub struct ParticipantsResponse {
    pub room_id: RoomId,
    pub participants: Vec<ParticipantView>,
}

// ---------------------------------------------------------------------------
// POST /v1/rooms — create a room
// ---------------------------------------------------------------------------

pub async fn create_room(
    State(state): State<Arc<crate::AppState>>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), ApiError> {
    let secret = state
        .orchestrator
        .create_room(body.room_id, body.description, body.is_private, body.permanent)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            room_id: body.room_id,
            secret,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET /v1/rooms — list all rooms
// ---------------------------------------------------------------------------

pub async fn list_rooms(
    State(state): State<Arc<crate::AppState>>,
) -> Json<Vec<RoomListing>> {
    Json(state.orchestrator.list_rooms())
}

// ---------------------------------------------------------------------------
// POST /v1/rooms/:room_id/destroy — destroy a room
// ---------------------------------------------------------------------------

pub async fn destroy_room(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<RoomId>,
    Json(body): Json<DestroyRoomRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .destroy_room(room_id, body.permanent, body.secret)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /v1/rooms/:room_id/join — join as publisher
// ---------------------------------------------------------------------------

pub async fn join_room(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<RoomId>,
    Json(body): Json<JoinRoomRequest>,
) -> Result<Json<JoinedRoom>, ApiError> {
    if body.display.trim().is_empty() {
        return Err(ApiError::bad_request("display name must not be empty"));
    }

    let joined = state.orchestrator.join_room(room_id, body.display).await?;
    info!(room_id, feed_id = joined.feed_id, "join accepted");
    Ok(Json(joined))
}

// ---------------------------------------------------------------------------
// POST /v1/rooms/:room_id/subscribe — join as listener
// ---------------------------------------------------------------------------

pub async fn subscribe(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<RoomId>,
    Json(body): Json<SubscribeRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let subscription = state.orchestrator.subscribe(room_id, body.feed_id).await?;
    Ok(Json(subscription))
}

// ---------------------------------------------------------------------------
// GET /v1/rooms/:room_id/participants — publisher snapshot
// ---------------------------------------------------------------------------

pub async fn list_participants(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<ParticipantsResponse>, ApiError> {
    let participants = state.orchestrator.list_participants(room_id)?;
    Ok(Json(ParticipantsResponse {
        room_id,
        participants,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/rooms/:room_id/kick — administratively remove a feed
// ---------------------------------------------------------------------------

pub async fn kick(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<RoomId>,
    Json(body): Json<KickRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .kick(room_id, body.feed_id, body.secret)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /v1/feeds/:feed_id/configure — publisher offer/answer
// ---------------------------------------------------------------------------

pub async fn configure(
    State(state): State<Arc<crate::AppState>>,
    Path(feed_id): Path<FeedId>,
    Json(body): Json<ConfigureRequest>,
) -> Result<Json<ConfigureResponse>, ApiError> {
    let sdp_answer = state
        .orchestrator
        .configure(feed_id, body.sdp_offer, body.audio, body.video, body.data)
        .await?;
    Ok(Json(ConfigureResponse { sdp_answer }))
}

// ---------------------------------------------------------------------------
// POST /v1/feeds/:feed_id/start — subscriber answer
// ---------------------------------------------------------------------------

pub async fn start(
    State(state): State<Arc<crate::AppState>>,
    Path(feed_id): Path<FeedId>,
    Json(body): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    state.orchestrator.start(feed_id, body.sdp_answer).await?;
    Ok(Json(StartResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// POST /v1/feeds/:feed_id/trickle — ICE candidate relay
// ---------------------------------------------------------------------------

pub async fn trickle(
    State(state): State<Arc<crate::AppState>>,
    Path(feed_id): Path<FeedId>,
    Json(body): Json<TrickleRequest>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.trickle(feed_id, body.candidate).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /v1/feeds/:feed_id/pause — suspend media
// ---------------------------------------------------------------------------

pub async fn pause(
    State(state): State<Arc<crate::AppState>>,
    Path(feed_id): Path<FeedId>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.pause(feed_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /v1/feeds/:feed_id/switch — re-point a subscriber
// ---------------------------------------------------------------------------

pub async fn switch_feed(
    State(state): State<Arc<crate::AppState>>,
    Path(feed_id): Path<FeedId>,
    Json(body): Json<SwitchRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .switch(feed_id, body.to_feed, body.audio, body.video, body.data)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// POST /v1/feeds/:feed_id/leave — detach a feed (idempotent)
// ---------------------------------------------------------------------------

pub async fn leave(
    State(state): State<Arc<crate::AppState>>,
    Path(feed_id): Path<FeedId>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.leave(feed_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
