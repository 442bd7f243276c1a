mod api;
mod config;
mod directory;
mod error;
mod events;
mod link;
mod orchestrator;
mod registry;
mod sse;
mod wire;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, Method},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::link::{LinkStatus, SfuChannel};

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<registry::HandleRegistry>,
    pub directory: Arc<directory::RoomDirectory>,
    pub orchestrator: orchestrator::Orchestrator,
    pub event_bus: events::EventBus,
    pub link: link::SfuLink,
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let link = match state.link.status() {
        LinkStatus::Connected => "connected",
        LinkStatus::Disconnected => "disconnected",
    };

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sfu_link": link,
        "rooms_active": state.directory.len(),
        "feeds_active": state.registry.len(),
    }))
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([HeaderName::from_static("content-type")])
    }
}

// ─── TLS configuration ─────────────────────────────────────────────────────

/// Load TLS certificate and key from PEM files and build an
/// `axum_server::tls_rustls::RustlsConfig`.
async fn load_tls_config(
    cert_path: &str,
    key_path: &str,
) -> Result<axum_server::tls_rustls::RustlsConfig, Box<dyn std::error::Error>> {
    info!("Loading TLS certificate from: {}", cert_path);
    info!("Loading TLS private key from:  {}", key_path);

    let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;

    info!("TLS configuration loaded successfully");
    Ok(config)
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // ── Install rustls CryptoProvider (required by rustls 0.23+) ────────
    // Must happen before any TLS operation (HTTPS listener or wss:// SFU).
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // ── Load configuration ──────────────────────────────────────────────
    // Load .env before anything else so ROOMGATE_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level = std::env::var("ROOMGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = config::Config::from_env();
    let bind_addr = cfg.bind_addr.clone();
    let tls_enabled = cfg.tls_enabled;
    let tls_cert_path = cfg.tls_cert_path.clone();
    let tls_key_path = cfg.tls_key_path.clone();
    let allowed_origins = cfg.allowed_origins.clone();

    // ── Core state ──────────────────────────────────────────────────────

    let shutdown = CancellationToken::new();
    let registry = Arc::new(registry::HandleRegistry::new());
    let room_directory = Arc::new(directory::RoomDirectory::new());
    let event_bus = events::EventBus::new();

    // ── SFU control link + event fanout ─────────────────────────────────

    let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
    let sfu_link = link::SfuLink::spawn(
        link::LinkOptions::from_config(&cfg),
        link_events_tx,
        shutdown.clone(),
    );

    let _fanout_handle =
        events::spawn_event_fanout(link_events_rx, registry.clone(), event_bus.clone());

    let orchestrator = orchestrator::Orchestrator::new(
        Arc::new(sfu_link.clone()),
        registry.clone(),
        room_directory.clone(),
        event_bus.clone(),
    );

    let state = Arc::new(AppState {
        registry,
        directory: room_directory,
        orchestrator,
        event_bus,
        link: sfu_link,
    });

    // Don't gate startup on the SFU — the gateway serves /health (and fails
    // per-feed operations fast) while the link keeps retrying.
    if tokio::time::timeout(std::time::Duration::from_secs(3), state.link.wait_connected())
        .await
        .is_err()
    {
        warn!("SFU not reachable yet, continuing while the link retries");
    }

    // ── Build CORS layer ────────────────────────────────────────────────

    let cors = build_cors_layer(&allowed_origins);

    // ── Build router ────────────────────────────────────────────────────

    let app = Router::new()
        // Health (no auth required)
        .route("/health", get(health_handler))
        // Room administration
        .route("/v1/rooms", post(api::create_room))
        .route("/v1/rooms", get(api::list_rooms))
        .route("/v1/rooms/:room_id/destroy", post(api::destroy_room))
        // Room membership
        .route("/v1/rooms/:room_id/join", post(api::join_room))
        .route("/v1/rooms/:room_id/subscribe", post(api::subscribe))
        .route("/v1/rooms/:room_id/participants", get(api::list_participants))
        .route("/v1/rooms/:room_id/kick", post(api::kick))
        // Per-feed negotiation
        .route("/v1/feeds/:feed_id/configure", post(api::configure))
        .route("/v1/feeds/:feed_id/start", post(api::start))
        .route("/v1/feeds/:feed_id/trickle", post(api::trickle))
        .route("/v1/feeds/:feed_id/pause", post(api::pause))
        .route("/v1/feeds/:feed_id/switch", post(api::switch_feed))
        .route("/v1/feeds/:feed_id/leave", post(api::leave))
        // Server-Sent Events (real-time push channel)
        .route("/v1/events", get(sse::sse_events))
        // Middleware
        .layer(cors)
        .with_state(state);

    // ── Start server (plain HTTP or HTTPS) ──────────────────────────────

    if tls_enabled {
        let cert_path = tls_cert_path
            .as_deref()
            .expect("ROOMGATE_TLS_CERT_PATH must be set when TLS is enabled");
        let key_path = tls_key_path
            .as_deref()
            .expect("ROOMGATE_TLS_KEY_PATH must be set when TLS is enabled");

        let tls_config = load_tls_config(cert_path, key_path)
            .await
            .expect("Failed to load TLS configuration");

        info!("RoomGate listening on https://{bind_addr}");
        let addr: std::net::SocketAddr = bind_addr.parse().expect("invalid bind address");

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .unwrap();
    } else {
        info!("RoomGate listening on http://{bind_addr}");

        let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
                shutdown.cancel();
            })
            .await
            .unwrap();
    }
}
