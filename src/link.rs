// src/link.rs
//
// The control-plane link to the SFU.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   callers ──request()──> pending map ──mpsc──> link task ──ws──> SFU
//                              ▲                     │
//                              └──── replies ────────┤
//                                                    └─ events ──> fanout
//
//   One background task owns the WebSocket. Each request gets its own
//   transaction id and oneshot completion; replies are correlated through
//   the pending map. Unsolicited frames are forwarded to the event fanout.
//
// ─ Reconnect policy ─────────────────────────────────────────────────────────
//
//   Attempt 1: immediate
//   Attempt 2: 1 s   (base_delay * 2^0)
//   Attempt 3: 2 s   (base_delay * 2^1)
//   Attempt 4: 4 s   (base_delay * 2^2)
//   ... capped at max_delay, retrying until shutdown is signalled.
//
//   While the link is down every request fails fast with `LinkUnavailable`;
//   nothing queues. A successful reconnect recreates the control session,
//   which invalidates all previously issued SFU handles — the fanout purges
//   the registry when it sees `LinkEvent::Recovered`.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::wire::{
    new_transaction, Incoming, ReplyData, RequestBody, SessionId, SfuEvent, WireRequest,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type Waiter = oneshot::Sender<Result<ReplyData, GatewayError>>;

// ─── Status & lifecycle events ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Everything the link forwards to the event fanout: SFU traffic plus its
/// own lifecycle transitions.
#[derive(Debug)]
pub enum LinkEvent {
    Sfu(SfuEvent),
    Lost,
    Recovered,
}

// ─── SfuChannel seam ────────────────────────────────────────────────────────

/// Request/response access to the SFU. The orchestrator only sees this
/// trait, so tests drive it against a scripted stub instead of a socket.
#[async_trait]
pub trait SfuChannel: Send + Sync {
    async fn request(&self, body: RequestBody) -> Result<ReplyData, GatewayError>;

    fn status(&self) -> LinkStatus;
}

// ─── Reconnect policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Compute the delay for attempt `n` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt);
        delay.min(self.max_delay)
    }
}

// ─── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub url: String,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl LinkOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            url: cfg.sfu_url.clone(),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            keepalive_interval: Duration::from_secs(cfg.keepalive_interval_secs),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(cfg.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(cfg.reconnect_max_delay_ms),
            },
        }
    }
}

// ─── SfuLink ────────────────────────────────────────────────────────────────

struct LinkShared {
    pending: Mutex<HashMap<String, Waiter>>,
    session: Mutex<Option<SessionId>>,
    timeout: Duration,
}

/// Handle to the link task. Cheap to clone.
#[derive(Clone)]
pub struct SfuLink {
    shared: Arc<LinkShared>,
    cmd_tx: mpsc::UnboundedSender<WireRequest>,
    status_rx: watch::Receiver<LinkStatus>,
}

impl SfuLink {
    /// Spawn the link task. It connects, creates the control session, and
    /// keeps reconnecting with backoff until `shutdown` is cancelled.
    pub fn spawn(
        opts: LinkOptions,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LinkShared {
            pending: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            timeout: opts.request_timeout,
        });

        tokio::spawn(run_link(
            opts,
            shared.clone(),
            cmd_rx,
            status_tx,
            events_tx,
            shutdown,
        ));

        Self {
            shared,
            cmd_tx,
            status_rx,
        }
    }

    /// Block until the link reports `Connected` (or the task is gone).
    pub async fn wait_connected(&self) {
        let mut rx = self.status_rx.clone();
        while *rx.borrow() != LinkStatus::Connected {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl SfuChannel for SfuLink {
    async fn request(&self, body: RequestBody) -> Result<ReplyData, GatewayError> {
        if *self.status_rx.borrow() != LinkStatus::Connected {
            return Err(GatewayError::LinkUnavailable);
        }

        let transaction = new_transaction();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(transaction.clone(), tx);

        let request = WireRequest {
            transaction: transaction.clone(),
            session: *self.shared.session.lock().unwrap(),
            body,
        };

        if self.cmd_tx.send(request).is_err() {
            self.shared.pending.lock().unwrap().remove(&transaction);
            return Err(GatewayError::LinkUnavailable);
        }

        match tokio::time::timeout(self.shared.timeout, rx).await {
            Ok(Ok(result)) => result,
            // Waiter dropped: the link drained pending state on disconnect.
            Ok(Err(_)) => Err(GatewayError::LinkUnavailable),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&transaction);
                Err(GatewayError::Timeout)
            }
        }
    }

    fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }
}

// ─── Link task ──────────────────────────────────────────────────────────────

async fn run_link(
    opts: LinkOptions,
    shared: Arc<LinkShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<WireRequest>,
    status_tx: watch::Sender<LinkStatus>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut was_connected = false;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let established = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = establish(&opts, &events_tx) => r,
        };

        let (mut sink, mut source, session) = match established {
            Ok(parts) => parts,
            Err(e) => {
                let delay = opts.reconnect.delay_for(attempt);
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "SFU connection failed, retrying"
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        attempt = 0;
        *shared.session.lock().unwrap() = Some(session);
        let _ = status_tx.send(LinkStatus::Connected);
        info!(session, url = %opts.url, "control session with the SFU established");
        if was_connected {
            // Every handle issued on the previous session is now invalid.
            let _ = events_tx.send(LinkEvent::Recovered);
        }
        was_connected = true;

        let mut keepalive = tokio::time::interval(opts.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break "shutdown";
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(request) => match serde_json::to_string(&request) {
                        Ok(payload) => {
                            if let Err(e) = sink.send(Message::Text(payload)).await {
                                warn!(error = %e, "write to the SFU failed");
                                fail_request(&shared, &request.transaction);
                                break "write error";
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "could not serialize control request");
                            fail_request(&shared, &request.transaction);
                        }
                    },
                    None => break "command channel closed",
                },
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break "keepalive failed";
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => dispatch_frame(&text, &shared, &events_tx),
                    Some(Ok(Message::Close(_))) => break "closed by the SFU",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "control channel read error");
                        break "read error";
                    }
                    None => break "stream ended",
                },
            }
        };

        let _ = status_tx.send(LinkStatus::Disconnected);
        *shared.session.lock().unwrap() = None;
        drain_pending(&shared);

        if shutdown.is_cancelled() || reason == "shutdown" {
            break;
        }
        warn!(reason, "control link lost, scheduling reconnect");
        let _ = events_tx.send(LinkEvent::Lost);
    }

    drain_pending(&shared);
    info!("control link task stopped");
}

/// Dial the SFU and create the control session on the fresh socket.
async fn establish(
    opts: &LinkOptions,
    events_tx: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<(WsSink, WsSource, SessionId), GatewayError> {
    let (ws, _) = connect_async(opts.url.as_str())
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))?;
    let (mut sink, mut source) = ws.split();

    let transaction = new_transaction();
    let request = WireRequest {
        transaction: transaction.clone(),
        session: None,
        body: RequestBody::CreateSession,
    };
    let payload =
        serde_json::to_string(&request).map_err(|e| GatewayError::Protocol(e.to_string()))?;
    sink.send(Message::Text(payload))
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))?;

    let session = tokio::time::timeout(opts.request_timeout, async {
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Incoming>(&text) {
                    Ok(Incoming::Reply(reply)) if reply.transaction == transaction => {
                        if let Some(err) = reply.error {
                            return Err(GatewayError::Rejected {
                                code: err.code,
                                reason: err.reason,
                            });
                        }
                        return reply
                            .data
                            .and_then(|d| d.session)
                            .ok_or_else(|| {
                                GatewayError::Protocol("session reply missing id".into())
                            });
                    }
                    Ok(Incoming::Reply(reply)) => {
                        debug!(transaction = %reply.transaction, "unexpected reply during session setup");
                    }
                    Ok(Incoming::Event(event)) => {
                        let _ = events_tx.send(LinkEvent::Sfu(event));
                    }
                    Err(e) => warn!(error = %e, "unparseable frame during session setup"),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(GatewayError::Connection(e.to_string())),
                None => {
                    return Err(GatewayError::Connection(
                        "control channel closed during session setup".into(),
                    ))
                }
            }
        }
    })
    .await
    .map_err(|_| GatewayError::Timeout)??;

    Ok((sink, source, session))
}

/// Route one incoming text frame: reply → pending waiter, event → fanout.
fn dispatch_frame(
    text: &str,
    shared: &LinkShared,
    events_tx: &mpsc::UnboundedSender<LinkEvent>,
) {
    match serde_json::from_str::<Incoming>(text) {
        Ok(Incoming::Reply(reply)) => {
            let waiter = shared.pending.lock().unwrap().remove(&reply.transaction);
            match waiter {
                Some(tx) => {
                    let result = match reply.error {
                        Some(err) => Err(GatewayError::Rejected {
                            code: err.code,
                            reason: err.reason,
                        }),
                        None => Ok(reply.data.unwrap_or_default()),
                    };
                    let _ = tx.send(result);
                }
                // A reply can land after its caller timed out; nothing to do.
                None => debug!(transaction = %reply.transaction, "reply for unknown transaction"),
            }
        }
        Ok(Incoming::Event(event)) => {
            let _ = events_tx.send(LinkEvent::Sfu(event));
        }
        Err(e) => warn!(error = %e, "unparseable frame from the SFU"),
    }
}

fn fail_request(shared: &LinkShared, transaction: &str) {
    if let Some(tx) = shared.pending.lock().unwrap().remove(transaction) {
        let _ = tx.send(Err(GatewayError::LinkUnavailable));
    }
}

/// Fail every in-flight request. Called the moment the link goes down so
/// callers fail fast instead of waiting out their timeout.
fn drain_pending(shared: &LinkShared) {
    let mut pending = shared.pending.lock().unwrap();
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(GatewayError::LinkUnavailable));
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
