//! Subscriber signaler: terminates viewer connections over WebSocket.
//!
//! One HTTP endpoint upgrades to a socket carrying JSON envelopes. A single
//! connection may run several `video-offer` negotiations distinguished by
//! the envelope `id`; responses and trickled candidates are serialized
//! through a per-connection write task so frames never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::engine::{PeerEngine, SIGNALING_TIMEOUT};
use crate::session::{SessionKey, SessionRegistry};
use crate::signal::{
    Envelope, ErrorCode, IceCandidate, Meta, OutEnvelope, TrackSource, VideoDescription,
    EVENT_ERROR, EVENT_ICE_CANDIDATE, EVENT_VIDEO_ANSWER, EVENT_VIDEO_OFFER,
};
use crate::config::WebRtcConfig;

/// Candidates arrive at least twice per peer (initial and trickle).
const CANDIDATE_QUEUE_CAPACITY: usize = 2;
/// Per-connection outbound envelope buffer.
const OUTBOUND_CAPACITY: usize = 32;

/// Viewer-side signaler. One instance serves every connection.
pub struct Subscriber {
    engine: Arc<PeerEngine>,
    registry: Arc<SessionRegistry>,
    config: WebRtcConfig,
    cancel: CancellationToken,
    started_at: Instant,
}

impl Subscriber {
    pub fn new(
        engine: Arc<PeerEngine>,
        registry: Arc<SessionRegistry>,
        config: WebRtcConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            registry,
            config,
            cancel,
            started_at: Instant::now(),
        })
    }

    /// Build the HTTP router: signaling endpoint, status endpoint and,
    /// when enabled, the static debug front-end at `/`.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new()
            .route("/v1/broadcast/signal", get(signal_upgrade))
            .route("/api/status", get(api_status))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(self));
        if self.config.enable_frontend {
            info!(dir = %self.config.frontend_dir.display(), "serving debug front-end");
            router = router.fallback_service(ServeDir::new(&self.config.frontend_dir));
        }
        router
    }

    /// Serve on an already-bound listener until cancellation. Binding is
    /// the caller's job so a dead port is a startup failure, not a
    /// background one.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("subscriber signaler listening on http://{addr}");
        }

        let cancel = self.cancel.clone();
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("subscriber server error")?;
        Ok(())
    }

    /// Handle one viewer connection until the socket closes, a read fails,
    /// or the process shuts down. Never mutates the registry.
    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        debug!("viewer connected");
        let (ws_tx, mut ws_rx) = socket.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_loop(ws_tx, out_rx));

        let cancel = self.cancel.child_token();
        let mut conn = Connection {
            subscriber: Arc::clone(&self),
            out_tx,
            queues: HashMap::new(),
            cancel: cancel.clone(),
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = conn
                        .out_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
                frame = ws_rx.next() => match frame {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "could not read message");
                        conn.reply_error(String::new(), None, ErrorCode::ReadMessage).await;
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if conn.dispatch(&text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = conn.out_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        // Tears down every fan-out peer and candidate queue owned by this
        // connection; the registry is untouched.
        cancel.cancel();
        conn.queues.clear();
        drop(conn);
        if timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("write path did not drain in time");
        }
        debug!("viewer disconnected");
    }
}

async fn signal_upgrade(
    ws: WebSocketUpgrade,
    State(subscriber): State<Arc<Subscriber>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| subscriber.handle_socket(socket))
}

async fn api_status(State(subscriber): State<Arc<Subscriber>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "sessions": subscriber.registry.len().await,
        "uptime_secs": subscriber.started_at.elapsed().as_secs(),
    }))
}

/// Forward outbound frames in order; a close frame or send failure ends
/// the task.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_tx.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

/// Pending remote candidates for one track source on one connection. The
/// receiver half moves into the fan-out peer that consumes the queue.
struct CandidateQueue {
    tx: mpsc::Sender<String>,
    rx: Option<mpsc::Receiver<String>>,
}

impl CandidateQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(CANDIDATE_QUEUE_CAPACITY);
        Self { tx, rx: Some(rx) }
    }

    /// Take the receiver for a new fan-out peer. If an earlier peer on
    /// this connection already consumed it, start a fresh queue so the new
    /// peer gets subsequent candidates.
    fn take_receiver(&mut self) -> mpsc::Receiver<String> {
        match self.rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel(CANDIDATE_QUEUE_CAPACITY);
                self.tx = tx;
                rx
            }
        }
    }
}

/// Per-connection state: the serialized write path and candidate queues.
struct Connection {
    subscriber: Arc<Subscriber>,
    out_tx: mpsc::Sender<Message>,
    queues: HashMap<TrackSource, CandidateQueue>,
    cancel: CancellationToken,
}

impl Connection {
    /// Handle one inbound frame. `Err` means the connection is beyond
    /// saving and the caller must tear it down; event-level failures are
    /// answered with an `error` envelope and keep the connection open.
    async fn dispatch(&mut self, raw: &str) -> Result<()> {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "could not read message");
                self.reply_error(String::new(), None, ErrorCode::ReadMessage).await;
                bail!("unreadable frame");
            }
        };

        match envelope.event.as_str() {
            EVENT_VIDEO_OFFER => self.on_video_offer(envelope).await,
            EVENT_ICE_CANDIDATE => self.on_ice_candidate(envelope).await,
            other => {
                warn!(event = %other, "unknown event");
                Ok(())
            }
        }
    }

    async fn on_video_offer(&mut self, envelope: Envelope) -> Result<()> {
        let event_id = envelope.id;
        let offer: VideoDescription = match serde_json::from_value(envelope.data) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "could not unmarshal JSON data");
                self.reply_error(event_id, None, ErrorCode::UnmarshalJson).await;
                return Ok(());
            }
        };
        let Some((meta, source)) = validate_meta(offer.meta) else {
            warn!(event_id = %event_id, "incorrect metadata");
            self.reply_error(event_id, None, ErrorCode::IncorrectMetadata).await;
            return Ok(());
        };
        debug!(
            event_id = %event_id,
            id = %meta.id,
            track_source = %source,
            "received offer from subscriber"
        );

        let key = SessionKey::new(meta.id.clone(), source);
        let Some(track) = self.subscriber.registry.get(&key).await else {
            warn!(id = %meta.id, track_source = %source, "no session for requested metadata");
            self.reply_error(event_id, Some(meta), ErrorCode::MetadataNotMatched).await;
            return Ok(());
        };

        let sdp: RTCSessionDescription = match serde_json::from_str(&offer.sdp) {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "could not unmarshal sdp");
                self.reply_error(event_id, Some(meta), ErrorCode::UnmarshalJson).await;
                return Ok(());
            }
        };

        let queue_rx = self
            .queues
            .entry(source)
            .or_insert_with(CandidateQueue::new)
            .take_receiver();

        // Locally gathered candidates stream back to this viewer with the
        // meta it supplied.
        let (cand_tx, mut cand_rx) = mpsc::channel::<RTCIceCandidateInit>(8);
        let forward_out = self.out_tx.clone();
        let forward_meta = meta.clone();
        let forward_id = event_id.clone();
        tokio::spawn(async move {
            while let Some(init) = cand_rx.recv().await {
                let candidate = match serde_json::to_string(&init) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!(error = %e, "could not marshal candidate");
                        continue;
                    }
                };
                let frame = encode_envelope(
                    EVENT_ICE_CANDIDATE,
                    forward_id.clone(),
                    IceCandidate {
                        meta: Some(forward_meta.clone()),
                        candidate,
                    },
                );
                let Some(frame) = frame else { continue };
                if forward_out.send(frame).await.is_err() {
                    break;
                }
            }
        });

        match self
            .subscriber
            .engine
            .bind_subscriber(sdp, track, cand_tx, queue_rx, self.cancel.child_token())
            .await
        {
            Ok((answer, _handle)) => {
                let answer = match serde_json::to_string(&answer) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(event_id = %event_id, error = %e, "could not marshal answer");
                        self.reply_error(event_id, Some(meta), ErrorCode::UnmarshalJson).await;
                        return Ok(());
                    }
                };
                debug!(event_id = %event_id, id = %meta.id, "created fan-out peer");
                self.send_envelope(
                    EVENT_VIDEO_ANSWER,
                    event_id,
                    VideoDescription {
                        meta: Some(meta),
                        sdp: answer,
                    },
                )
                .await
            }
            Err(e) => {
                warn!(event_id = %event_id, id = %meta.id, error = %e, "failed to create subscriber");
                self.reply_error(event_id, Some(meta), e.code()).await;
                Ok(())
            }
        }
    }

    async fn on_ice_candidate(&mut self, envelope: Envelope) -> Result<()> {
        let event_id = envelope.id;
        let message: IceCandidate = match serde_json::from_value(envelope.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "could not unmarshal JSON data");
                self.reply_error(event_id, None, ErrorCode::UnmarshalJson).await;
                return Ok(());
            }
        };
        let Some((meta, source)) = validate_meta(message.meta) else {
            warn!(event_id = %event_id, "incorrect metadata");
            self.reply_error(event_id, None, ErrorCode::IncorrectMetadata).await;
            return Ok(());
        };

        let key = SessionKey::new(meta.id.clone(), source);
        if !self.subscriber.registry.contains(&key).await {
            warn!(id = %meta.id, track_source = %source, "no session for requested metadata");
            self.reply_error(event_id, Some(meta), ErrorCode::MetadataNotMatched).await;
            return Ok(());
        }

        let init: RTCIceCandidateInit = match serde_json::from_str(&message.candidate) {
            Ok(init) => init,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "could not unmarshal candidate");
                self.reply_error(event_id, Some(meta), ErrorCode::UnmarshalJson).await;
                return Ok(());
            }
        };

        let queue = self.queues.entry(source).or_insert_with(CandidateQueue::new);
        match timeout(SIGNALING_TIMEOUT, queue.tx.send(init.candidate.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // The consuming peer is gone; restart the queue so the
                // next offer for this source sees the candidate.
                *queue = CandidateQueue::new();
                let _ = queue.tx.try_send(init.candidate);
                Ok(())
            }
            Err(_) => {
                warn!(id = %meta.id, track_source = %source, "candidate queue stalled");
                bail!("candidate queue stalled");
            }
        }
    }

    async fn send_envelope<T: Serialize>(
        &self,
        event: &'static str,
        id: String,
        data: T,
    ) -> Result<()> {
        let Some(frame) = encode_envelope(event, id, data) else {
            return Ok(());
        };
        match timeout(SIGNALING_TIMEOUT, self.out_tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("write path closed"),
            Err(_) => bail!("write path stalled"),
        }
    }

    async fn reply_error(&self, id: String, meta: Option<Meta>, code: ErrorCode) {
        // Best effort: if the write path is dead the read side will fail
        // next and tear the connection down.
        let _ = self.send_envelope(EVENT_ERROR, id, code.to_data(meta)).await;
    }
}

fn encode_envelope<T: Serialize>(event: &'static str, id: String, data: T) -> Option<Message> {
    match serde_json::to_string(&OutEnvelope { event, id, data }) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!(error = %e, "could not encode envelope");
            None
        }
    }
}

/// Reject a missing meta, an empty id, or a track source integer outside
/// the known variants.
fn validate_meta(meta: Option<Meta>) -> Option<(Meta, TrackSource)> {
    let meta = meta.filter(|m| !m.id.is_empty())?;
    let source = meta.source()?;
    Some((meta, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_meta_rejects_bad_input() {
        assert!(validate_meta(None).is_none());
        assert!(validate_meta(Some(Meta {
            id: String::new(),
            track_source: 0,
        }))
        .is_none());
        assert!(validate_meta(Some(Meta {
            id: "dev".into(),
            track_source: 9,
        }))
        .is_none());

        let (meta, source) = validate_meta(Some(Meta::new("dev", TrackSource::Monitor))).unwrap();
        assert_eq!(meta.id, "dev");
        assert_eq!(source, TrackSource::Monitor);
    }

    #[tokio::test]
    async fn candidate_queue_preserves_order() {
        let mut queue = CandidateQueue::new();
        queue.tx.try_send("first".to_owned()).unwrap();
        queue.tx.try_send("second".to_owned()).unwrap();

        let mut rx = queue.take_receiver();
        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn candidate_queue_is_bounded() {
        let queue = CandidateQueue::new();
        queue.tx.try_send("a".to_owned()).unwrap();
        queue.tx.try_send("b".to_owned()).unwrap();
        assert!(queue.tx.try_send("c".to_owned()).is_err());
    }

    #[tokio::test]
    async fn take_receiver_twice_starts_fresh_queue() {
        let mut queue = CandidateQueue::new();
        queue.tx.try_send("old".to_owned()).unwrap();
        let mut first = queue.take_receiver();
        assert_eq!(first.recv().await.unwrap(), "old");

        let mut second = queue.take_receiver();
        queue.tx.try_send("new".to_owned()).unwrap();
        assert_eq!(second.recv().await.unwrap(), "new");

        // The first receiver's channel is now detached.
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn encode_envelope_produces_expected_frame() {
        let frame = encode_envelope(
            EVENT_ERROR,
            "req-9".to_owned(),
            ErrorCode::MetadataNotMatched.to_data(Some(Meta::new("ghost", TrackSource::Drone))),
        )
        .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["id"], "req-9");
        assert_eq!(value["data"]["code"], 5);
        assert_eq!(value["data"]["meta"]["id"], "ghost");
    }
}
