//! WebRTC peer engine.
//!
//! Builds one peer connection per binding and wires an RTP track between
//! the remote peer and an in-memory relay track. Two modes:
//!
//! - **ingest** ([`PeerEngine::bind_publisher`]): receive-only connection
//!   whose inbound RTP is copied into the relay track. Non-trickle: the
//!   returned answer carries all gathered candidates.
//! - **fan-out** ([`PeerEngine::bind_subscriber`]): the relay track is
//!   attached outbound and candidates trickle in both directions while the
//!   answer is returned immediately.
//!
//! Every wait is bounded by [`SIGNALING_TIMEOUT`]; expiry yields
//! [`EngineError::SignalingTimeout`] and the peer transitions to `Failed`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::config::WebRtcConfig;
use crate::session::RelayTrack;
use crate::signal::ErrorCode;

/// Bound on every signaling wait (answer readiness, ICE gathering,
/// candidate queue operations). Chosen to sit comfortably above broker
/// delivery latency.
pub const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one peer connection. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

/// Move the state machine forward. Terminal states win every race: once a
/// peer is `Closed` or `Failed` no callback may resurrect it.
fn advance(tx: &watch::Sender<PeerState>, next: PeerState) {
    tx.send_if_modified(|state| {
        if state.is_terminal() || *state == next {
            false
        } else {
            *state = next;
            true
        }
    });
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The remote session description could not be parsed.
    #[error("invalid session description: {0}")]
    Signaling(String),
    /// Answer generation or description exchange failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The relay track could not be attached to the peer connection.
    #[error("could not attach media track: {0}")]
    TrackAttach(String),
    /// A bounded signaling wait expired.
    #[error("signaling timed out after {0:?}")]
    SignalingTimeout(Duration),
}

impl EngineError {
    /// Wire error code for viewer-side replies.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Signaling(_) => ErrorCode::FailedToCreateSubscriber,
            EngineError::Negotiation(_) => ErrorCode::Negotiation,
            EngineError::TrackAttach(_) => ErrorCode::TrackAttach,
            EngineError::SignalingTimeout(_) => ErrorCode::SignalingTimeout,
        }
    }
}

fn negotiation(e: webrtc::Error) -> EngineError {
    EngineError::Negotiation(e.to_string())
}

type BindResult = Result<
    (
        RTCSessionDescription,
        Arc<RTCPeerConnection>,
        Arc<watch::Sender<PeerState>>,
    ),
    EngineError,
>;

/// Handle to a bound peer. Owns the connection: dropping the handle does
/// not close the peer, but [`PeerHandle::close`] (or cancellation of the
/// token passed at bind time) does.
pub struct PeerHandle {
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<PeerState>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    /// Tear the peer down and release its media resources.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }

    /// Wait until the peer reaches a terminal state, up to `within`.
    pub async fn wait_terminal(&self, within: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        timeout(within, async {
            while !rx.borrow().is_terminal() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

/// Factory for peer connections. One engine (and one underlying media API)
/// serves every peer in the process.
pub struct PeerEngine {
    api: API,
    rtc_config: RTCConfiguration,
    timeout: Duration,
}

impl PeerEngine {
    pub fn new(config: &WebRtcConfig) -> Result<Self, EngineError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: vec![server.url.clone()],
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self {
            api,
            rtc_config,
            timeout: SIGNALING_TIMEOUT,
        })
    }

    /// Parse a raw SDP offer as carried on the broker leg.
    pub fn parse_offer(sdp: &str) -> Result<RTCSessionDescription, EngineError> {
        RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|e| EngineError::Signaling(e.to_string()))
    }

    /// Create the peer connection plus its state machine and teardown task.
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Arc<RTCPeerConnection>, Arc<watch::Sender<PeerState>>), EngineError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(negotiation)?,
        );
        let (state_tx, _) = watch::channel(PeerState::New);
        let state_tx = Arc::new(state_tx);

        let tx = Arc::clone(&state_tx);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            match state {
                RTCPeerConnectionState::Connecting => advance(&tx, PeerState::Negotiating),
                RTCPeerConnectionState::Connected => advance(&tx, PeerState::Connected),
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                    advance(&tx, PeerState::Closed)
                }
                RTCPeerConnectionState::Failed => advance(&tx, PeerState::Failed),
                _ => {}
            }
            Box::pin(async {})
        }));

        // Release media resources as soon as the peer is cancelled or
        // reaches a terminal state on its own.
        let watcher_pc = Arc::clone(&pc);
        let watcher_tx = Arc::clone(&state_tx);
        let watcher_cancel = cancel.clone();
        let mut state_rx = state_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher_cancel.cancelled() => {
                    advance(&watcher_tx, PeerState::Closed);
                }
                _ = async {
                    while !state_rx.borrow_and_update().is_terminal() {
                        if state_rx.changed().await.is_err() {
                            break;
                        }
                    }
                } => {}
            }
            if let Err(e) = watcher_pc.close().await {
                debug!(error = %e, "peer connection close");
            }
        });

        Ok((pc, state_tx))
    }

    /// Ingest mode: receive one video stream from an edge peer and copy
    /// every RTP packet into `track`. Waits for ICE gathering to finish so
    /// the returned answer carries all candidates.
    pub async fn bind_publisher(
        &self,
        offer: RTCSessionDescription,
        track: Arc<RelayTrack>,
        cancel: CancellationToken,
    ) -> Result<(RTCSessionDescription, PeerHandle), EngineError> {
        let result = self.bind_publisher_inner(offer, track, &cancel).await;
        if result.is_err() {
            // Trip the teardown task so a half-built peer releases its
            // resources immediately.
            cancel.cancel();
        }
        result.map(|(answer, pc, state_tx)| {
            (
                answer,
                PeerHandle {
                    pc,
                    state_rx: state_tx.subscribe(),
                    cancel,
                },
            )
        })
    }

    async fn bind_publisher_inner(
        &self,
        offer: RTCSessionDescription,
        track: Arc<RelayTrack>,
        cancel: &CancellationToken,
    ) -> BindResult {
        let (pc, state_tx) = self.connect(cancel).await?;
        advance(&state_tx, PeerState::Negotiating);

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| EngineError::TrackAttach(e.to_string()))?;

        let copy_cancel = cancel.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let relay = Arc::clone(&track);
            let cancel = copy_cancel.clone();
            Box::pin(async move {
                debug!(ssrc = remote.ssrc(), "ingest track opened");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        packet = remote.read_rtp() => match packet {
                            Ok((packet, _)) => {
                                if let Err(e) = relay.write_rtp(&packet).await {
                                    if webrtc::Error::ErrClosedPipe != e {
                                        warn!(error = %e, "relay track write failed");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "ingest track closed");
                                break;
                            }
                        },
                    }
                }
            })
        }));

        pc.set_remote_description(offer).await.map_err(negotiation)?;
        let answer = self
            .await_bounded(pc.create_answer(None), &state_tx, &pc)
            .await?
            .map_err(negotiation)?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.map_err(negotiation)?;
        self.await_bounded(gather_complete.recv(), &state_tx, &pc).await?;

        let answer = pc
            .local_description()
            .await
            .ok_or_else(|| EngineError::Negotiation("local description missing".to_owned()))?;

        Ok((answer, pc, state_tx))
    }

    /// Fan-out mode: attach `track` outbound and negotiate with trickle
    /// ICE. Locally gathered candidates go to `send_candidate`; remote
    /// candidate strings are consumed from `recv_candidate` as they appear.
    /// Returns the answer without waiting for gathering.
    pub async fn bind_subscriber(
        &self,
        offer: RTCSessionDescription,
        track: Arc<RelayTrack>,
        send_candidate: mpsc::Sender<RTCIceCandidateInit>,
        recv_candidate: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<(RTCSessionDescription, PeerHandle), EngineError> {
        let result = self
            .bind_subscriber_inner(offer, track, send_candidate, recv_candidate, &cancel)
            .await;
        if result.is_err() {
            cancel.cancel();
        }
        result.map(|(answer, pc, state_tx)| {
            (
                answer,
                PeerHandle {
                    pc,
                    state_rx: state_tx.subscribe(),
                    cancel,
                },
            )
        })
    }

    async fn bind_subscriber_inner(
        &self,
        offer: RTCSessionDescription,
        track: Arc<RelayTrack>,
        send_candidate: mpsc::Sender<RTCIceCandidateInit>,
        mut recv_candidate: mpsc::Receiver<String>,
        cancel: &CancellationToken,
    ) -> BindResult {
        let (pc, state_tx) = self.connect(cancel).await?;
        advance(&state_tx, PeerState::Negotiating);

        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::TrackAttach(e.to_string()))?;

        // Keep the interceptor pipeline fed by draining RTCP from the
        // sender until the peer goes away.
        let drain_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    result = sender.read(&mut buf) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = send_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        if tx.send(init).await.is_err() {
                            debug!("candidate consumer gone");
                        }
                    }
                    Err(e) => warn!(error = %e, "could not serialize local candidate"),
                }
            })
        }));

        let candidate_pc = Arc::clone(&pc);
        let recv_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recv_cancel.cancelled() => break,
                    candidate = recv_candidate.recv() => match candidate {
                        Some(candidate) => {
                            let init = RTCIceCandidateInit {
                                candidate,
                                ..Default::default()
                            };
                            if let Err(e) = candidate_pc.add_ice_candidate(init).await {
                                warn!(error = %e, "could not add remote candidate");
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        pc.set_remote_description(offer).await.map_err(negotiation)?;
        let answer = self
            .await_bounded(pc.create_answer(None), &state_tx, &pc)
            .await?
            .map_err(negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;

        Ok((answer, pc, state_tx))
    }

    /// Run `fut` under the signaling timeout; on expiry the peer is failed
    /// and closed.
    async fn await_bounded<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
        state_tx: &watch::Sender<PeerState>,
        pc: &RTCPeerConnection,
    ) -> Result<T, EngineError> {
        match timeout(self.timeout, fut).await {
            Ok(value) => Ok(value),
            Err(_) => {
                advance(state_tx, PeerState::Failed);
                if let Err(e) = pc.close().await {
                    debug!(error = %e, "peer connection close");
                }
                Err(EngineError::SignalingTimeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerConfig;

    #[test]
    fn engine_builds_from_default_config() {
        let engine = PeerEngine::new(&WebRtcConfig::default()).unwrap();
        assert_eq!(engine.rtc_config.ice_servers.len(), 1);
        assert_eq!(engine.timeout, SIGNALING_TIMEOUT);
    }

    #[test]
    fn ice_servers_carry_credentials() {
        let config = WebRtcConfig {
            ice_servers: vec![IceServerConfig {
                url: "turn:turn.example.com:3478".to_owned(),
                username: "user".to_owned(),
                credential: "pass".to_owned(),
            }],
            ..Default::default()
        };
        let engine = PeerEngine::new(&config).unwrap();
        let server = &engine.rtc_config.ice_servers[0];
        assert_eq!(server.urls, vec!["turn:turn.example.com:3478".to_owned()]);
        assert_eq!(server.username, "user");
        assert_eq!(server.credential, "pass");
    }

    #[test]
    fn parse_offer_rejects_garbage() {
        let err = PeerEngine::parse_offer("not an sdp").unwrap_err();
        assert!(matches!(err, EngineError::Signaling(_)));
        assert_eq!(err.code(), ErrorCode::FailedToCreateSubscriber);
    }

    #[test]
    fn error_codes_map_to_wire_taxonomy() {
        assert_eq!(
            EngineError::Negotiation("x".into()).code(),
            ErrorCode::Negotiation
        );
        assert_eq!(
            EngineError::TrackAttach("x".into()).code(),
            ErrorCode::TrackAttach
        );
        assert_eq!(
            EngineError::SignalingTimeout(SIGNALING_TIMEOUT).code(),
            ErrorCode::SignalingTimeout
        );
    }

    // ========== State machine ==========

    #[test]
    fn advance_moves_forward() {
        let (tx, rx) = watch::channel(PeerState::New);
        advance(&tx, PeerState::Negotiating);
        assert_eq!(*rx.borrow(), PeerState::Negotiating);
        advance(&tx, PeerState::Connected);
        assert_eq!(*rx.borrow(), PeerState::Connected);
        advance(&tx, PeerState::Closed);
        assert_eq!(*rx.borrow(), PeerState::Closed);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let (tx, rx) = watch::channel(PeerState::Failed);
        advance(&tx, PeerState::Connected);
        assert_eq!(*rx.borrow(), PeerState::Failed);

        let (tx, rx) = watch::channel(PeerState::Closed);
        advance(&tx, PeerState::Failed);
        assert_eq!(*rx.borrow(), PeerState::Closed);
    }

    #[test]
    fn terminal_predicate() {
        assert!(PeerState::Closed.is_terminal());
        assert!(PeerState::Failed.is_terminal());
        assert!(!PeerState::New.is_terminal());
        assert!(!PeerState::Negotiating.is_terminal());
        assert!(!PeerState::Connected.is_terminal());
    }
}
