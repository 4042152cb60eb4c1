//! Publisher signaler: terminates edge-side signaling over the MQTT broker.
//!
//! Each offer arriving on the configured topic negotiates one ingest peer.
//! The answer is published on a per-device topic computed from the offer
//! payload, and only after a successful publish does the session registry
//! flip to the new relay track.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::engine::{PeerEngine, PeerHandle};
use crate::session::{new_relay_track, SessionKey, SessionRegistry};
use crate::signal::{SessionDescription, TrackSource};

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Per-device answer topic: `{prefix}/{device_id}/{track_source}`.
pub fn answer_topic(prefix: &str, key: &SessionKey) -> String {
    format!("{}/{}/{}", prefix, key.device_id, key.source as i32)
}

/// Edge-side signaler. One instance serves every edge device.
pub struct Publisher {
    client: AsyncClient,
    engine: Arc<PeerEngine>,
    registry: Arc<SessionRegistry>,
    config: BrokerConfig,
    cancel: CancellationToken,
    /// Live ingest peer per session, so a re-publish can tear the old one
    /// down once the registry has flipped.
    ingest: Mutex<HashMap<SessionKey, PeerHandle>>,
    /// Per-key offer lanes: offers for one key are handled in broker
    /// delivery order, offers for distinct keys in parallel.
    lanes: Mutex<HashMap<SessionKey, mpsc::UnboundedSender<SessionDescription>>>,
}

impl Publisher {
    pub fn new(
        client: AsyncClient,
        engine: Arc<PeerEngine>,
        registry: Arc<SessionRegistry>,
        config: BrokerConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            engine,
            registry,
            config,
            cancel,
            ingest: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
        })
    }

    /// Drive the broker event loop until cancellation. The event loop owns
    /// reconnection; we subscribe up front (the caller may have consumed
    /// the initial `ConnAck` during its connectivity check) and again on
    /// every reconnect.
    pub async fn run(self: Arc<Self>, mut eventloop: EventLoop) -> Result<()> {
        info!(topic = %self.config.offer_topic, "publisher signaler starting");
        if let Err(e) = self
            .client
            .subscribe(&self.config.offer_topic, qos_from_u8(self.config.qos))
            .await
        {
            warn!(topic = %self.config.offer_topic, error = %e, "could not subscribe to offer topic");
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("publisher signaler shutting down");
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(server = %self.config.server, "connected to broker");
                        if let Err(e) = self
                            .client
                            .subscribe(&self.config.offer_topic, qos_from_u8(self.config.qos))
                            .await
                        {
                            warn!(
                                topic = %self.config.offer_topic,
                                error = %e,
                                "could not subscribe to offer topic"
                            );
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_message(&publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "broker connection error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        Ok(())
    }

    /// Decode one broker message and queue it on its session's lane.
    /// Malformed payloads are logged and dropped.
    async fn handle_message(self: &Arc<Self>, payload: &[u8]) {
        let offer = match SessionDescription::decode_payload(payload) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(topic = %self.config.offer_topic, error = %e, "could not unmarshal sdp");
                return;
            }
        };
        let Ok(source) = TrackSource::try_from(offer.track_source) else {
            warn!(
                topic = %self.config.offer_topic,
                id = %offer.id,
                track_source = offer.track_source,
                "unknown track source"
            );
            return;
        };
        let key = SessionKey::new(offer.id.clone(), source);

        let mut lanes = self.lanes.lock().await;
        let offer = if let Some(tx) = lanes.get(&key) {
            match tx.send(offer) {
                Ok(()) => return,
                Err(e) => e.0,
            }
        } else {
            offer
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(offer);
        lanes.insert(key.clone(), tx);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_lane(key, rx).await });
    }

    async fn run_lane(&self, key: SessionKey, mut rx: mpsc::UnboundedReceiver<SessionDescription>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                offer = rx.recv() => match offer {
                    Some(offer) => {
                        if let Err(e) = self.signal_offer(offer).await {
                            warn!(
                                offer_topic = %self.config.offer_topic,
                                id = %key.device_id,
                                track_source = %key.source,
                                error = %e,
                                "failed to signal peer connection"
                            );
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Negotiate one ingest peer for `offer`: fresh relay track, engine in
    /// ingest mode, answer published to the per-device topic, registry
    /// updated last. Any failure leaves the registry untouched; the edge
    /// retries by republishing.
    pub async fn signal_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let source = TrackSource::try_from(offer.track_source)
            .map_err(|_| anyhow::anyhow!("unknown track source {}", offer.track_source))?;
        let key = SessionKey::new(offer.id.clone(), source);
        debug!(id = %offer.id, track_source = %source, "received offer from edge");

        let track = new_relay_track();
        let remote = PeerEngine::parse_offer(&offer.sdp).context("could not parse edge offer")?;
        let (answer, handle) = self
            .engine
            .bind_publisher(remote, Arc::clone(&track), self.cancel.child_token())
            .await
            .context("failed to create ingest peer")?;
        debug!(id = %offer.id, track_source = %source, "created ingest peer");

        let answer = SessionDescription {
            id: offer.id.clone(),
            track_source: offer.track_source,
            sdp: answer.sdp,
        };
        let topic = answer_topic(&self.config.answer_topic_prefix, &key);
        if let Err(e) = self
            .client
            .publish(
                topic.clone(),
                qos_from_u8(self.config.qos),
                self.config.retained,
                answer.encode_payload(),
            )
            .await
        {
            handle.close().await;
            return Err(anyhow::Error::new(e).context(format!("could not publish to {topic}")));
        }
        debug!(answer_topic = %topic, "sent answer to edge");

        // The answer goes out before the registry flips; a viewer racing
        // the answer retries its lookup.
        self.registry.insert(key.clone(), track).await;
        let displaced = self.ingest.lock().await.insert(key.clone(), handle);
        if let Some(old) = displaced {
            debug!(key = %key, "replacing existing session");
            tokio::spawn(async move { old.close().await });
        }
        debug!(key = %key, "registered session");
        Ok(answer)
    }
}
