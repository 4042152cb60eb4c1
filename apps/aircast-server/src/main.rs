//! Aircast Server — WebRTC broadcast relay service
//!
//! Bridges edge video streams (negotiated over MQTT) to browser viewers
//! (negotiated over WebSocket).
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: broker at tcp://mosquitto:1883, HTTP on 0.0.0.0:8080
//! aircast-server
//!
//! # Custom broker and bind port
//! AIRCAST_MQTT_SERVER=tcp://localhost:1883 AIRCAST_PORT=9000 aircast-server
//!
//! # Serve the debug front-end
//! AIRCAST_ENABLE_FRONTEND=1 AIRCAST_FRONTEND_DIR=./static aircast-server
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use aircast::{
    BrokerConfig, IceServerConfig, PeerEngine, Publisher, ServerConfig, SessionRegistry,
    Subscriber, WebRtcConfig,
};

/// How long to wait for the broker to acknowledge the connection before
/// giving up at startup.
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Full configuration from `AIRCAST_*` environment variables.
struct Config {
    broker: BrokerConfig,
    webrtc: WebRtcConfig,
    server: ServerConfig,
}

impl Config {
    fn from_env() -> Self {
        let mut broker = BrokerConfig::default();
        if let Ok(v) = std::env::var("AIRCAST_MQTT_SERVER") {
            broker.server = v;
        }
        if let Ok(v) = std::env::var("AIRCAST_MQTT_CLIENT_ID") {
            broker.client_id = v;
        }
        if let Ok(v) = std::env::var("AIRCAST_MQTT_USERNAME") {
            broker.username = v;
        }
        if let Ok(v) = std::env::var("AIRCAST_MQTT_PASSWORD") {
            broker.password = v;
        }
        if let Ok(v) = std::env::var("AIRCAST_TOPIC_OFFER") {
            broker.offer_topic = v;
        }
        if let Ok(v) = std::env::var("AIRCAST_TOPIC_ANSWER_PREFIX") {
            broker.answer_topic_prefix = v;
        }
        if let Some(v) = env_parse::<u8>("AIRCAST_QOS") {
            broker.qos = v;
        }
        if let Some(v) = env_flag("AIRCAST_RETAINED") {
            broker.retained = v;
        }

        let mut webrtc = WebRtcConfig::default();
        if let Ok(v) = std::env::var("AIRCAST_ICE_SERVER") {
            webrtc.ice_servers = vec![IceServerConfig {
                url: v,
                username: std::env::var("AIRCAST_ICE_USERNAME").unwrap_or_default(),
                credential: std::env::var("AIRCAST_ICE_CREDENTIAL").unwrap_or_default(),
            }];
        }
        if let Some(v) = env_flag("AIRCAST_ENABLE_FRONTEND") {
            webrtc.enable_frontend = v;
        }
        if let Ok(v) = std::env::var("AIRCAST_FRONTEND_DIR") {
            webrtc.frontend_dir = v.into();
        }

        let mut server = ServerConfig::default();
        if let Ok(v) = std::env::var("AIRCAST_HOST") {
            server.host = v;
        }
        if let Some(v) = env_parse::<u16>("AIRCAST_PORT") {
            server.port = v;
        }

        Self {
            broker,
            webrtc,
            server,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aircast=info".parse().unwrap()),
        )
        .init();
}

/// Poll the event loop until the broker acknowledges the connection.
/// Failure here is fatal: a relay that cannot reach its broker serves
/// nobody.
async fn check_broker_connectivity(eventloop: &mut EventLoop) -> Result<()> {
    let deadline = tokio::time::Instant::now() + BROKER_CONNECT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            bail!("broker did not acknowledge within {:?}", BROKER_CONNECT_TIMEOUT);
        }
        match tokio::time::timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "broker connect attempt failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(_) => bail!("broker did not acknowledge within {:?}", BROKER_CONNECT_TIMEOUT),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let config = Config::from_env();

    info!("Aircast relay starting");
    info!("  Broker: {}", config.broker.server);
    info!("  Offer topic: {}", config.broker.offer_topic);
    info!("  HTTP bind: {}:{}", config.server.host, config.server.port);

    let bind = config.server.bind_addr()?;
    let (host, port) = config.broker.endpoint()?;

    let mut options = MqttOptions::new(config.broker.client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(5));
    if !config.broker.username.is_empty() {
        options.set_credentials(config.broker.username.clone(), config.broker.password.clone());
    }
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    check_broker_connectivity(&mut eventloop)
        .await
        .context("broker unreachable")?;
    info!("broker connection verified");

    let registry = Arc::new(SessionRegistry::new());
    let engine = Arc::new(PeerEngine::new(&config.webrtc)?);

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // The connectivity check consumed the first ConnAck, so the publisher
    // must subscribe up front as well as on reconnect.
    let publisher = Publisher::new(
        client,
        Arc::clone(&engine),
        Arc::clone(&registry),
        config.broker.clone(),
        cancel.clone(),
    );
    tracker.spawn(async move {
        if let Err(e) = publisher.run(eventloop).await {
            error!(error = %e, "publisher signaler failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind to {bind}"))?;
    let subscriber = Subscriber::new(engine, registry, config.webrtc.clone(), cancel.clone());
    let server_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = subscriber.serve(listener).await {
            error!(error = %e, "subscriber signaler failed");
            server_cancel.cancel();
        }
    });

    tracker.close();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("shutdown timed out after 5s");
    }
    Ok(())
}
