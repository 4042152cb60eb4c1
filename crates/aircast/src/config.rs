//! Configuration structs for the relay subsystems.
//!
//! Plain data; parsing from the environment lives in the server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Broker endpoint, credentials and topic routing for the publisher leg.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker address in the edge deployment's `tcp://host:port` notation.
    pub server: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Topic carrying edge offers.
    pub offer_topic: String,
    /// Prefix of per-device answer topics; the full topic is
    /// `{prefix}/{id}/{track_source}` computed from each offer payload.
    pub answer_topic_prefix: String,
    /// MQTT QoS for both the subscription and answer publishes (0, 1 or 2).
    pub qos: u8,
    /// Retain flag on answer publishes.
    pub retained: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: "tcp://mosquitto:1883".to_owned(),
            client_id: "aircast".to_owned(),
            username: String::new(),
            password: String::new(),
            offer_topic: "/edge/livestream/signal/offer".to_owned(),
            answer_topic_prefix: "/edge/livestream/signal/answer".to_owned(),
            qos: 0,
            retained: false,
        }
    }
}

impl BrokerConfig {
    /// Split `server` into host and port. Accepts `tcp://` and `mqtt://`
    /// schemes or a bare `host:port`; the port defaults to 1883.
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let stripped = self
            .server
            .strip_prefix("tcp://")
            .or_else(|| self.server.strip_prefix("mqtt://"))
            .unwrap_or(&self.server);
        if stripped.is_empty() {
            bail!("empty broker address");
        }
        match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid broker port in {}", self.server))?;
                Ok((host.to_owned(), port))
            }
            None => Ok((stripped.to_owned(), 1883)),
        }
    }
}

/// One ICE server entry. `username` and `credential` may be empty for STUN.
#[derive(Debug, Clone, Default)]
pub struct IceServerConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Peer engine and front-end options shared by both signalers.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Serve the debug front-end from `frontend_dir` at `/`.
    pub enable_frontend: bool,
    pub frontend_dir: PathBuf,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                url: "stun:stun.l.google.com:19302".to_owned(),
                ..Default::default()
            }],
            enable_frontend: false,
            frontend_dir: PathBuf::from("static"),
        }
    }
}

/// HTTP bind address for the subscriber leg.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}
