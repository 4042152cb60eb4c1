//! Aircast — WebRTC broadcast relay
//!
//! Bridges live video from edge devices (drones and their companion
//! monitors) to any number of browser viewers. Edge devices push RTP into
//! the relay over one WebRTC peer connection per track, negotiated over an
//! MQTT broker; viewers pull over their own peer connections, negotiated
//! over a WebSocket. The relay is a selective forwarder: each ingest track
//! lives in memory under a `(device id, track source)` key and fans out to
//! every subscriber that asks for it.
//!
//! - [`engine`]: per-peer WebRTC lifecycle (ingest and fan-out modes)
//! - [`publisher`]: edge-side signaling over the broker
//! - [`subscriber`]: viewer-side signaling over WebSocket
//! - [`session`]: the registry binding the two signalers together
//! - [`signal`]: wire types for both legs
//! - [`config`]: configuration structs (parsing lives in the binary)

pub mod config;
pub mod engine;
pub mod publisher;
pub mod session;
pub mod signal;
pub mod subscriber;

pub use config::{BrokerConfig, IceServerConfig, ServerConfig, WebRtcConfig};
pub use engine::{EngineError, PeerEngine, PeerHandle, PeerState, SIGNALING_TIMEOUT};
pub use publisher::Publisher;
pub use session::{new_relay_track, RelayTrack, SessionKey, SessionRegistry};
pub use signal::{ErrorCode, Meta, SessionDescription, TrackSource};
pub use subscriber::Subscriber;
