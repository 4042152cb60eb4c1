//! Session registry shared between the publisher and subscriber signalers.
//!
//! Publishers are the only writers; subscribers only look tracks up. The
//! lock is never held across network I/O, so readers and writers only
//! contend for the duration of a map operation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::signal::TrackSource;

/// In-memory RTP sink/source: written by one ingest peer, read by any
/// number of fan-out peers holding the same `Arc`.
pub type RelayTrack = TrackLocalStaticRTP;

/// Allocate a fresh relay track for one ingest stream.
pub fn new_relay_track() -> Arc<RelayTrack> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "aircast".to_owned(),
    ))
}

/// Names one ingest track: the edge-assigned device id plus which of the
/// device's two feeds it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub device_id: String,
    pub source: TrackSource,
}

impl SessionKey {
    pub fn new(device_id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            device_id: device_id.into(),
            source,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device_id, self.source)
    }
}

/// Map from [`SessionKey`] to the live [`RelayTrack`] for that ingest
/// stream. At most one entry per key; a re-publish replaces the entry
/// atomically, and readers observe either the old or the new track.
#[derive(Default)]
pub struct SessionRegistry {
    tracks: RwLock<HashMap<SessionKey, Arc<RelayTrack>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the track for `key`, returning the displaced track if the key
    /// was already live.
    pub async fn insert(&self, key: SessionKey, track: Arc<RelayTrack>) -> Option<Arc<RelayTrack>> {
        self.tracks.write().await.insert(key, track)
    }

    /// Look up the current track for `key`.
    pub async fn get(&self, key: &SessionKey) -> Option<Arc<RelayTrack>> {
        self.tracks.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &SessionKey) -> bool {
        self.tracks.read().await.contains_key(key)
    }

    pub async fn remove(&self, key: &SessionKey) -> Option<Arc<RelayTrack>> {
        self.tracks.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.tracks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracks.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_display_is_composite() {
        let key = SessionKey::new("drone-A", TrackSource::Drone);
        assert_eq!(key.to_string(), "drone-A/0");
        let key = SessionKey::new("drone-A", TrackSource::Monitor);
        assert_eq!(key.to_string(), "drone-A/1");
    }

    #[test]
    fn session_keys_distinguish_sources() {
        let drone = SessionKey::new("dev", TrackSource::Drone);
        let monitor = SessionKey::new("dev", TrackSource::Monitor);
        assert_ne!(drone, monitor);
    }

    #[tokio::test]
    async fn insert_then_get_returns_same_track() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("drone-A", TrackSource::Drone);
        let track = new_relay_track();

        assert!(registry.insert(key.clone(), track.clone()).await.is_none());
        let found = registry.get(&key).await.unwrap();
        assert!(Arc::ptr_eq(&found, &track));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_miss_returns_none() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("ghost", TrackSource::Drone);
        assert!(registry.get(&key).await.is_none());
        assert!(!registry.contains(&key).await);
    }

    #[tokio::test]
    async fn replacement_returns_displaced_track() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("drone-A", TrackSource::Drone);
        let first = new_relay_track();
        let second = new_relay_track();

        registry.insert(key.clone(), first.clone()).await;
        let displaced = registry.insert(key.clone(), second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));

        // Still exactly one entry, and it is the new track.
        assert_eq!(registry.len().await, 1);
        let current = registry.get(&key).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn displaced_track_stays_usable_through_existing_handles() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("drone-A", TrackSource::Drone);
        let first = new_relay_track();

        registry.insert(key.clone(), first.clone()).await;
        let subscriber_handle = registry.get(&key).await.unwrap();
        registry.insert(key.clone(), new_relay_track()).await;

        // The subscriber's Arc is unaffected by the replacement; only the
        // registry dropped its handle.
        assert!(Arc::ptr_eq(&subscriber_handle, &first));
        assert_eq!(Arc::strong_count(&first), 2);
    }

    #[tokio::test]
    async fn concurrent_readers_see_consistent_entries() {
        let registry = Arc::new(SessionRegistry::new());
        let key = SessionKey::new("drone-A", TrackSource::Drone);
        registry.insert(key.clone(), new_relay_track()).await;

        let mut readers = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let key = key.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    assert!(registry.get(&key).await.is_some());
                }
            }));
        }
        let writer = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    registry.insert(key.clone(), new_relay_track()).await;
                }
            })
        };

        for r in readers {
            r.await.unwrap();
        }
        writer.await.unwrap();
        assert_eq!(registry.len().await, 1);
    }
}
