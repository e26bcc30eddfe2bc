//! Local and remote media streams, and the platform device seam.
//!
//! A `MediaStream` is a cheap, cloneable handle: every clone observes the same
//! set of tracks, so the call engine can hand read-only views to renderers
//! while keeping ownership of start/stop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::models::CallType;

/// Track media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Counts live device tracks so a release can be observed exactly once.
#[derive(Debug, Default)]
pub struct DeviceLedger {
    opened: AtomicUsize,
    released: AtomicUsize,
}

impl DeviceLedger {
    #[cfg(test)]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Device tracks currently holding hardware open.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.released())
    }
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ledger: Option<Arc<DeviceLedger>>,
}

/// One audio or video track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    fn build(kind: TrackKind, label: impl Into<String>, ledger: Option<Arc<DeviceLedger>>) -> Self {
        if let Some(ledger) = &ledger {
            ledger.opened.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                ledger,
            }),
        }
    }

    /// A track backed by a local capture device.
    pub fn device(kind: TrackKind, label: impl Into<String>, ledger: Arc<DeviceLedger>) -> Self {
        Self::build(kind, label, Some(ledger))
    }

    /// A track received from the peer.
    pub fn remote(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::build(kind, label, None)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track, releasing its device. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(ledger) = &self.inner.ledger {
            ledger.released.fetch_add(1, Ordering::SeqCst);
        }
        true
    }
}

static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);

/// A set of tracks that renders as one view.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: u64,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaStream {
    /// An empty stream, e.g. the placeholder for not-yet-arrived remote tracks.
    pub fn new() -> Self {
        Self {
            id: NEXT_STREAM.fetch_add(1, Ordering::Relaxed),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tracks(tracks: Vec<MediaTrack>) -> Self {
        let stream = Self::new();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<MediaTrack>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.guard();
        if tracks.iter().all(|t| t.id() != track.id()) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.guard().clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.guard()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Stop every track. Returns how many tracks this call actually stopped.
    pub fn stop_all(&self) -> usize {
        self.guard().iter().filter(|t| t.stop()).count()
    }
}

/// Why local media could not be acquired.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MediaAccessError {
    #[error("camera/microphone permission denied")]
    Denied,
    #[error("media device error: {0}")]
    Device(String),
}

/// Platform access to the camera and microphone.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Prompt (if needed) and open devices for `call_type`.
    async fn get_user_media(&self, call_type: CallType) -> Result<MediaStream, MediaAccessError>;
}

/// How `SyntheticDevices` answers the next prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePolicy {
    Grant,
    Deny,
    Fail,
}

/// Device implementation producing synthetic capture tracks.
///
/// Used headless (no camera or microphone attached) and in tests; the policy
/// can be changed at any time to emulate a user revoking or granting access.
#[derive(Clone)]
pub struct SyntheticDevices {
    policy: Arc<Mutex<DevicePolicy>>,
    prompts: Arc<AtomicUsize>,
    ledger: Arc<DeviceLedger>,
}

impl SyntheticDevices {
    pub fn new(policy: DevicePolicy) -> Self {
        Self {
            policy: Arc::new(Mutex::new(policy)),
            prompts: Arc::new(AtomicUsize::new(0)),
            ledger: Arc::new(DeviceLedger::default()),
        }
    }

    #[cfg(test)]
    pub fn set_policy(&self, policy: DevicePolicy) {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Number of platform prompts shown so far.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> Arc<DeviceLedger> {
        Arc::clone(&self.ledger)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, call_type: CallType) -> Result<MediaStream, MediaAccessError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let policy = *self.policy.lock().unwrap_or_else(|e| e.into_inner());
        match policy {
            DevicePolicy::Deny => return Err(MediaAccessError::Denied),
            DevicePolicy::Fail => {
                return Err(MediaAccessError::Device("no capture device found".into()))
            }
            DevicePolicy::Grant => {}
        }

        let mut tracks = vec![MediaTrack::device(
            TrackKind::Audio,
            "synthetic microphone",
            self.ledger(),
        )];
        if call_type.wants_video() {
            tracks.push(MediaTrack::device(
                TrackKind::Video,
                "synthetic camera",
                self.ledger(),
            ));
        }
        Ok(MediaStream::with_tracks(tracks))
    }
}
