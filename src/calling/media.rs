//! Local media capture — tracks, streams and the capture capability seam.
//!
//! Capture itself belongs to the platform (`MediaDevices`). This module owns
//! the shared track handles the rest of the core passes around, and the
//! camera+microphone acquisition policy with its audio-only fallback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a local track captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// Classified media-capture failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use the camera or microphone was denied")]
    PermissionDenied,
    #[error("no camera or microphone was found")]
    NotFound,
    #[error("the camera or microphone is already in use by another application")]
    InUse,
    #[error("media capture is not supported in this environment")]
    NotSupported,
    #[error("media capture failed: {0}")]
    Unknown(String),
}

struct TrackInner {
    id: String,
    source: TrackSource,
    label: String,
    /// Capability hint set by screen capture (e.g. "monitor", "window").
    display_surface: Option<String>,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    stops: AtomicUsize,
}

/// Shared handle to one captured track.
///
/// Clones refer to the same capture; stopping any clone stops the capture.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        Self::build(source, label.into(), None)
    }

    /// A screen-capture track carrying its display-surface hint.
    pub fn screen(label: impl Into<String>, display_surface: impl Into<String>) -> Self {
        Self::build(TrackSource::Screen, label.into(), Some(display_surface.into()))
    }

    fn build(source: TrackSource, label: String, display_surface: Option<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                source,
                label,
                display_surface,
                enabled: AtomicBool::new(true),
                state,
                stops: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn display_surface(&self) -> Option<&str> {
        self.inner.display_surface.as_deref()
    }

    pub fn is_live(&self) -> bool {
        *self.inner.state.borrow() == TrackState::Live
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without releasing the capture.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release the capture. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        });
        if stopped {
            self.inner.stops.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Stopped {:?} track {} ({})", self.inner.source, self.inner.id, self.inner.label);
        }
        stopped
    }

    /// The platform ended the capture on its own, e.g. the browser's
    /// "stop sharing" control. Wakes every `ended()` waiter.
    #[cfg(test)]
    pub fn end_from_platform(&self) -> bool {
        tracing::info!("{:?} track {} ended by the platform", self.inner.source, self.inner.id);
        self.stop()
    }

    /// Resolves once the track has ended, for whatever reason.
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives inside `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }

    /// Number of times the capture actually transitioned to ended (0 or 1).
    #[cfg(test)]
    pub fn stop_count(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }
}

/// A group of tracks returned by one capture request.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio).cloned()
    }

    pub fn video(&self) -> Option<LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop every track in the stream.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Which kinds a capture request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self { audio: true, video: true };
    pub const AUDIO_ONLY: Self = Self { audio: true, video: false };
}

/// The platform's capture capability.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture camera and/or microphone.
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;

    /// Capture a screen, window or tab.
    async fn get_display_media(&self) -> Result<LocalStream, MediaError>;
}

/// Media acquired for a call.
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub stream: LocalStream,
    /// The camera could not be captured; the call proceeds audio-only.
    pub audio_only: bool,
}

/// Acquire camera+microphone, falling back to microphone only.
///
/// When both requests fail, the error of the audio-only request is
/// returned: it is the one that decides the call cannot proceed.
pub async fn acquire_call_media(devices: &dyn MediaDevices) -> Result<AcquiredMedia, MediaError> {
    match devices.get_user_media(MediaConstraints::AUDIO_VIDEO).await {
        Ok(stream) => {
            tracing::info!("Acquired camera and microphone ({} tracks)", stream.tracks().len());
            Ok(AcquiredMedia {
                stream,
                audio_only: false,
            })
        }
        Err(video_err) => {
            tracing::warn!("Camera+microphone capture failed ({}), retrying audio-only", video_err);
            match devices.get_user_media(MediaConstraints::AUDIO_ONLY).await {
                Ok(stream) => {
                    tracing::info!("Acquired microphone only");
                    Ok(AcquiredMedia {
                        stream,
                        audio_only: true,
                    })
                }
                Err(audio_err) => {
                    tracing::warn!("Audio-only capture failed: {}", audio_err);
                    Err(audio_err)
                }
            }
        }
    }
}
