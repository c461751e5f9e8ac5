//! What the remote participant is sending us, and how it is laid out.
//!
//! Camera and screen video are told apart by the explicit `video-source`
//! metadata the sender attaches to its offer/answer and re-announces on every
//! in-place track swap. The `display-surface` capture hint is only consulted
//! for a mid the sender never tagged, and track ids are never inspected.

use std::collections::HashMap;

use super::media::TrackKind;
use super::peer::RemoteTrack;
use super::signaling::{VideoSource, VideoSourceTag};

/// One video shown in the call view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedVideo {
    pub track_id: String,
    pub mid: String,
    pub source: VideoSource,
}

/// Primary/secondary arrangement of the remote videos.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteLayout {
    pub primary: Option<DisplayedVideo>,
    pub secondary: Option<DisplayedVideo>,
    pub has_audio: bool,
}

#[derive(Debug, Default)]
pub struct RemoteView {
    audio: Option<RemoteTrack>,
    videos: Vec<RemoteTrack>,
    /// Explicit sender metadata, by mid. `None` means "sending no video".
    signalled: HashMap<String, Option<VideoSource>>,
}

impl RemoteView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&mut self, track: RemoteTrack) {
        match track.kind {
            TrackKind::Audio => self.audio = Some(track),
            TrackKind::Video => {
                self.videos.retain(|v| v.mid != track.mid);
                self.videos.push(track);
            }
        }
    }

    pub fn apply_tag(&mut self, tag: &VideoSourceTag) {
        tracing::debug!("Remote video on mid {} is now {:?}", tag.mid, tag.source);
        self.signalled.insert(tag.mid.clone(), tag.source);
    }

    pub fn has_media(&self) -> bool {
        self.audio.is_some() || !self.videos.is_empty()
    }

    /// Classify a remote video. `None` means it is currently not displayed.
    pub fn classify(&self, track: &RemoteTrack) -> Option<VideoSource> {
        if let Some(signalled) = self.signalled.get(&track.mid) {
            return *signalled;
        }
        if track.display_surface.is_some() {
            return Some(VideoSource::Screen);
        }
        Some(VideoSource::Camera)
    }

    /// Screen share goes first when present; camera is secondary then.
    pub fn layout(&self) -> RemoteLayout {
        let shown: Vec<DisplayedVideo> = self
            .videos
            .iter()
            .filter_map(|t| {
                self.classify(t).map(|source| DisplayedVideo {
                    track_id: t.id.clone(),
                    mid: t.mid.clone(),
                    source,
                })
            })
            .collect();

        let screen = shown.iter().find(|v| v.source == VideoSource::Screen).cloned();
        let camera = shown.iter().find(|v| v.source == VideoSource::Camera).cloned();
        let (primary, secondary) = match screen {
            Some(screen) => (Some(screen), camera),
            None => (camera, None),
        };
        RemoteLayout {
            primary,
            secondary,
            has_audio: self.audio.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str, mid: &str, surface: Option<&str>) -> RemoteTrack {
        RemoteTrack {
            id: id.into(),
            kind: TrackKind::Video,
            mid: mid.into(),
            display_surface: surface.map(str::to_string),
        }
    }

    #[test]
    fn test_camera_by_default() {
        let mut view = RemoteView::new();
        view.add_track(video("cam-1", "1", None));
        let layout = view.layout();
        assert_eq!(layout.primary.unwrap().source, VideoSource::Camera);
        assert!(layout.secondary.is_none());
    }

    #[test]
    fn test_signal_overrides_surface_hint() {
        let mut view = RemoteView::new();
        view.add_track(video("t", "1", Some("monitor")));
        assert_eq!(view.layout().primary.unwrap().source, VideoSource::Screen);

        view.apply_tag(&VideoSourceTag {
            mid: "1".into(),
            source: Some(VideoSource::Camera),
        });
        assert_eq!(view.layout().primary.unwrap().source, VideoSource::Camera);
    }

    #[test]
    fn test_screen_primary_camera_secondary() {
        let mut view = RemoteView::new();
        view.add_track(video("cam", "1", None));
        view.add_track(video("scr", "2", None));
        view.apply_tag(&VideoSourceTag {
            mid: "2".into(),
            source: Some(VideoSource::Screen),
        });
        let layout = view.layout();
        assert_eq!(layout.primary.unwrap().track_id, "scr");
        assert_eq!(layout.secondary.unwrap().track_id, "cam");
    }

    #[test]
    fn test_track_ids_are_not_sniffed() {
        let mut view = RemoteView::new();
        view.add_track(video("screen-share-video", "1", None));
        assert_eq!(view.layout().primary.unwrap().source, VideoSource::Camera);
    }

    #[test]
    fn test_no_video_signal_hides_track() {
        let mut view = RemoteView::new();
        view.add_track(video("cam", "1", None));
        view.apply_tag(&VideoSourceTag { mid: "1".into(), source: None });
        assert_eq!(view.layout(), RemoteLayout::default());
    }
}
