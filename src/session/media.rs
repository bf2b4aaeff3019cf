//! Local media descriptors and acquisition
//!
//! Capture itself belongs to the surrounding application. The session only
//! needs to know which tracks exist, which one is the outgoing video, and
//! to stop them on teardown.

use super::SessionError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Kind of call requested in an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    #[default]
    #[serde(alias = "call")]
    Video,
}

/// A local media track. Clones share the stop flag.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn camera() -> Self {
        Self::new(format!("camera-{}", uuid::Uuid::new_v4()), TrackKind::Video, TrackSource::Camera)
    }

    pub fn screen() -> Self {
        Self::new(format!("screen-{}", uuid::Uuid::new_v4()), TrackKind::Video, TrackSource::Screen)
    }

    pub fn microphone() -> Self {
        Self::new(format!("mic-{}", uuid::Uuid::new_v4()), TrackKind::Audio, TrackSource::Microphone)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.source == other.source
    }
}

/// Set of local tracks attached to a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMedia {
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    /// The outgoing video track, if any
    pub fn video(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    /// Swap the video track, returning the one it replaced
    pub fn replace_video(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match self.tracks.iter_mut().find(|t| t.kind == TrackKind::Video) {
            Some(slot) => Some(std::mem::replace(slot, track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquires local media before any signaling happens
pub trait MediaProvider: Send + Sync {
    fn acquire(&self, kind: CallKind) -> Result<LocalMedia, SessionError>;
}

/// Provider handing out fresh synthetic tracks
#[derive(Debug, Clone, Default)]
pub struct StaticMediaProvider {
    denied: bool,
}

impl StaticMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that behaves like a user who refused camera/microphone access
    pub fn denied() -> Self {
        Self { denied: true }
    }
}

impl MediaProvider for StaticMediaProvider {
    fn acquire(&self, kind: CallKind) -> Result<LocalMedia, SessionError> {
        if self.denied {
            return Err(SessionError::MediaAcquisition(
                "camera/microphone permission denied".to_string(),
            ));
        }
        let mut tracks = vec![LocalTrack::microphone()];
        if kind == CallKind::Video {
            tracks.push(LocalTrack::camera());
        }
        Ok(LocalMedia::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_video_keeps_audio() {
        let mic = LocalTrack::microphone();
        let cam = LocalTrack::camera();
        let mut media = LocalMedia::new(vec![mic.clone(), cam.clone()]);
        let screen = LocalTrack::screen();
        let previous = media.replace_video(screen.clone());
        assert_eq!(previous, Some(cam));
        assert_eq!(media.video(), Some(&screen));
        assert_eq!(media.tracks.len(), 2);
    }

    #[test]
    fn test_stop_is_shared_between_clones() {
        let track = LocalTrack::camera();
        let media = LocalMedia::new(vec![track.clone()]);
        media.stop_all();
        assert!(track.is_stopped());
    }

    #[test]
    fn test_call_kind_accepts_legacy_name() {
        let kind: CallKind = serde_json::from_str("\"call\"").unwrap();
        assert_eq!(kind, CallKind::Video);
    }

    #[test]
    fn test_denied_provider() {
        let err = StaticMediaProvider::denied().acquire(CallKind::Video).unwrap_err();
        assert!(matches!(err, SessionError::MediaAcquisition(_)));
    }
}
