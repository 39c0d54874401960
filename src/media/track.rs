use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Track lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Producing media
    Live,
    /// Stopped by this application
    Stopped,
    /// Ended by its source, e.g. the user stopped sharing from the OS UI
    Ended,
}

/// A single audio or video track.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Mute or unmute locally. The track keeps its device.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn state(&self) -> TrackState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop the track and release its device.
    ///
    /// Returns `true` if this call performed the stop.
    pub fn stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Stopped;
                true
            } else {
                false
            }
        })
    }

    /// Mark the track as ended by its source.
    ///
    /// Called by capture platforms when the device goes away or the user
    /// ends a capture outside of this application.
    pub fn end(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the track leaves [`TrackState::Live`].
    ///
    /// Resolves to `true` when the source ended the track and `false` when it
    /// was stopped locally.
    pub async fn ended(&self) -> bool {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|state| *state != TrackState::Live)
            .await
            .map(|state| *state == TrackState::Ended)
            .unwrap_or(false);
        result
    }
}

/// Shared ownership token over a set of tracks.
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    id: Arc<str>,
    tracks: Arc<Vec<Arc<MediaTrack>>>,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        let id: String = id.into();
        Self {
            id: Arc::from(id),
            tracks: Arc::new(tracks.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks_of(kind).next()
    }

    /// True while at least one track is live.
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|track| track.is_live())
    }

    /// Whether both handles refer to the same underlying tracks.
    pub fn same_stream(&self, other: &MediaStreamHandle) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }

    /// Stop every track. Returns how many tracks this call stopped.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|track| track.stop()).count()
    }

    /// Wait until any track is ended by its source.
    ///
    /// Resolves to `false` if every track was stopped locally instead, or if
    /// the stream has no tracks.
    pub async fn source_ended(&self) -> bool {
        let mut pending: Vec<_> = self
            .tracks
            .iter()
            .map(|track| Box::pin(track.ended()))
            .collect();

        while !pending.is_empty() {
            let (ended, _, rest) = futures::future::select_all(pending).await;
            if ended {
                return true;
            }
            pending = rest;
        }
        false
    }
}
