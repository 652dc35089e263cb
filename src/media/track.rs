//! Media tracks and streams
//!
//! A `MediaTrack` is a cheaply clonable handle to a single source of frames.
//! Consumers subscribe with [`MediaTrack::reader`]; producers `push` frames.
//! A `MediaStream` groups tracks under one stream id, the way the remote side
//! sees them (a screen share stream carries its video and system audio).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Samples per audio frame (10 ms at 48 kHz)
pub const FRAME_SAMPLES: usize = 480;

/// Engine sample rate
pub const SAMPLE_RATE: u32 = 48000;

const TRACK_CHANNEL_CAPACITY: usize = 64;

/// Mono f32 PCM frame
#[derive(Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / self.sample_rate as u64)
    }

    /// Root mean square level
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// A frame flowing through a track
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(AudioFrame),
    /// Encoded video payload (VP8)
    Video(Bytes),
}

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    tx: broadcast::Sender<MediaFrame>,
    ended: watch::Sender<bool>,
}

/// Handle to a live media track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track with a fresh random id
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(TRACK_CHANNEL_CAPACITY);
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                tx,
                ended,
            }),
        }
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

    /// Publish a frame; ignored once the track has ended
    pub fn push(&self, frame: MediaFrame) {
        if self.is_ended() {
            return;
        }
        let _ = self.inner.tx.send(frame);
    }

    pub fn push_audio(&self, samples: Vec<f32>) {
        self.push(MediaFrame::Audio(AudioFrame::new(samples, SAMPLE_RATE)));
    }

    /// Subscribe to frames from now on
    pub fn reader(&self) -> TrackReader {
        TrackReader {
            rx: self.inner.tx.subscribe(),
            ended: self.inner.ended.subscribe(),
        }
    }

    /// End the track. Returns `true` only for the call that ended it.
    pub fn stop(&self) -> bool {
        self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Identity comparison (same underlying track)
    pub fn same_as(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Frame subscription that finishes when the track ends
pub struct TrackReader {
    rx: broadcast::Receiver<MediaFrame>,
    ended: watch::Receiver<bool>,
}

impl TrackReader {
    /// Next frame, or `None` once the track has ended.
    /// Frames lost to lag are skipped.
    pub async fn next(&mut self) -> Option<MediaFrame> {
        loop {
            if *self.ended.borrow() {
                return None;
            }
            tokio::select! {
                frame = self.rx.recv() => match frame {
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                changed = self.ended.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Next audio frame, skipping anything else
    pub async fn next_audio(&mut self) -> Option<AudioFrame> {
        loop {
            match self.next().await? {
                MediaFrame::Audio(frame) => return Some(frame),
                MediaFrame::Video(_) => continue,
            }
        }
    }
}

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
}

/// A group of tracks sharing one stream id
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn first_audio(&self) -> Option<MediaTrack> {
        self.audio_tracks().into_iter().next()
    }

    pub fn has_video(&self) -> bool {
        self.inner
            .tracks
            .read()
            .iter()
            .any(|t| t.kind() == TrackKind::Video)
    }

    pub fn track(&self, id: &str) -> Option<MediaTrack> {
        self.inner.tracks.read().iter().find(|t| t.id() == id).cloned()
    }

    /// Add a track unless one with the same id is already present
    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.inner.tracks.write();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn remove_track(&self, id: &str) -> Option<MediaTrack> {
        let mut tracks = self.inner.tracks.write();
        let pos = tracks.iter().position(|t| t.id() == id)?;
        Some(tracks.remove(pos))
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in self.inner.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn same_as(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}
