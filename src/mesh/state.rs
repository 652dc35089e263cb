//! Reactive voice state exposed to the UI layer

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use crate::media::{DeviceInfo, MediaStream, MediaTrack, TrackKind};
use crate::signaling::PresenceEntry;
use crate::webrtc::ConnectionState;

/// Remote streams per peer; mic audio and screen video never share a map
#[derive(Debug, Clone, Default)]
pub struct RemoteStreamSet {
    pub audio: HashMap<String, MediaStream>,
    pub video: HashMap<String, MediaStream>,
}

/// How an incoming remote track is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackClass {
    MicAudio,
    ScreenAudio,
    ScreenVideo,
}

impl RemoteStreamSet {
    /// Audio is screen audio iff its stream also carries video
    pub fn classify(track: &MediaTrack, stream: &MediaStream) -> TrackClass {
        match track.kind() {
            TrackKind::Video => TrackClass::ScreenVideo,
            TrackKind::Audio if stream.has_video() => TrackClass::ScreenAudio,
            TrackKind::Audio => TrackClass::MicAudio,
        }
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.audio.remove(peer_id);
        self.video.remove(peer_id);
    }
}

/// Snapshot of everything the UI renders
#[derive(Debug, Clone, Default)]
pub struct VoiceState {
    pub in_voice: bool,
    pub group_id: Option<String>,
    pub channel_id: Option<String>,
    /// Live presence entries for the channel
    pub voice_users: Vec<PresenceEntry>,
    pub peers: HashMap<String, ConnectionState>,
    pub streams: RemoteStreamSet,
    pub speaking: HashSet<String>,
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
    pub input_devices: Vec<DeviceInfo>,
    pub output_devices: Vec<DeviceInfo>,
    pub selected_input: Option<String>,
    pub selected_output: Option<String>,
    pub vad_threshold: f32,
    pub user_volumes: HashMap<String, f32>,
    /// Last user-visible error
    pub error: Option<String>,
}

impl VoiceState {
    pub fn is_speaking(&self, uid: &str) -> bool {
        self.speaking.contains(uid)
    }
}

/// Shared writer for the voice state
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<VoiceState>>,
}

impl StateHandle {
    pub fn new(initial: VoiceState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn update(&self, f: impl FnOnce(&mut VoiceState)) {
        self.tx.send_modify(f);
    }

    /// Apply `f`; watchers are notified only when it returns true
    pub fn update_if(&self, f: impl FnOnce(&mut VoiceState) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn snapshot(&self) -> VoiceState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceState> {
        self.tx.subscribe()
    }

    /// Record a speaking flag; true only when it actually changed
    pub fn set_speaking(&self, uid: &str, speaking: bool) -> bool {
        self.tx.send_if_modified(|state| {
            if speaking {
                state.speaking.insert(uid.to_string())
            } else {
                state.speaking.remove(uid)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_screen_audio() {
        let screen_audio = MediaTrack::new(TrackKind::Audio, "system audio");
        let screen_video = MediaTrack::new(TrackKind::Video, "screen");
        let screen = MediaStream::new(vec![screen_audio.clone(), screen_video.clone()]);
        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        let mic_stream = MediaStream::new(vec![mic.clone()]);

        assert_eq!(
            RemoteStreamSet::classify(&screen_audio, &screen),
            TrackClass::ScreenAudio
        );
        assert_eq!(
            RemoteStreamSet::classify(&screen_video, &screen),
            TrackClass::ScreenVideo
        );
        assert_eq!(RemoteStreamSet::classify(&mic, &mic_stream), TrackClass::MicAudio);
    }

    #[test]
    fn test_speaking_dedup() {
        let state = StateHandle::new(VoiceState::default());
        let mut rx = state.subscribe();
        assert!(state.set_speaking("u1", true));
        assert!(!state.set_speaking("u1", true));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!state.set_speaking("u2", false));
        assert!(!rx.has_changed().unwrap());
        assert!(state.snapshot().is_speaking("u1"));
    }
}
