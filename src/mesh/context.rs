//! State shared by everything running inside one voice session

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::output::AudioOutputState;
use super::state::StateHandle;
use crate::audio::{AudioEngine, RemotePlayback};
use crate::config::{MeshConfig, VadConfig};
use crate::events::{EventBus, VoiceEvent};
use crate::ice::IceServer;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{PresenceChannel, SignalingChannel, SignalingMessage};
use crate::webrtc::TransportFactory;

pub struct SessionContext {
    pub local_uid: String,
    pub group_id: String,
    pub channel_id: String,
    pub mesh: MeshConfig,
    pub vad: VadConfig,
    active: AtomicBool,
    /// Cancelled when the session stops; parent of every session task
    pub cancel: CancellationToken,
    pub signaling: Arc<dyn SignalingChannel>,
    pub presence: Arc<dyn PresenceChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub ice_servers: Vec<IceServer>,
    pub engine: Arc<AudioEngine>,
    pub playback: RemotePlayback,
    pub events: Arc<EventBus>,
    pub state: StateHandle,
    pub output: Arc<Mutex<AudioOutputState>>,
    local_stream: Mutex<Option<MediaStream>>,
    screen_stream: Mutex<Option<MediaStream>>,
    present: Mutex<HashSet<String>>,
}

/// Everything needed to build a [`SessionContext`]
pub struct ContextParts {
    pub local_uid: String,
    pub group_id: String,
    pub channel_id: String,
    pub mesh: MeshConfig,
    pub vad: VadConfig,
    pub signaling: Arc<dyn SignalingChannel>,
    pub presence: Arc<dyn PresenceChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub ice_servers: Vec<IceServer>,
    pub engine: Arc<AudioEngine>,
    pub playback: RemotePlayback,
    pub events: Arc<EventBus>,
    pub state: StateHandle,
    pub output: Arc<Mutex<AudioOutputState>>,
}

impl SessionContext {
    pub fn new(parts: ContextParts, local_stream: MediaStream) -> Arc<Self> {
        let cancel = parts.engine.child_token();
        Arc::new(Self {
            local_uid: parts.local_uid,
            group_id: parts.group_id,
            channel_id: parts.channel_id,
            mesh: parts.mesh,
            vad: parts.vad,
            active: AtomicBool::new(true),
            cancel,
            signaling: parts.signaling,
            presence: parts.presence,
            transports: parts.transports,
            ice_servers: parts.ice_servers,
            engine: parts.engine,
            playback: parts.playback,
            events: parts.events,
            state: parts.state,
            output: parts.output,
            local_stream: Mutex::new(Some(local_stream)),
            screen_stream: Mutex::new(None),
            present: Mutex::new(HashSet::new()),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Flip the active flag off; true for the caller that flipped it
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Stream peers hear (current pipeline output)
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.lock().clone()
    }

    pub fn local_audio_track(&self) -> Option<MediaTrack> {
        self.local_stream.lock().as_ref().and_then(|s| s.first_audio())
    }

    pub fn set_local_stream(&self, stream: Option<MediaStream>) {
        *self.local_stream.lock() = stream;
    }

    pub fn screen_stream(&self) -> Option<MediaStream> {
        self.screen_stream.lock().clone()
    }

    pub fn set_screen_stream(&self, stream: Option<MediaStream>) -> Option<MediaStream> {
        std::mem::replace(&mut *self.screen_stream.lock(), stream)
    }

    pub fn is_present(&self, uid: &str) -> bool {
        self.present.lock().contains(uid)
    }

    pub fn set_present(&self, uids: HashSet<String>) {
        *self.present.lock() = uids;
    }

    pub fn publish(&self, event: VoiceEvent) {
        self.events.publish(event);
    }

    /// Write a signaling message; dropped once the session is inactive
    pub async fn send(&self, message: SignalingMessage) {
        if !self.is_active() {
            return;
        }
        let kind = message.kind();
        let result = match message.to_document() {
            Ok(body) => self.signaling.add(body).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to send {} signal: {}", kind, e);
        }
    }
}
