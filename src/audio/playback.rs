//! Remote audio playback
//!
//! Every remote mic stream is mixed into one playback track at the peer's
//! stored volume. Deafen silences the whole mix.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::engine::AudioEngine;
use super::mixer::MixBus;
use crate::media::{MediaStream, MediaTrack};
use crate::utils::short_id;

pub struct RemotePlayback {
    bus: MixBus,
    volumes: Mutex<HashMap<String, f32>>,
}

impl RemotePlayback {
    pub fn start(engine: &AudioEngine, volumes: HashMap<String, f32>, deafened: bool) -> Self {
        let bus = MixBus::start("remote-playback", engine);
        bus.set_master(if deafened { 0.0 } else { 1.0 });
        Self {
            bus,
            volumes: Mutex::new(volumes),
        }
    }

    /// Track to route to the output device
    pub fn output(&self) -> MediaTrack {
        self.bus.output()
    }

    /// Play (or replace) a peer's mic stream
    pub fn attach(&self, peer_id: &str, stream: &MediaStream) {
        let Some(track) = stream.first_audio() else {
            return;
        };
        if self.bus.source_track(peer_id).as_deref() == Some(track.id()) {
            return;
        }
        let volume = self.volume(peer_id);
        self.bus.add_source(peer_id, &track, volume);
        debug!("Playback attached for {} at volume {:.2}", short_id(peer_id), volume);
    }

    pub fn detach(&self, peer_id: &str) {
        self.bus.remove_source(peer_id);
    }

    /// Set a peer's volume, clamped to 0..1; returns the applied value
    pub fn set_volume(&self, peer_id: &str, volume: f32) -> f32 {
        let volume = volume.clamp(0.0, 1.0);
        self.volumes.lock().insert(peer_id.to_string(), volume);
        self.bus.set_gain(peer_id, volume);
        volume
    }

    pub fn volume(&self, peer_id: &str) -> f32 {
        self.volumes.lock().get(peer_id).copied().unwrap_or(1.0)
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.bus.set_master(if deafened { 0.0 } else { 1.0 });
    }

    pub fn is_deafened(&self) -> bool {
        self.bus.master() == 0.0
    }

    pub fn stop(&self) {
        self.bus.stop();
    }
}
