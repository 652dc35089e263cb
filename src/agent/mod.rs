//! Voice agent bridge
//!
//! A synthetic participant is not meshed. It hears a mix of the local
//! capture stream and every remote mic stream, and what it says is written
//! into the pipeline destination so every peer hears it, even while the
//! local human is muted.
//!
//! The bridge only sees the session through [`PipelineAccess`]; it never
//! creates an audio engine of its own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioEngine, MixBus, PipelineDestination};
use crate::error::{AppError, Result};
use crate::events::{RemoteStreamKind, VoiceEvent};
use crate::media::{MediaStream, MediaTrack, TrackReader};
use crate::mesh::{BeforeStopHook, VoiceState};

/// Mix source id of the local capture stream
const CAPTURE_SOURCE: &str = "local";

/// Narrow view of a running voice session
pub trait PipelineAccess: Send + Sync {
    fn audio_engine(&self) -> Option<Arc<AudioEngine>>;

    fn pipeline_destination(&self) -> Option<PipelineDestination>;

    /// Mic-only stream, never containing agent audio
    fn capture_stream(&self) -> Option<MediaStream>;

    /// Register (or clear) the callback run before voice teardown
    fn register_before_stop_hook(&self, hook: Option<BeforeStopHook>);

    fn voice_state(&self) -> watch::Receiver<VoiceState>;

    fn voice_events(&self) -> broadcast::Receiver<VoiceEvent>;
}

/// Convert float samples to little-endian PCM16
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Convert little-endian PCM16 to float samples; a trailing odd byte is ignored
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Base64 PCM16 chunk as exchanged with the agent service
pub fn encode_chunk(samples: &[f32]) -> String {
    STANDARD.encode(float_to_pcm16(samples))
}

pub fn decode_chunk(chunk: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD
        .decode(chunk.trim())
        .map_err(|e| AppError::Audio(format!("Invalid agent audio chunk: {}", e)))?;
    Ok(pcm16_to_float(&bytes))
}

struct MixerInner {
    access: Arc<dyn PipelineAccess>,
    bus: MixBus,
    destination: Mutex<Option<PipelineDestination>>,
    remotes: Mutex<HashSet<String>>,
    detached: AtomicBool,
    cancel: CancellationToken,
}

impl MixerInner {
    fn sync_capture(&self) {
        match self.access.capture_stream().and_then(|s| s.first_audio()) {
            Some(track) => {
                if self.bus.source_track(CAPTURE_SOURCE).as_deref() != Some(track.id()) {
                    self.bus.add_source(CAPTURE_SOURCE, &track, 1.0);
                    debug!("Agent mixer capture source -> {}", track.id());
                }
            }
            None => self.bus.remove_source(CAPTURE_SOURCE),
        }
        *self.destination.lock() = self.access.pipeline_destination();
    }

    fn sync_remotes(&self, state: &VoiceState) {
        let mut remotes = self.remotes.lock();
        for (peer_id, stream) in &state.streams.audio {
            let Some(track) = stream.first_audio() else {
                continue;
            };
            let source = format!("peer:{}", peer_id);
            if self.bus.source_track(&source).as_deref() != Some(track.id()) {
                self.bus.add_source(&source, &track, 1.0);
            }
            remotes.insert(peer_id.clone());
        }
        remotes.retain(|peer_id| {
            let keep = state.streams.audio.contains_key(peer_id);
            if !keep {
                self.bus.remove_source(&format!("peer:{}", peer_id));
            }
            keep
        });
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.bus.stop();
        if let Some(destination) = self.destination.lock().take() {
            destination.clear();
        }
        info!("Voice agent detached");
    }
}

/// Audio bridge between a voice session and a voice agent
#[derive(Clone)]
pub struct AgentMixer {
    inner: Arc<MixerInner>,
}

impl AgentMixer {
    /// Attach to the running session behind `access`
    pub fn attach(access: Arc<dyn PipelineAccess>) -> Result<Self> {
        let engine = access.audio_engine().ok_or(AppError::NotActive)?;
        let inner = Arc::new(MixerInner {
            bus: MixBus::start("agent-input", &engine),
            access: access.clone(),
            destination: Mutex::new(None),
            remotes: Mutex::new(HashSet::new()),
            detached: AtomicBool::new(false),
            cancel: engine.child_token(),
        });

        let mut state = access.voice_state();
        let mut events = access.voice_events();
        inner.sync_capture();
        inner.sync_remotes(&state.borrow_and_update());

        let hook_target = inner.clone();
        access.register_before_stop_hook(Some(Box::new(move || hook_target.detach())));

        let task = inner.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task.cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(VoiceEvent::PipelineRebuilt) => task.sync_capture(),
                    Ok(VoiceEvent::RemoteStreamAdded {
                        kind: RemoteStreamKind::Mic,
                        ..
                    })
                    | Ok(VoiceEvent::PeerRemoved { .. }) => {
                        task.sync_remotes(&state.borrow_and_update());
                    }
                    Ok(VoiceEvent::VoiceStopped) => {
                        task.detach();
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Agent mixer lagged {} events, resyncing", n);
                        task.sync_capture();
                        task.sync_remotes(&state.borrow_and_update());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Agent mixer event loop exited");
        });

        info!("Voice agent attached");
        Ok(Self { inner })
    }

    /// Track carrying what the agent hears
    pub fn input(&self) -> MediaTrack {
        self.inner.bus.output()
    }

    pub fn input_reader(&self) -> TrackReader {
        self.inner.bus.output().reader()
    }

    /// Next 10 ms of agent input as a base64 PCM16 chunk
    pub async fn next_input_chunk(reader: &mut TrackReader) -> Option<String> {
        reader.next_audio().await.map(|frame| encode_chunk(&frame.samples))
    }

    /// Play agent speech to every peer; false once detached
    pub fn play(&self, samples: &[f32]) -> bool {
        if self.inner.detached.load(Ordering::SeqCst) {
            return false;
        }
        match self.inner.destination.lock().as_ref() {
            Some(destination) if !destination.is_closed() => {
                destination.write(samples);
                true
            }
            _ => false,
        }
    }

    pub fn play_chunk(&self, chunk: &str) -> Result<bool> {
        let samples = decode_chunk(chunk)?;
        Ok(self.play(&samples))
    }

    /// Drop queued agent speech (barge-in)
    pub fn interrupt(&self) {
        if let Some(destination) = self.inner.destination.lock().as_ref() {
            destination.clear();
        }
    }

    /// Mix sources currently feeding the agent
    pub fn sources(&self) -> Vec<String> {
        let mut ids = self.inner.bus.source_ids();
        ids.sort();
        ids
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.inner.access.register_before_stop_hook(None);
        self.inner.detach();
    }
}
