//! Mix bus: sums any number of audio tracks into one output track
//!
//! Each source is drained by a feeder task into its own queue; a clock task
//! pulls one frame per source every 10 ms, applies per-source and master
//! gain, and pushes the sum to the output track.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::AudioEngine;
use crate::media::{MediaTrack, TrackKind, FRAME_SAMPLES};

/// Queue bound per source (100 ms); older audio is dropped first
const MAX_QUEUED: usize = FRAME_SAMPLES * 10;

struct MixSource {
    track_id: String,
    gain: f32,
    queue: VecDeque<f32>,
    cancel: CancellationToken,
}

struct MixInner {
    name: String,
    sources: Mutex<HashMap<String, MixSource>>,
    master: Mutex<f32>,
    output: MediaTrack,
    cancel: CancellationToken,
}

/// Audio mix bus
#[derive(Clone)]
pub struct MixBus {
    inner: Arc<MixInner>,
}

impl MixBus {
    /// Create the bus and start its clock on the engine
    pub fn start(name: &str, engine: &AudioEngine) -> Self {
        let inner = Arc::new(MixInner {
            name: name.to_string(),
            sources: Mutex::new(HashMap::new()),
            master: Mutex::new(1.0),
            output: MediaTrack::new(TrackKind::Audio, name),
            cancel: engine.child_token(),
        });

        let clock = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = clock.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = clock.mix_frame();
                        clock.output.push_audio(frame);
                    }
                }
            }
            clock.output.stop();
            debug!("Mix bus {} stopped", clock.name);
        });

        Self { inner }
    }

    /// Output track carrying the mix
    pub fn output(&self) -> MediaTrack {
        self.inner.output.clone()
    }

    /// Add or replace the source registered under `id`
    pub fn add_source(&self, id: &str, track: &MediaTrack, gain: f32) {
        let cancel = self.inner.cancel.child_token();
        {
            let mut sources = self.inner.sources.lock();
            if let Some(old) = sources.insert(
                id.to_string(),
                MixSource {
                    track_id: track.id().to_string(),
                    gain,
                    queue: VecDeque::with_capacity(MAX_QUEUED),
                    cancel: cancel.clone(),
                },
            ) {
                old.cancel.cancel();
            }
        }

        let inner = self.inner.clone();
        let id = id.to_string();
        let mut reader = track.reader();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = reader.next_audio() => frame,
                };
                let Some(frame) = frame else { break };
                let mut sources = inner.sources.lock();
                let Some(source) = sources.get_mut(&id) else { break };
                source.queue.extend(frame.samples.iter().copied());
                while source.queue.len() > MAX_QUEUED {
                    source.queue.pop_front();
                }
            }
        });
    }

    pub fn remove_source(&self, id: &str) {
        if let Some(source) = self.inner.sources.lock().remove(id) {
            source.cancel.cancel();
        }
    }

    pub fn has_source(&self, id: &str) -> bool {
        self.inner.sources.lock().contains_key(id)
    }

    /// Track id currently feeding a source
    pub fn source_track(&self, id: &str) -> Option<String> {
        self.inner.sources.lock().get(id).map(|s| s.track_id.clone())
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inner.sources.lock().keys().cloned().collect()
    }

    pub fn set_gain(&self, id: &str, gain: f32) {
        if let Some(source) = self.inner.sources.lock().get_mut(id) {
            source.gain = gain;
        }
    }

    pub fn set_master(&self, gain: f32) {
        *self.inner.master.lock() = gain;
    }

    pub fn master(&self) -> f32 {
        *self.inner.master.lock()
    }

    /// Stop the clock and every feeder. Idempotent.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.sources.lock().clear();
    }
}

impl MixInner {
    fn mix_frame(&self) -> Vec<f32> {
        let mut frame = vec![0.0f32; FRAME_SAMPLES];
        let master = *self.master.lock();
        let mut sources = self.sources.lock();
        for source in sources.values_mut() {
            let gain = source.gain * master;
            for slot in frame.iter_mut() {
                match source.queue.pop_front() {
                    Some(s) => *slot += s * gain,
                    None => break,
                }
            }
        }
        frame.iter_mut().for_each(|s| *s = s.clamp(-1.0, 1.0));
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_non_silent(reader: &mut crate::media::TrackReader) -> Vec<f32> {
        loop {
            let frame = reader.next_audio().await.unwrap();
            if frame.samples.iter().any(|s| *s != 0.0) {
                return frame.samples.to_vec();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mix_applies_gains() {
        let engine = AudioEngine::new(48000);
        let bus = MixBus::start("test", &engine);
        let mut out = bus.output().reader();

        let a = MediaTrack::new(TrackKind::Audio, "a");
        bus.add_source("a", &a, 0.5);
        tokio::task::yield_now().await;
        a.push_audio(vec![0.4; FRAME_SAMPLES]);

        let frame = next_non_silent(&mut out).await;
        assert!((frame[0] - 0.2).abs() < 1e-6);

        bus.set_master(0.0);
        a.push_audio(vec![0.4; FRAME_SAMPLES]);
        let frame = out.next_audio().await.unwrap();
        assert!(frame.samples.iter().all(|s| *s == 0.0));

        engine.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_and_remove_source() {
        let engine = AudioEngine::new(48000);
        let bus = MixBus::start("test", &engine);

        let first = MediaTrack::new(TrackKind::Audio, "first");
        let second = MediaTrack::new(TrackKind::Audio, "second");
        bus.add_source("peer", &first, 1.0);
        bus.add_source("peer", &second, 1.0);
        assert_eq!(bus.source_track("peer").as_deref(), Some(second.id()));
        assert_eq!(bus.source_ids().len(), 1);

        bus.remove_source("peer");
        assert!(!bus.has_source("peer"));

        bus.stop();
        bus.output().ended().await;
    }
}
