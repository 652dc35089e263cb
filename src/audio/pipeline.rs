//! Local microphone pipeline
//!
//! ```text
//! mic ──> denoise ──┬──> analyser (speech detection)
//!                   └──> gate ──┬──> gate tap
//!                               └──> mute ──┬──> capture  (mic only)
//!                                           └──(+ agent)──> output (transport)
//! ```
//!
//! `gate` belongs to the speech detector and `mute_gain` belongs to the
//! user's mute/deafen state. They are separate stages so the voice agent can
//! keep broadcasting through the output while the human is muted.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::denoise::Denoiser;
use super::engine::{AudioEngine, NoiseModelSource};
use super::nodes::{AnalyserNode, GainNode};
use crate::config::AudioConfig;
use crate::error::{AppError, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind, TrackReader};

/// Bound on queued agent audio (1 s)
const DESTINATION_CAPACITY: usize = 48_000;

/// Pipeline construction options
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub noise_suppression: bool,
    pub noise_model: NoiseModelSource,
    pub fft_size: usize,
    pub smoothing: f32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            noise_suppression: true,
            noise_model: NoiseModelSource::Builtin,
            fft_size: 512,
            smoothing: 0.4,
        }
    }
}

impl From<&AudioConfig> for PipelineOptions {
    fn from(config: &AudioConfig) -> Self {
        Self {
            noise_suppression: config.noise_suppression,
            noise_model: NoiseModelSource::Builtin,
            fft_size: config.vad.fft_size,
            smoothing: config.vad.smoothing_time_constant,
        }
    }
}

/// Mix-in point on the transport output
///
/// Audio written here is heard by every peer but never reaches the
/// capture stream.
#[derive(Clone)]
pub struct PipelineDestination {
    queue: Arc<Mutex<VecDeque<f32>>>,
    output: MediaTrack,
}

impl PipelineDestination {
    fn new(output: MediaTrack) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            output,
        }
    }

    /// Queue samples for the outgoing mix
    pub fn write(&self, samples: &[f32]) {
        let mut queue = self.queue.lock();
        queue.extend(samples.iter().copied());
        while queue.len() > DESTINATION_CAPACITY {
            queue.pop_front();
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Output track the destination mixes into
    pub fn track_id(&self) -> &str {
        self.output.id()
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_ended()
    }

    fn mix_into(&self, block: &mut [f32]) {
        let mut queue = self.queue.lock();
        for s in block.iter_mut() {
            match queue.pop_front() {
                Some(v) => *s = (*s + v).clamp(-1.0, 1.0),
                None => break,
            }
        }
    }
}

/// Built pipeline
pub struct AudioPipeline {
    /// What peers hear (mic plus agent)
    pub output_stream: MediaStream,
    /// Mic only, after mute
    pub capture_stream: MediaStream,
    /// Speech-gated signal before mute
    pub gate_output: MediaTrack,
    pub gate: GainNode,
    pub mute_gain: GainNode,
    pub analyser: AnalyserNode,
    pub destination: PipelineDestination,
    cancel: CancellationToken,
}

impl AudioPipeline {
    /// Build the graph on `engine` from a raw microphone stream
    pub async fn build(
        engine: &Arc<AudioEngine>,
        raw: &MediaStream,
        options: &PipelineOptions,
    ) -> Result<Self> {
        if engine.is_closed() {
            return Err(AppError::Audio("audio engine is closed".to_string()));
        }
        let mic = raw
            .first_audio()
            .ok_or_else(|| AppError::Audio("raw stream has no audio track".to_string()))?;

        let denoiser = if options.noise_suppression {
            let model = engine.ensure_noise_model(&options.noise_model).await?;
            Some(Denoiser::new(&model))
        } else {
            None
        };

        let analyser = AnalyserNode::new(options.fft_size, options.smoothing, engine.sample_rate());
        let gate = GainNode::new(1.0);
        let mute_gain = GainNode::new(1.0);

        let output = MediaTrack::new(TrackKind::Audio, "voice-output");
        let capture = MediaTrack::new(TrackKind::Audio, "voice-capture");
        let gate_output = MediaTrack::new(TrackKind::Audio, "voice-gate");
        let destination = PipelineDestination::new(output.clone());
        let cancel = engine.child_token();

        let task = ProcessingTask {
            reader: mic.reader(),
            label: mic.label().to_string(),
            denoiser,
            analyser: analyser.clone(),
            gate: gate.clone(),
            mute_gain: mute_gain.clone(),
            gate_output: gate_output.clone(),
            capture: capture.clone(),
            output: output.clone(),
            destination: destination.clone(),
            sample_rate: engine.sample_rate(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        info!(
            "Audio pipeline built: mic -> {}gate -> mute -> output + capture",
            if options.noise_suppression { "denoise -> " } else { "" }
        );

        Ok(Self {
            output_stream: MediaStream::new(vec![output]),
            capture_stream: MediaStream::new(vec![capture]),
            gate_output,
            gate,
            mute_gain,
            analyser,
            destination,
            cancel,
        })
    }

    /// Outgoing audio track for the transport
    pub fn output_track(&self) -> Option<MediaTrack> {
        self.output_stream.first_audio()
    }

    /// Apply the user's mute state to the mute stage
    pub fn set_muted(&self, muted: bool) {
        self.mute_gain.set_value(if muted { 0.0 } else { 1.0 });
    }

    /// Stop processing and end every output track. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.output_stream.stop_all();
        self.capture_stream.stop_all();
        self.gate_output.stop();
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ProcessingTask {
    reader: TrackReader,
    label: String,
    denoiser: Option<Denoiser>,
    analyser: AnalyserNode,
    gate: GainNode,
    mute_gain: GainNode,
    gate_output: MediaTrack,
    capture: MediaTrack,
    output: MediaTrack,
    destination: PipelineDestination,
    sample_rate: u32,
    cancel: CancellationToken,
}

impl ProcessingTask {
    async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = self.reader.next_audio() => frame,
            };
            let Some(frame) = frame else {
                debug!("Pipeline input {} ended", self.label);
                break;
            };

            let start = Instant::now();
            let mut block = frame.samples.to_vec();

            if let Some(denoiser) = self.denoiser.as_mut() {
                denoiser.process(&mut block);
            }
            self.analyser.push_samples(&block);

            self.gate.process(&mut block, start, self.sample_rate);
            self.gate_output.push_audio(block.clone());

            self.mute_gain.process(&mut block, start, self.sample_rate);
            self.capture.push_audio(block.clone());

            self.destination.mix_into(&mut block);
            self.output.push_audio(block);
        }

        self.output.stop();
        self.capture.stop();
        self.gate_output.stop();
    }
}
