//! Speech activity detection and noise gate control
//!
//! A detector samples an analyser once per animation frame, averages the
//! byte spectrum over the speech band and runs an asymmetric hysteresis:
//! a few loud frames to open, a longer run of quiet frames to close. When a
//! gate is attached the detector drives it (fast attack, slow release).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::engine::AudioEngine;
use super::nodes::{AnalyserNode, GainNode};
use crate::config::VadConfig;
use crate::media::MediaStream;

/// Live threshold source, read every frame
pub type ThresholdFn = Arc<dyn Fn() -> f32 + Send + Sync>;

/// Speaking transition callback
pub type SpeakingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// What the detector listens to
pub enum DetectorInput {
    /// An analyser already wired into a pipeline
    Analyser(AnalyserNode),
    /// A stream; the detector creates and feeds its own analyser
    Stream(MediaStream),
}

/// Optional detector wiring
#[derive(Clone, Default)]
pub struct DetectorOptions {
    pub gate: Option<GainNode>,
    pub threshold: Option<ThresholdFn>,
}

/// Hysteresis state machine
#[derive(Debug, Clone)]
pub struct SpeechState {
    speaking: bool,
    onset_frames: u32,
    silence_frames: u32,
    onset_delay: u32,
    silence_delay: u32,
}

impl SpeechState {
    pub fn new(onset_delay: u32, silence_delay: u32) -> Self {
        Self {
            speaking: false,
            onset_frames: 0,
            silence_frames: 0,
            onset_delay,
            silence_delay,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one frame's band level; returns the new state on a transition
    pub fn update(&mut self, level: f32, threshold: f32) -> Option<bool> {
        if level > threshold {
            self.silence_frames = 0;
            self.onset_frames += 1;
            if !self.speaking && self.onset_frames >= self.onset_delay {
                self.speaking = true;
                return Some(true);
            }
        } else {
            self.onset_frames = 0;
            self.silence_frames += 1;
            if self.speaking && self.silence_frames >= self.silence_delay {
                self.speaking = false;
                return Some(false);
            }
        }
        None
    }
}

/// Average byte level across the band `[low, high)` Hz
pub fn band_level(data: &[u8], bin_width: f32, low_hz: f32, high_hz: f32) -> f32 {
    let start = (low_hz / bin_width).floor() as usize;
    let end = (high_hz / bin_width).floor() as usize;
    if end <= start {
        return 0.0;
    }
    let sum: u32 = data
        .iter()
        .take(end)
        .skip(start)
        .map(|&v| v as u32)
        .sum();
    sum as f32 / (end - start) as f32
}

/// Handle returned by [`SpeechDetector::attach`]
pub struct DetectorHandle {
    cancel: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DetectorHandle {
    /// Stop the detector and release its analyser feed. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speech activity detector factory
pub struct SpeechDetector;

impl SpeechDetector {
    /// Start detecting on `input`, reporting transitions to `on_change`
    pub fn attach(
        engine: &Arc<AudioEngine>,
        input: DetectorInput,
        on_change: SpeakingCallback,
        options: DetectorOptions,
        config: &VadConfig,
    ) -> DetectorHandle {
        let cancel = engine.child_token();
        let mut tasks = Vec::new();

        let analyser = match input {
            DetectorInput::Analyser(analyser) => analyser,
            DetectorInput::Stream(stream) => {
                let analyser = AnalyserNode::new(
                    config.fft_size,
                    config.smoothing_time_constant,
                    engine.sample_rate(),
                );
                if let Some(track) = stream.first_audio() {
                    let feed = analyser.clone();
                    let mut reader = track.reader();
                    let cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        loop {
                            let frame = tokio::select! {
                                _ = cancel.cancelled() => break,
                                frame = reader.next_audio() => frame,
                            };
                            match frame {
                                Some(frame) => feed.push_samples(&frame.samples),
                                None => break,
                            }
                        }
                    }));
                }
                analyser
            }
        };

        let onset_delay = if options.gate.is_some() {
            config.gated_onset_frames
        } else {
            0
        };
        let mut state = SpeechState::new(onset_delay, config.silence_frames);
        let interval = Duration::from_millis(config.frame_interval_ms.max(1));
        let attack = Duration::from_millis(config.gate_attack_ms);
        let release = Duration::from_millis(config.gate_release_ms);
        let (low, high) = (config.band_low_hz, config.band_high_hz);
        let default_threshold = config.default_threshold;
        let engine = engine.clone();
        let loop_cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            let mut data = vec![0u8; analyser.frequency_bin_count()];
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if engine.is_closed() {
                    break;
                }

                analyser.get_byte_frequency_data(&mut data);
                let level = band_level(&data, analyser.bin_width(), low, high);
                let threshold = options
                    .threshold
                    .as_ref()
                    .map(|f| f())
                    .unwrap_or(default_threshold);

                if let Some(speaking) = state.update(level, threshold) {
                    trace!("Speech {} (level {:.1}, threshold {:.1})",
                        if speaking { "onset" } else { "offset" }, level, threshold);
                    on_change(speaking);
                    if let Some(gate) = options.gate.as_ref() {
                        if speaking {
                            gate.linear_ramp_to(1.0, attack);
                        } else {
                            gate.linear_ramp_to(0.0, release);
                        }
                    }
                }
            }
        }));

        DetectorHandle {
            cancel,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }
    }
}
