//! Audio graph for the voice mesh
//!
//! This module provides:
//! - The audio engine (shared clock, noise model, lifetime)
//! - Gain and analyser nodes
//! - Neural noise suppression
//! - The local microphone pipeline
//! - Speech activity detection
//! - Mixing, remote playback and the Opus codec used on the wire

pub mod codec;
pub mod denoise;
pub mod engine;
pub mod mixer;
pub mod nodes;
pub mod pipeline;
pub mod playback;
pub mod vad;

pub use codec::{OpusDecoder, OpusEncoder, OpusPacket, OPUS_FRAME_SAMPLES};
pub use engine::{AudioEngine, EngineState, NoiseModelSource};
pub use mixer::MixBus;
pub use nodes::{AnalyserNode, GainNode};
pub use pipeline::{AudioPipeline, PipelineDestination, PipelineOptions};
pub use playback::RemotePlayback;
pub use vad::{
    DetectorHandle, DetectorInput, DetectorOptions, SpeakingCallback, SpeechDetector,
    ThresholdFn,
};
