//! voice-mesh - full-mesh WebRTC voice engine
//!
//! This crate provides the voice channel engine: a denoised, speech-gated
//! audio pipeline, speech activity detection, ICE credential provisioning,
//! per-peer WebRTC connections negotiated over a shared signaling channel,
//! and a bridge that lets a voice agent listen and speak in the call.

pub mod agent;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod ice;
pub mod media;
pub mod mesh;
pub mod signaling;
pub mod utils;
pub mod webrtc;

pub use error::{AppError, Result};
pub use mesh::{Identity, VoiceClient, VoiceServices};
