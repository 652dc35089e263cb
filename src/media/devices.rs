//! Media device access
//!
//! `MediaDevices` is the host capability for microphones, screen capture
//! and output routing. `SyntheticDevices` is a virtual backend that
//! generates test signals; it drives the diagnostics binary and the tests.

use std::collections::HashSet;
use std::f32::consts::PI;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::track::{MediaFrame, MediaStream, MediaTrack, TrackKind, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{AppError, Result};

/// Device kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
}

/// Enumerated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

/// Microphone request
#[derive(Debug, Clone)]
pub struct AudioConstraints {
    /// Exact device id; `None` selects the system default
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u16,
    pub sample_rate: u32,
}

impl AudioConstraints {
    /// Voice capture settings: the pipeline does its own noise suppression
    pub fn voice(device_id: Option<String>) -> Self {
        Self {
            device_id,
            echo_cancellation: true,
            noise_suppression: false,
            auto_gain_control: true,
            channel_count: 1,
            sample_rate: SAMPLE_RATE,
        }
    }
}

/// Host media capability
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open a microphone
    async fn get_user_media(&self, constraints: &AudioConstraints) -> Result<MediaStream>;

    /// Start a screen capture (video plus optional system audio)
    async fn get_display_media(&self, with_audio: bool) -> Result<MediaStream>;

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Route the remote playback mix to an output device (`None` = default)
    async fn set_output_device(&self, device_id: Option<&str>, playback: &MediaTrack)
        -> Result<()>;
}

/// Signal produced by a synthetic input
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Silence,
    Tone { frequency: f32, amplitude: f32 },
    Noise { amplitude: f32 },
}

#[derive(Debug, Clone)]
struct SyntheticInput {
    info: DeviceInfo,
    signal: Signal,
}

#[derive(Default)]
struct SyntheticState {
    denied: Option<String>,
    broken: HashSet<String>,
    requests: Vec<Option<String>>,
    output: Option<(Option<String>, MediaTrack)>,
    display_tracks: Vec<MediaTrack>,
}

/// Virtual device backend
pub struct SyntheticDevices {
    inputs: Vec<SyntheticInput>,
    outputs: Vec<DeviceInfo>,
    frame_interval: Duration,
    state: Mutex<SyntheticState>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            frame_interval: Duration::from_millis(10),
            state: Mutex::new(SyntheticState::default()),
        }
    }

    /// Single default microphone producing a tone plus a default output
    pub fn with_default_tone(frequency: f32) -> Self {
        Self::new()
            .with_input(
                "default",
                "Synthetic Microphone",
                Signal::Tone {
                    frequency,
                    amplitude: 0.3,
                },
            )
            .with_output("default", "Synthetic Speakers")
    }

    pub fn with_input(mut self, id: &str, label: &str, signal: Signal) -> Self {
        self.inputs.push(SyntheticInput {
            info: DeviceInfo {
                device_id: id.to_string(),
                label: label.to_string(),
                kind: DeviceKind::AudioInput,
            },
            signal,
        });
        self
    }

    pub fn with_output(mut self, id: &str, label: &str) -> Self {
        self.outputs.push(DeviceInfo {
            device_id: id.to_string(),
            label: label.to_string(),
            kind: DeviceKind::AudioOutput,
        });
        self
    }

    /// Reject every microphone request with the given reason
    pub fn deny_permission(&self, reason: Option<&str>) {
        self.state.lock().denied = reason.map(str::to_string);
    }

    /// Make a specific device fail to open
    pub fn break_device(&self, id: &str) {
        self.state.lock().broken.insert(id.to_string());
    }

    /// Device ids requested so far (`None` = default)
    pub fn requests(&self) -> Vec<Option<String>> {
        self.state.lock().requests.clone()
    }

    /// Output device currently routed
    pub fn current_output(&self) -> Option<Option<String>> {
        self.state.lock().output.as_ref().map(|(id, _)| id.clone())
    }

    /// Simulate the user ending the capture from the system UI
    pub fn end_display_capture(&self) {
        for track in self.state.lock().display_tracks.drain(..) {
            track.stop();
        }
    }

    fn spawn_audio(&self, track: MediaTrack, signal: Signal) {
        let interval = self.frame_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut phase = 0.0f32;
            loop {
                tokio::select! {
                    _ = track.ended() => break,
                    _ = ticker.tick() => {
                        track.push_audio(render(signal, &mut phase));
                    }
                }
            }
            debug!("Synthetic source {} stopped", track.label());
        });
    }

    fn spawn_video(&self, track: MediaTrack) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(33));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut counter: u32 = 0;
            loop {
                tokio::select! {
                    _ = track.ended() => break,
                    _ = ticker.tick() => {
                        counter = counter.wrapping_add(1);
                        track.push(MediaFrame::Video(Bytes::from(counter.to_be_bytes().to_vec())));
                    }
                }
            }
        });
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

fn render(signal: Signal, phase: &mut f32) -> Vec<f32> {
    match signal {
        Signal::Silence => vec![0.0; FRAME_SAMPLES],
        Signal::Tone {
            frequency,
            amplitude,
        } => {
            let step = 2.0 * PI * frequency / SAMPLE_RATE as f32;
            (0..FRAME_SAMPLES)
                .map(|_| {
                    let v = phase.sin() * amplitude;
                    *phase = (*phase + step) % (2.0 * PI);
                    v
                })
                .collect()
        }
        Signal::Noise { amplitude } => {
            let mut rng = rand::thread_rng();
            (0..FRAME_SAMPLES)
                .map(|_| rng.gen_range(-amplitude..=amplitude))
                .collect()
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: &AudioConstraints) -> Result<MediaStream> {
        let input = {
            let mut state = self.state.lock();
            state.requests.push(constraints.device_id.clone());

            if let Some(reason) = &state.denied {
                return Err(AppError::PermissionDenied(reason.clone()));
            }

            match &constraints.device_id {
                Some(id) => {
                    if state.broken.contains(id) {
                        return Err(AppError::DeviceUnavailable {
                            device: id.clone(),
                            reason: "OverconstrainedError".to_string(),
                        });
                    }
                    self.inputs
                        .iter()
                        .find(|i| &i.info.device_id == id)
                        .cloned()
                        .ok_or_else(|| AppError::DeviceUnavailable {
                            device: id.clone(),
                            reason: "NotFoundError".to_string(),
                        })?
                }
                None => self
                    .inputs
                    .iter()
                    .find(|i| !state.broken.contains(&i.info.device_id))
                    .cloned()
                    .ok_or_else(|| AppError::DeviceUnavailable {
                        device: "default".to_string(),
                        reason: "NotFoundError".to_string(),
                    })?,
            }
        };

        let track = MediaTrack::new(TrackKind::Audio, input.info.label.clone());
        self.spawn_audio(track.clone(), input.signal);
        info!("Synthetic mic opened: {} ({})", input.info.label, input.info.device_id);

        Ok(MediaStream::new(vec![track]))
    }

    async fn get_display_media(&self, with_audio: bool) -> Result<MediaStream> {
        let video = MediaTrack::new(TrackKind::Video, "Synthetic Screen");
        self.spawn_video(video.clone());
        let mut tracks = vec![video.clone()];

        if with_audio {
            let audio = MediaTrack::new(TrackKind::Audio, "Synthetic System Audio");
            self.spawn_audio(
                audio.clone(),
                Signal::Tone {
                    frequency: 220.0,
                    amplitude: 0.1,
                },
            );
            tracks.push(audio);
        }

        self.state.lock().display_tracks.push(video);
        Ok(MediaStream::new(tracks))
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .inputs
            .iter()
            .map(|i| i.info.clone())
            .chain(self.outputs.iter().cloned())
            .collect())
    }

    async fn set_output_device(
        &self,
        device_id: Option<&str>,
        playback: &MediaTrack,
    ) -> Result<()> {
        if let Some(id) = device_id {
            if !self.outputs.iter().any(|o| o.device_id == id) {
                return Err(AppError::DeviceUnavailable {
                    device: id.to_string(),
                    reason: "NotFoundError".to_string(),
                });
            }
        }
        self.state.lock().output = Some((device_id.map(str::to_string), playback.clone()));
        Ok(())
    }
}
