use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main voice engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VoiceConfig {
    /// ICE server resolution
    pub ice: IceConfig,
    /// Mesh timing and limits
    pub mesh: MeshConfig,
    /// Audio pipeline and speech detection
    pub audio: AudioConfig,
    /// Real transport settings
    pub transport: TransportConfig,
}

impl VoiceConfig {
    /// Reject values the audio graph cannot run with
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(AppError::Config("audio.sample_rate must be positive".to_string()));
        }
        let vad = &audio.vad;
        if !(32..=32768).contains(&vad.fft_size) || !vad.fft_size.is_power_of_two() {
            return Err(AppError::Config(format!(
                "audio.vad.fft_size must be a power of two in 32..=32768, got {}",
                vad.fft_size
            )));
        }
        if !(0.0..=1.0).contains(&vad.smoothing_time_constant) {
            return Err(AppError::Config(format!(
                "audio.vad.smoothing_time_constant must be in 0..=1, got {}",
                vad.smoothing_time_constant
            )));
        }
        if vad.band_low_hz >= vad.band_high_hz {
            return Err(AppError::Config(format!(
                "audio.vad speech band is empty ({}..{} Hz)",
                vad.band_low_hz, vad.band_high_hz
            )));
        }
        Ok(())
    }
}

/// ICE credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Public STUN servers, always included
    pub stun_servers: Vec<String>,
    /// TURN credential endpoint (None = STUN only)
    pub credential_endpoint: Option<String>,
    /// Bearer token sent to the credential endpoint
    pub credential_token: Option<String>,
    /// How long fetched TURN credentials are reused
    pub cache_ttl_ms: u64,
    /// Upper bound on a single credential fetch
    pub fetch_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            credential_endpoint: None,
            credential_token: None,
            cache_ttl_ms: 3_600_000,
            fetch_timeout_ms: 10_000,
        }
    }
}

/// Mesh connection management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Reconnect attempts before a peer is abandoned
    pub max_reconnect_attempts: u32,
    /// Reconnect delay per attempt (attempt * base)
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay ceiling
    pub reconnect_max_delay_ms: u64,
    /// Delay before renegotiating screen tracks on a new peer
    pub screen_renegotiation_delay_ms: u64,
    /// Presence entries older than this are garbage-collected
    pub presence_ttl_ms: i64,
    /// Identifier of the synthetic voice agent participant
    pub agent_uid: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 2000,
            reconnect_max_delay_ms: 10_000,
            screen_renegotiation_delay_ms: 500,
            presence_ttl_ms: 8 * 60 * 60 * 1000,
            agent_uid: "eve".to_string(),
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Engine sample rate in Hz
    pub sample_rate: u32,
    /// Enable the neural noise suppressor
    pub noise_suppression: bool,
    /// Opus bitrate in bps for the real transport
    pub opus_bitrate: i32,
    /// Speech detector settings
    pub vad: VadConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            noise_suppression: true,
            opus_bitrate: 64000,
            vad: VadConfig::default(),
        }
    }
}

/// Speech activity detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub fft_size: usize,
    pub smoothing_time_constant: f32,
    /// Lower edge of the speech band (Hz)
    pub band_low_hz: f32,
    /// Upper edge of the speech band (Hz)
    pub band_high_hz: f32,
    /// Threshold used when no threshold source is supplied
    pub default_threshold: f32,
    /// Consecutive loud frames before onset when a gate is attached
    pub gated_onset_frames: u32,
    /// Consecutive quiet frames before offset
    pub silence_frames: u32,
    /// Gate open ramp (ms)
    pub gate_attack_ms: u64,
    /// Gate close ramp (ms)
    pub gate_release_ms: u64,
    /// Detector tick interval (ms), one animation frame
    pub frame_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            smoothing_time_constant: 0.4,
            band_low_hz: 300.0,
            band_high_hz: 3400.0,
            default_threshold: 15.0,
            gated_onset_frames: 3,
            silence_frames: 15,
            gate_attack_ms: 5,
            gate_release_ms: 150,
            frame_interval_ms: 16,
        }
    }
}

/// Real (webrtc-rs) transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// mDNS mode: "disabled", "query_only" or "query_and_gather"
    pub mdns_mode: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mdns_mode: "query_only".to_string(),
        }
    }
}

/// Per-user preferences persisted across restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicePreferences {
    /// Preferred microphone device id
    pub selected_input: Option<String>,
    /// Preferred output device id
    pub selected_output: Option<String>,
    /// Playback volume per remote participant (0.0 - 1.0)
    pub user_volumes: HashMap<String, f32>,
    /// Speech detector threshold (byte-scale energy)
    pub vad_threshold: f32,
}

impl Default for VoicePreferences {
    fn default() -> Self {
        Self {
            selected_input: None,
            selected_output: None,
            user_volumes: HashMap::new(),
            vad_threshold: 20.0,
        }
    }
}

impl VoicePreferences {
    /// Stored volume for a peer, defaulting to full volume
    pub fn volume_for(&self, uid: &str) -> f32 {
        self.user_volumes.get(uid).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: VoiceConfig =
            serde_json::from_str(r#"{"mesh": {"max_reconnect_attempts": 5}}"#).unwrap();
        assert_eq!(config.mesh.max_reconnect_attempts, 5);
        assert_eq!(config.mesh.reconnect_base_delay_ms, 2000);
        assert_eq!(config.ice.cache_ttl_ms, 3_600_000);
        assert_eq!(config.ice.stun_servers.len(), 2);
        assert_eq!(config.audio.vad.fft_size, 512);
    }

    #[test]
    fn test_validate_rejects_unusable_audio() {
        assert!(VoiceConfig::default().validate().is_ok());

        let mut config = VoiceConfig::default();
        config.audio.sample_rate = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        for fft_size in [0, 16, 500, 65536] {
            let mut config = VoiceConfig::default();
            config.audio.vad.fft_size = fft_size;
            assert!(config.validate().is_err(), "fft_size {}", fft_size);
        }

        let mut config = VoiceConfig::default();
        config.audio.vad.smoothing_time_constant = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preferences_defaults() {
        let prefs: VoicePreferences = serde_json::from_str("{}").unwrap();
        assert_eq!(prefs.vad_threshold, 20.0);
        assert_eq!(prefs.volume_for("anyone"), 1.0);
    }
}
