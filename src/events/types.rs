//! Voice event types
//!
//! Everything the UI layer (or any other observer) may want to react to
//! is published as a `VoiceEvent` on the event bus.

use serde::{Deserialize, Serialize};

use crate::webrtc::ConnectionState;

/// Remote media kind carried in stream events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStreamKind {
    /// Microphone audio (stream without video)
    Mic,
    /// Screen share video (with optional system audio)
    Screen,
}

/// Voice event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "peer.state_changed",
///   "data": { "peer_id": "u2", "state": "connected" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum VoiceEvent {
    // ============================================================================
    // Session Events
    // ============================================================================
    /// The local participant joined a voice channel
    #[serde(rename = "voice.started")]
    VoiceStarted { group_id: String, channel_id: String },

    /// The local participant left; every resource has been released
    #[serde(rename = "voice.stopped")]
    VoiceStopped,

    /// A recoverable, user-visible failure ("mic access denied: ...")
    #[serde(rename = "voice.error")]
    VoiceError { message: String },

    /// The audio pipeline was rebuilt (device switch); consumers must re-resolve nodes
    #[serde(rename = "voice.pipeline_rebuilt")]
    PipelineRebuilt,

    /// Input device switched successfully
    #[serde(rename = "voice.input_switched")]
    InputSwitched { device_id: Option<String> },

    /// Output device switched
    #[serde(rename = "voice.output_switched")]
    OutputSwitched { device_id: Option<String> },

    // ============================================================================
    // Local Audio State
    // ============================================================================
    #[serde(rename = "audio.mute_changed")]
    MuteChanged { muted: bool },

    #[serde(rename = "audio.deafen_changed")]
    DeafenChanged { deafened: bool, muted: bool },

    /// Speaking indicator transition (local or remote)
    #[serde(rename = "audio.speaking_changed")]
    SpeakingChanged { uid: String, speaking: bool },

    // ============================================================================
    // Peer Events
    // ============================================================================
    #[serde(rename = "peer.state_changed")]
    PeerStateChanged {
        peer_id: String,
        state: ConnectionState,
    },

    /// Reconnection scheduled after a failure
    #[serde(rename = "peer.reconnecting")]
    PeerReconnecting {
        peer_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// Peer removed (left, abandoned or session stopped)
    #[serde(rename = "peer.removed")]
    PeerRemoved { peer_id: String },

    /// A remote stream was stored or replaced
    #[serde(rename = "peer.stream_added")]
    RemoteStreamAdded {
        peer_id: String,
        kind: RemoteStreamKind,
        stream_id: String,
    },

    /// A remote screen share went live
    #[serde(rename = "peer.stream_live")]
    StreamLive { peer_id: String },

    /// A remote screen share ended
    #[serde(rename = "peer.stream_ended")]
    StreamEnded { peer_id: String },

    // ============================================================================
    // Screen Share
    // ============================================================================
    #[serde(rename = "screen.state_changed")]
    ScreenShareChanged { sharing: bool },
}

impl VoiceEvent {
    /// Get the event name (for filtering and logging)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::VoiceStarted { .. } => "voice.started",
            Self::VoiceStopped => "voice.stopped",
            Self::VoiceError { .. } => "voice.error",
            Self::PipelineRebuilt => "voice.pipeline_rebuilt",
            Self::InputSwitched { .. } => "voice.input_switched",
            Self::OutputSwitched { .. } => "voice.output_switched",
            Self::MuteChanged { .. } => "audio.mute_changed",
            Self::DeafenChanged { .. } => "audio.deafen_changed",
            Self::SpeakingChanged { .. } => "audio.speaking_changed",
            Self::PeerStateChanged { .. } => "peer.state_changed",
            Self::PeerReconnecting { .. } => "peer.reconnecting",
            Self::PeerRemoved { .. } => "peer.removed",
            Self::RemoteStreamAdded { .. } => "peer.stream_added",
            Self::StreamLive { .. } => "peer.stream_live",
            Self::StreamEnded { .. } => "peer.stream_ended",
            Self::ScreenShareChanged { .. } => "screen.state_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_shape() {
        let event = VoiceEvent::PeerStateChanged {
            peer_id: "u2".to_string(),
            state: ConnectionState::Connected,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "peer.state_changed");
        assert_eq!(json["data"]["peer_id"], "u2");
        assert_eq!(json["data"]["state"], "connected");
    }

    #[test]
    fn test_event_name_matches_tag() {
        let event = VoiceEvent::StreamEnded {
            peer_id: "u1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.event_name());
    }
}
