//! Local audio output state (mute / deafen)

use serde::{Deserialize, Serialize};

/// Explicit mute/deafen state
///
/// Deafen implies mute and remembers whether the user was muted before,
/// so undeafening restores exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum AudioOutputState {
    #[default]
    Open,
    Muted,
    Deafened { prior_muted: bool },
}

impl AudioOutputState {
    /// Whether peers are cut off from the microphone
    pub fn is_muted(&self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn is_deafened(&self) -> bool {
        matches!(self, Self::Deafened { .. })
    }

    /// Flip mute. While deafened this changes nothing.
    pub fn toggle_mute(self) -> Self {
        match self {
            Self::Open => Self::Muted,
            Self::Muted => Self::Open,
            deafened @ Self::Deafened { .. } => deafened,
        }
    }

    pub fn toggle_deafen(self) -> Self {
        match self {
            Self::Open => Self::Deafened { prior_muted: false },
            Self::Muted => Self::Deafened { prior_muted: true },
            Self::Deafened { prior_muted: true } => Self::Muted,
            Self::Deafened { prior_muted: false } => Self::Open,
        }
    }
}
