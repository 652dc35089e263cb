use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Device unavailable [{device}]: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Voice session already active")]
    AlreadyActive,

    #[error("Voice session not active")]
    NotActive,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short human-readable status for the UI error surface
    pub fn user_message(&self) -> String {
        match self {
            AppError::PermissionDenied(reason) => format!("mic access denied: {}", reason),
            AppError::DeviceUnavailable { reason, .. } => format!("mic access denied: {}", reason),
            AppError::Audio(reason) => format!("audio pipeline failed: {}", reason),
            other => other.to_string(),
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
