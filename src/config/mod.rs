//! Engine configuration and persisted user preferences

pub mod schema;
pub mod store;

pub use schema::{
    AudioConfig, IceConfig, MeshConfig, TransportConfig, VadConfig, VoiceConfig,
    VoicePreferences,
};
pub use store::{PreferenceChange, PreferenceStore};

use std::path::Path;

use crate::error::{AppError, Result};

/// Load a JSON configuration file, or defaults when no path is given
pub async fn load_config(path: Option<&Path>) -> Result<VoiceConfig> {
    match path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await?;
            let config: VoiceConfig = serde_json::from_str(&raw)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(VoiceConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_config_rejects_zero_fft_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("voice.json");
        tokio::fs::write(&path, r#"{"audio": {"vad": {"fft_size": 0}}}"#)
            .await
            .unwrap();
        assert!(matches!(
            load_config(Some(&path)).await,
            Err(AppError::Config(_))
        ));

        tokio::fs::write(&path, r#"{"audio": {"sample_rate": 16000}}"#)
            .await
            .unwrap();
        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.audio.sample_rate, 16000);
    }
}
