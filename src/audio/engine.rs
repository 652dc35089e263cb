//! Audio engine (one per voice session)
//!
//! The engine owns the session clock, the closed flag that every processing
//! task watches, and the noise suppression model. Pipelines, detectors and
//! the agent mixer all hang off a single engine; nothing else creates one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nnnoiseless::RnnModel;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{AppError, Result};

/// Where the noise suppression weights come from
#[derive(Debug, Clone)]
pub enum NoiseModelSource {
    /// Weights compiled into nnnoiseless
    Builtin,
    /// Serialized RNNoise weights
    Bytes(Vec<u8>),
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Closed,
}

/// Shared audio engine
pub struct AudioEngine {
    id: String,
    sample_rate: u32,
    started: Instant,
    cancel: CancellationToken,
    noise_model: Mutex<Option<Arc<RnnModel>>>,
    model_loads: AtomicU32,
}

impl AudioEngine {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        let engine = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            sample_rate,
            started: Instant::now(),
            cancel: CancellationToken::new(),
            noise_model: Mutex::new(None),
            model_loads: AtomicU32::new(0),
        });
        info!("Audio engine {} created ({} Hz)", crate::utils::short_id(&engine.id), sample_rate);
        engine
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds since the engine was created
    pub fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn state(&self) -> EngineState {
        if self.cancel.is_cancelled() {
            EngineState::Closed
        } else {
            EngineState::Running
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the engine closes; child tokens for owned tasks
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Close the engine and stop every task tied to it. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!("Audio engine {} closed", crate::utils::short_id(&self.id));
        }
    }

    /// Load the noise suppression model into this engine.
    ///
    /// Once loaded, further calls return immediately. A failed load leaves
    /// the engine without a model so a later call can retry.
    pub async fn ensure_noise_model(&self, source: &NoiseModelSource) -> Result<Arc<RnnModel>> {
        if self.is_closed() {
            return Err(AppError::Audio("audio engine is closed".to_string()));
        }

        let mut slot = self.noise_model.lock().await;
        if let Some(model) = slot.as_ref() {
            return Ok(model.clone());
        }

        let model = match source {
            NoiseModelSource::Builtin => RnnModel::default(),
            NoiseModelSource::Bytes(bytes) => match RnnModel::from_bytes(bytes) {
                Some(model) => model,
                None => {
                    error!("Noise suppression model load failed: invalid model data");
                    return Err(AppError::Audio("invalid noise model".to_string()));
                }
            },
        };

        let model = Arc::new(model);
        *slot = Some(model.clone());
        self.model_loads.fetch_add(1, Ordering::Relaxed);
        info!("Noise suppression model loaded");
        Ok(model)
    }

    pub async fn is_noise_model_loaded(&self) -> bool {
        self.noise_model.lock().await.is_some()
    }

    /// Number of successful model loads (at most one per engine)
    pub fn noise_model_loads(&self) -> u32 {
        self.model_loads.load(Ordering::Relaxed)
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
