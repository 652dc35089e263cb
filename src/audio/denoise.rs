//! Neural noise suppression stage
//!
//! RNNoise works on fixed 480-sample frames of i16-scaled floats. Incoming
//! blocks of any size are re-chunked; output keeps the input block size.

use std::collections::VecDeque;
use std::sync::Arc;

use nnnoiseless::{DenoiseState, RnnModel, FRAME_SIZE};

const I16_SCALE: f32 = i16::MAX as f32;

/// Streaming denoiser
pub struct Denoiser {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
    ready: VecDeque<f32>,
    frame_out: [f32; FRAME_SIZE],
}

impl Denoiser {
    pub fn new(model: &Arc<RnnModel>) -> Self {
        Self {
            state: DenoiseState::from_model(RnnModel::clone(model)),
            pending: Vec::with_capacity(FRAME_SIZE),
            ready: VecDeque::with_capacity(FRAME_SIZE * 2),
            frame_out: [0.0; FRAME_SIZE],
        }
    }

    /// Denoise a block in place. The first block is delayed by up to one
    /// RNNoise frame; missing output is filled with silence.
    pub fn process(&mut self, block: &mut [f32]) {
        for &s in block.iter() {
            self.pending
                .push((s * I16_SCALE).trunc().clamp(-I16_SCALE - 1.0, I16_SCALE));
            if self.pending.len() == FRAME_SIZE {
                self.state.process_frame(&mut self.frame_out, &self.pending);
                self.ready
                    .extend(self.frame_out.iter().map(|s| s / I16_SCALE));
                self.pending.clear();
            }
        }

        for s in block.iter_mut() {
            *s = self.ready.pop_front().unwrap_or(0.0);
        }
    }
}
