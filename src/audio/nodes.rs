//! Audio graph nodes: gain with ramp automation and a frequency analyser

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use realfft::{num_complex::Complex, RealFftPlanner, RealToComplex};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Ramp {
    from: f32,
    to: f32,
    start: Instant,
    end: Instant,
}

#[derive(Debug)]
struct GainParam {
    value: f32,
    ramp: Option<Ramp>,
}

impl GainParam {
    fn value_at(&self, t: Instant) -> f32 {
        match self.ramp {
            None => self.value,
            Some(r) if t >= r.end => r.to,
            Some(r) if t <= r.start => r.from,
            Some(r) => {
                let total = (r.end - r.start).as_secs_f32();
                let elapsed = (t - r.start).as_secs_f32();
                r.from + (r.to - r.from) * (elapsed / total)
            }
        }
    }
}

/// Gain stage shared between the processing task and its controller
#[derive(Debug, Clone)]
pub struct GainNode {
    param: Arc<Mutex<GainParam>>,
}

impl GainNode {
    pub fn new(initial: f32) -> Self {
        Self {
            param: Arc::new(Mutex::new(GainParam {
                value: initial,
                ramp: None,
            })),
        }
    }

    /// Current gain
    pub fn value(&self) -> f32 {
        self.value_at(Instant::now())
    }

    pub fn value_at(&self, t: Instant) -> f32 {
        self.param.lock().value_at(t)
    }

    /// Gain the node is heading to (end of any running ramp)
    pub fn target(&self) -> f32 {
        let param = self.param.lock();
        param.ramp.map(|r| r.to).unwrap_or(param.value)
    }

    /// Cancel any ramp and jump to `value`
    pub fn set_value(&self, value: f32) {
        let mut param = self.param.lock();
        param.value = value;
        param.ramp = None;
    }

    /// Cancel scheduled values, hold the current value and ramp linearly to
    /// `target` over `duration`
    pub fn linear_ramp_to(&self, target: f32, duration: Duration) {
        let now = Instant::now();
        let mut param = self.param.lock();
        let from = param.value_at(now);
        if duration.is_zero() {
            param.value = target;
            param.ramp = None;
            return;
        }
        param.value = target;
        param.ramp = Some(Ramp {
            from,
            to: target,
            start: now,
            end: now + duration,
        });
    }

    /// Apply the gain to a block that starts at `start`, interpolating
    /// across the block so ramps stay click-free
    pub fn process(&self, samples: &mut [f32], start: Instant, sample_rate: u32) {
        if samples.is_empty() || sample_rate == 0 {
            return;
        }
        let block = Duration::from_micros(samples.len() as u64 * 1_000_000 / sample_rate as u64);
        let (g0, g1) = {
            let param = self.param.lock();
            (param.value_at(start), param.value_at(start + block))
        };

        if (g0 - g1).abs() < f32::EPSILON {
            if (g0 - 1.0).abs() < f32::EPSILON {
                return;
            }
            samples.iter_mut().for_each(|s| *s *= g0);
            return;
        }

        let n = samples.len() as f32;
        for (i, s) in samples.iter_mut().enumerate() {
            *s *= g0 + (g1 - g0) * (i as f32 / n);
        }
    }
}

/// Web Audio style byte scaling range
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

struct AnalyserState {
    ring: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

/// Frequency-domain analysis tap
///
/// Keeps the last `fft_size` samples; `get_byte_frequency_data` runs a
/// Blackman-windowed FFT, applies temporal smoothing and maps magnitudes
/// from -100..-30 dB onto 0..255.
#[derive(Clone)]
pub struct AnalyserNode {
    fft_size: usize,
    smoothing: f32,
    sample_rate: u32,
    window: Arc<[f32]>,
    fft: Arc<dyn RealToComplex<f32>>,
    state: Arc<Mutex<AnalyserState>>,
}

impl AnalyserNode {
    pub fn new(fft_size: usize, smoothing: f32, sample_rate: u32) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                let a = 0.16f32;
                let x = i as f32 / fft_size as f32;
                let two_pi = 2.0 * std::f32::consts::PI;
                0.5 * (1.0 - a) - 0.5 * (two_pi * x).cos() + 0.5 * a * (2.0 * two_pi * x).cos()
            })
            .collect();

        let state = AnalyserState {
            ring: vec![0.0; fft_size],
            write_pos: 0,
            smoothed: vec![0.0; fft_size / 2],
            input: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
        };

        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            sample_rate,
            window: window.into(),
            fft,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Width of one frequency bin in Hz
    pub fn bin_width(&self) -> f32 {
        self.sample_rate as f32 / self.fft_size as f32
    }

    /// Feed time-domain samples
    pub fn push_samples(&self, samples: &[f32]) {
        let mut state = self.state.lock();
        let len = state.ring.len();
        for &s in samples {
            let pos = state.write_pos;
            state.ring[pos] = s;
            state.write_pos = (pos + 1) % len;
        }
    }

    /// Fill `out` with the current byte-scaled spectrum
    pub fn get_byte_frequency_data(&self, out: &mut [u8]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let n = self.fft_size;

        for i in 0..n {
            let idx = (state.write_pos + i) % n;
            state.input[i] = state.ring[idx] * self.window[i];
        }

        if self
            .fft
            .process_with_scratch(&mut state.input, &mut state.spectrum, &mut state.scratch)
            .is_err()
        {
            out.iter_mut().for_each(|b| *b = 0);
            return;
        }

        let tau = self.smoothing;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (k, slot) in out.iter_mut().enumerate().take(state.smoothed.len()) {
            let magnitude = state.spectrum[k].norm() / n as f32;
            let smoothed = tau * state.smoothed[k] + (1.0 - tau) * magnitude;
            state.smoothed[k] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                MIN_DECIBELS
            };
            let scaled = 255.0 * (db - MIN_DECIBELS) / range;
            *slot = scaled.clamp(0.0, 255.0) as u8;
        }
    }
}
