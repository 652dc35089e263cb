//! Opus codec for the real transport (mono, 20 ms packets)

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::{info, trace};

use crate::error::{AppError, Result};

/// Samples per Opus packet (20 ms at 48 kHz)
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// Maximum Opus packet size
const MAX_PACKET: usize = 4000;

/// Encoded Opus packet
#[derive(Debug, Clone)]
pub struct OpusPacket {
    pub data: Bytes,
    /// Samples covered by this packet
    pub samples: u32,
}

/// Streaming Opus encoder fed with f32 blocks of any size
pub struct OpusEncoder {
    encoder: Encoder,
    pending: Vec<i16>,
    output_buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(bitrate: i32) -> Result<Self> {
        let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| AppError::Audio(format!("Failed to create Opus encoder: {:?}", e)))?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|e| AppError::Audio(format!("Failed to set bitrate: {:?}", e)))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| AppError::Audio(format!("Failed to enable FEC: {:?}", e)))?;

        info!("Opus encoder created: 48000Hz 1ch {}bps", bitrate);

        Ok(Self {
            encoder,
            pending: Vec::with_capacity(OPUS_FRAME_SAMPLES),
            output_buffer: vec![0u8; MAX_PACKET],
        })
    }

    /// Push samples; returns every packet completed by this block
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<OpusPacket>> {
        let mut packets = Vec::new();
        for &s in samples {
            self.pending.push(to_i16(s));
            if self.pending.len() == OPUS_FRAME_SAMPLES {
                let len = self
                    .encoder
                    .encode(&self.pending, &mut self.output_buffer)
                    .map_err(|e| AppError::Audio(format!("Opus encode failed: {:?}", e)))?;
                trace!("Encoded {} samples to {} bytes Opus", OPUS_FRAME_SAMPLES, len);
                packets.push(OpusPacket {
                    data: Bytes::copy_from_slice(&self.output_buffer[..len]),
                    samples: OPUS_FRAME_SAMPLES as u32,
                });
                self.pending.clear();
            }
        }
        Ok(packets)
    }
}

/// Opus decoder producing f32 samples
pub struct OpusDecoder {
    decoder: Decoder,
    pcm: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| AppError::Audio(format!("Failed to create Opus decoder: {:?}", e)))?;
        Ok(Self {
            decoder,
            // 120 ms is the longest Opus frame
            pcm: vec![0i16; 5760],
        })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        let samples = self
            .decoder
            .decode(Some(packet), &mut self.pcm[..], false)
            .map_err(|e| AppError::Audio(format!("Opus decode failed: {:?}", e)))?;
        Ok(self.pcm[..samples].iter().map(|&s| s as f32 / i16::MAX as f32).collect())
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
