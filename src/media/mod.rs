//! Media model: tracks, streams and device access

pub mod devices;
pub mod track;

pub use devices::{AudioConstraints, DeviceInfo, DeviceKind, MediaDevices, Signal, SyntheticDevices};
pub use track::{
    AudioFrame, MediaFrame, MediaStream, MediaTrack, TrackKind, TrackReader, FRAME_SAMPLES,
    SAMPLE_RATE,
};
