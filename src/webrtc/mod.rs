//! Real-time transport layer
//!
//! The mesh drives peers through the [`PeerTransport`] seam. The production
//! implementation wraps webrtc-rs:
//!
//! ```text
//! AudioPipeline output track
//!        |
//!        v
//! Opus encode -> TrackLocalStaticSample
//!        |
//!        v
//! RTCPeerConnection  <------ SDP / ICE over SignalingChannel ------>  remote peer
//!        |
//!        v
//! TrackRemote -> Opus decode -> MediaTrack (remote stream)
//! ```

pub mod mdns;
#[cfg(test)]
pub mod mock;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod transport;

pub use peer::{WebRtcTransport, WebRtcTransportFactory};
pub use signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState};
pub use transport::{PeerTransport, SenderId, SenderInfo, TransportEvent, TransportFactory};
