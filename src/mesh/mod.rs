//! Full-mesh voice orchestration
//!
//! ```text
//! presence snapshots ──> VoiceSession::on_presence ──> PeerManager::reconcile
//! signaling documents ─> PeerManager::handle_document ─> PeerTransport
//! transport events ───> PeerManager (state, tracks, reconnect)
//! ```

pub mod client;
pub mod context;
pub mod output;
pub mod peer_manager;
pub mod presence;
pub mod role;
pub mod session;
pub mod state;

#[cfg(test)]
mod tests;

pub use client::{Identity, VoiceClient, VoiceServices};
pub use context::SessionContext;
pub use output::AudioOutputState;
pub use peer_manager::PeerManager;
pub use role::{is_offerer, reconnect_delay};
pub use session::{BeforeStopHook, VoiceSession};
pub use state::{RemoteStreamSet, StateHandle, TrackClass, VoiceState};
