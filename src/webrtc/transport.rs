//! Transport seam between the mesh and a real-time transport implementation
//!
//! The mesh only talks to [`PeerTransport`]; events flow back over an
//! unbounded channel handed out by [`TransportFactory::create`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::signaling::{ConnectionState, IceCandidate, SessionDescription, SignalingState};
use crate::error::Result;
use crate::ice::IceServer;
use crate::media::{MediaStream, MediaTrack, TrackKind};

/// Sender handle within one transport
pub type SenderId = u64;

/// Snapshot of one outgoing sender
#[derive(Debug, Clone)]
pub struct SenderInfo {
    pub id: SenderId,
    /// Track currently feeding the sender (None after `replace_track(None)`)
    pub track: Option<MediaTrack>,
}

impl SenderInfo {
    pub fn kind(&self) -> Option<TrackKind> {
        self.track.as_ref().map(|t| t.kind())
    }

    pub fn track_id(&self) -> Option<&str> {
        self.track.as_ref().map(|t| t.id())
    }
}

/// Events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local ICE candidate gathered
    IceCandidate(IceCandidate),
    /// Aggregate connection state changed
    ConnectionState(ConnectionState),
    /// Remote track announced; `stream` already lists every track the
    /// remote placed in the same stream
    Track { track: MediaTrack, stream: MediaStream },
}

/// One peer's real-time transport session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn peer_id(&self) -> &str;

    /// Add an outgoing track as part of `stream`
    async fn add_track(&self, track: &MediaTrack, stream: &MediaStream) -> Result<SenderId>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Swap the source of a sender without renegotiating
    async fn replace_track(&self, sender: SenderId, track: Option<&MediaTrack>) -> Result<()>;

    fn senders(&self) -> Vec<SenderInfo>;

    async fn create_data_channel(&self, label: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Fails with `InvalidState` when no remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;
}

/// Creates transports for new peers
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)>;
}
