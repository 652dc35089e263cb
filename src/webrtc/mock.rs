//! In-process fake transport network for tests
//!
//! Session descriptions are JSON listings of the sender's tracks. Two
//! transports connect once both hold matching offer/answer pairs; media is
//! forwarded through per-sender "wire" tracks registered on the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::signaling::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState,
};
use super::transport::{PeerTransport, SenderId, SenderInfo, TransportEvent, TransportFactory};
use crate::error::{AppError, Result};
use crate::ice::IceServer;
use crate::media::{MediaStream, MediaTrack, TrackKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockSdp {
    session: String,
    tracks: Vec<MockSdpTrack>,
    data: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockSdpTrack {
    video: bool,
    stream: String,
    track: String,
}

#[derive(Default)]
struct NetworkInner {
    transports: Vec<Arc<MockTransport>>,
    wires: HashMap<String, MediaTrack>,
}

/// Shared fake network
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

fn wire_key(from: &str, to: &str, track_id: &str) -> String {
    format!("{}>{}:{}", from, to, track_id)
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for transports owned by `local`
    pub fn factory(&self, local: &str) -> Arc<MockTransportFactory> {
        Arc::new(MockTransportFactory {
            local: local.to_string(),
            network: self.clone(),
            fail_create: AtomicBool::new(false),
        })
    }

    /// Every transport `local` created towards `remote`, oldest first
    pub fn transports(&self, local: &str, remote: &str) -> Vec<Arc<MockTransport>> {
        self.inner
            .lock()
            .transports
            .iter()
            .filter(|t| t.local == local && t.peer == remote)
            .cloned()
            .collect()
    }

    pub fn latest(&self, local: &str, remote: &str) -> Option<Arc<MockTransport>> {
        self.transports(local, remote).pop()
    }

    fn register(&self, transport: Arc<MockTransport>) {
        self.inner.lock().transports.push(transport);
    }

    fn find_session(&self, session: &str) -> Option<Arc<MockTransport>> {
        self.inner
            .lock()
            .transports
            .iter()
            .find(|t| t.session == session)
            .cloned()
    }

    fn set_wire(&self, key: String, wire: MediaTrack) {
        self.inner.lock().wires.insert(key, wire);
    }

    fn wire(&self, key: &str) -> Option<MediaTrack> {
        self.inner.lock().wires.get(key).cloned()
    }
}

pub struct MockTransportFactory {
    local: String,
    network: MockNetwork,
    fail_create: AtomicBool,
}

impl MockTransportFactory {
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AppError::WebRtc("transport creation failed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            local: self.local.clone(),
            peer: peer_id.to_string(),
            session: uuid::Uuid::new_v4().to_string(),
            ice_servers: ice_servers.to_vec(),
            network: self.network.clone(),
            state: Mutex::new(MockState::default()),
            events: tx,
            invalid_state_errors: AtomicU32::new(0),
            offers_created: AtomicU32::new(0),
        });
        self.network.register(transport.clone());
        Ok((transport, rx))
    }
}

struct MockSender {
    wire: MediaTrack,
    stream_id: String,
    track: Option<MediaTrack>,
    pump: Option<JoinHandle<()>>,
}

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    remote_session: Option<String>,
    senders: BTreeMap<SenderId, MockSender>,
    next_sender: SenderId,
    data_channels: Vec<String>,
    remote_tracks: HashMap<String, MediaTrack>,
    remote_streams: HashMap<String, MediaStream>,
    applied: Vec<IceCandidate>,
    candidates_sent: u32,
    closed: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            local_desc: None,
            remote_desc: None,
            remote_session: None,
            senders: BTreeMap::new(),
            next_sender: 1,
            data_channels: Vec::new(),
            remote_tracks: HashMap::new(),
            remote_streams: HashMap::new(),
            applied: Vec::new(),
            candidates_sent: 0,
            closed: false,
        }
    }
}

/// Fake transport
pub struct MockTransport {
    local: String,
    peer: String,
    session: String,
    ice_servers: Vec<IceServer>,
    network: MockNetwork,
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    invalid_state_errors: AtomicU32,
    offers_created: AtomicU32,
}

impl MockTransport {
    /// Force a connection state (failure injection)
    pub fn emit_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        let _ = self.events.send(TransportEvent::ConnectionState(state));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn invalid_state_errors(&self) -> u32 {
        self.invalid_state_errors.load(Ordering::SeqCst)
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn data_channels(&self) -> Vec<String> {
        self.state.lock().data_channels.clone()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Kinds of the tracks currently sent, in sender order
    pub fn sent_kinds(&self) -> Vec<Option<TrackKind>> {
        self.senders().iter().map(|s| s.kind()).collect()
    }

    /// Remote track currently announced under `track_id`
    pub fn remote_track(&self, track_id: &str) -> Option<MediaTrack> {
        self.state.lock().remote_tracks.get(track_id).cloned()
    }

    fn describe(&self, state: &MockState) -> String {
        let sdp = MockSdp {
            session: self.session.clone(),
            tracks: state
                .senders
                .values()
                .map(|s| MockSdpTrack {
                    video: s.wire.kind() == TrackKind::Video,
                    stream: s.stream_id.clone(),
                    track: s.wire.id().to_string(),
                })
                .collect(),
            data: state.data_channels.clone(),
        };
        serde_json::to_string(&sdp).unwrap_or_default()
    }

    fn spawn_pump(source: &MediaTrack, wire: MediaTrack) -> JoinHandle<()> {
        let mut reader = source.reader();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                wire.push(frame);
            }
        })
    }

    fn spawn_forward(wire: MediaTrack, remote: MediaTrack) {
        let mut reader = wire.reader();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = remote.ended() => break,
                    frame = reader.next() => frame,
                };
                match frame {
                    Some(frame) => remote.push(frame),
                    None => break,
                }
            }
        });
    }

    /// Mirror the remote track list, ending tracks that disappeared
    fn apply_remote_tracks(&self, sdp: &MockSdp) {
        let mut announced = Vec::new();
        let mut ended = Vec::new();
        {
            let mut state = self.state.lock();
            let keep: Vec<&str> = sdp.tracks.iter().map(|t| t.track.as_str()).collect();
            let gone: Vec<String> = state
                .remote_tracks
                .keys()
                .filter(|id| !keep.contains(&id.as_str()))
                .cloned()
                .collect();
            for id in gone {
                if let Some(track) = state.remote_tracks.remove(&id) {
                    for stream in state.remote_streams.values() {
                        stream.remove_track(&id);
                    }
                    ended.push(track);
                }
            }

            let mut added = Vec::new();
            for t in &sdp.tracks {
                if state.remote_tracks.contains_key(&t.track) {
                    continue;
                }
                let kind = if t.video { TrackKind::Video } else { TrackKind::Audio };
                let track = MediaTrack::with_id(t.track.clone(), kind, format!("remote-{}", kind));
                let stream = state
                    .remote_streams
                    .entry(t.stream.clone())
                    .or_insert_with(|| MediaStream::with_id(t.stream.clone(), vec![]))
                    .clone();
                stream.add_track(track.clone());
                state.remote_tracks.insert(t.track.clone(), track.clone());
                added.push((track, stream, t.track.clone()));
            }
            for (track, stream, wire_id) in added {
                if let Some(wire) = self.network.wire(&wire_key(&self.peer, &self.local, &wire_id)) {
                    Self::spawn_forward(wire, track.clone());
                }
                announced.push((track, stream));
            }
        }
        for track in ended {
            track.stop();
        }
        for (track, stream) in announced {
            let _ = self.events.send(TransportEvent::Track { track, stream });
        }
    }

    fn negotiated(&self) -> Option<String> {
        let state = self.state.lock();
        let ready = !state.closed
            && state.signaling == SignalingState::Stable
            && state.local_desc.is_some()
            && state.remote_desc.is_some()
            && state.connection == ConnectionState::New;
        if ready {
            state.remote_session.clone()
        } else {
            None
        }
    }

    fn try_connect(&self) {
        let Some(remote_session) = self.negotiated() else {
            return;
        };
        let Some(other) = self.network.find_session(&remote_session) else {
            return;
        };
        if other.negotiated().as_deref() != Some(self.session.as_str()) {
            return;
        }
        for transport in [self, other.as_ref()] {
            transport.emit_state(ConnectionState::Connecting);
            transport.emit_state(ConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    async fn add_track(&self, track: &MediaTrack, stream: &MediaStream) -> Result<SenderId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AppError::InvalidState("transport closed".to_string()));
        }
        let id = state.next_sender;
        state.next_sender += 1;
        let wire = MediaTrack::with_id(
            format!("{}-{}", track.id(), id),
            track.kind(),
            track.label(),
        );
        self.network
            .set_wire(wire_key(&self.local, &self.peer, wire.id()), wire.clone());
        let pump = Self::spawn_pump(track, wire.clone());
        state.senders.insert(
            id,
            MockSender {
                wire,
                stream_id: stream.id().to_string(),
                track: Some(track.clone()),
                pump: Some(pump),
            },
        );
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let removed = self.state.lock().senders.remove(&sender);
        match removed {
            Some(mut s) => {
                if let Some(pump) = s.pump.take() {
                    pump.abort();
                }
                Ok(())
            }
            None => Err(AppError::InvalidState(format!("Unknown sender {}", sender))),
        }
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&MediaTrack>) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .senders
            .get_mut(&sender)
            .ok_or_else(|| AppError::InvalidState(format!("Unknown sender {}", sender)))?;
        if let Some(pump) = entry.pump.take() {
            pump.abort();
        }
        entry.track = track.cloned();
        entry.pump = track.map(|t| Self::spawn_pump(t, entry.wire.clone()));
        Ok(())
    }

    fn senders(&self) -> Vec<SenderInfo> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(id, s)| SenderInfo {
                id: *id,
                track: s.track.clone(),
            })
            .collect()
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.state.lock().data_channels.push(label.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.closed {
            return Err(AppError::InvalidState("transport closed".to_string()));
        }
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(self.describe(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(AppError::InvalidState(format!(
                "create_answer in {}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer(self.describe(&state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let candidate = {
            let mut state = self.state.lock();
            let next = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, current) => {
                    return Err(AppError::InvalidState(format!(
                        "set_local_description({:?}) in {}",
                        desc.sdp_type, current
                    )))
                }
            };
            state.signaling = next;
            state.local_desc = Some(desc);
            state.candidates_sent += 1;
            IceCandidate::new(format!(
                "candidate:{} {} udp 2122260223 127.0.0.1 {} typ host",
                state.candidates_sent,
                1,
                40000 + state.candidates_sent
            ))
            .with_mid("0", 0)
        };
        let _ = self.events.send(TransportEvent::IceCandidate(candidate));
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let sdp: MockSdp = serde_json::from_str(&desc.sdp)
            .map_err(|e| AppError::WebRtc(format!("Invalid session description: {}", e)))?;
        {
            let mut state = self.state.lock();
            let next = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, current) => {
                    return Err(AppError::InvalidState(format!(
                        "set_remote_description({:?}) in {}",
                        desc.sdp_type, current
                    )))
                }
            };
            state.signaling = next;
            state.remote_session = Some(sdp.session.clone());
            state.remote_desc = Some(desc);
        }
        self.apply_remote_tracks(&sdp);
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote_desc.is_none() {
            self.invalid_state_errors.fetch_add(1, Ordering::SeqCst);
            return Err(AppError::InvalidState(
                "ICE candidate before remote description".to_string(),
            ));
        }
        if candidate.candidate.is_empty() {
            return Err(AppError::WebRtc("Malformed ICE candidate".to_string()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_desc.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) -> Result<()> {
        let tracks: Vec<MediaTrack> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            for sender in state.senders.values_mut() {
                if let Some(pump) = sender.pump.take() {
                    pump.abort();
                }
            }
            state.remote_streams.clear();
            state.remote_tracks.drain().map(|(_, t)| t).collect()
        };
        for track in tracks {
            track.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let network = MockNetwork::new();
        let (a, mut a_events) = network.factory("alice").create("bob", &[]).await.unwrap();
        let (b, mut b_events) = network.factory("bob").create("alice", &[]).await.unwrap();

        let mic = MediaTrack::new(TrackKind::Audio, "alice-mic");
        let stream = MediaStream::new(vec![mic.clone()]);
        a.add_track(&mic, &stream).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);

        // b saw alice's mic announced, then its own candidate, then the states
        let mut saw_track = false;
        while let Ok(event) = b_events.try_recv() {
            if let TransportEvent::Track { track, stream } = event {
                assert_eq!(track.kind(), TrackKind::Audio);
                assert!(!stream.has_video());
                saw_track = true;
            }
        }
        assert!(saw_track);
        assert!(matches!(
            a_events.try_recv().unwrap(),
            TransportEvent::IceCandidate(_)
        ));
    }

    #[tokio::test]
    async fn test_candidate_before_description_is_invalid() {
        let network = MockNetwork::new();
        network.factory("alice").create("bob", &[]).await.unwrap();
        let transport = network.latest("alice", "bob").unwrap();

        assert!(transport
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .is_err());
        assert_eq!(transport.invalid_state_errors(), 1);
    }
}
