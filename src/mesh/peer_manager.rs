//! Peer connection manager
//!
//! Owns one transport per remote participant: creation, signaling message
//! handling, ICE candidate buffering, remote track classification,
//! renegotiation and bounded reconnection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::SessionContext;
use super::role::{is_offerer, reconnect_delay};
use super::state::{RemoteStreamSet, TrackClass};
use crate::audio::{DetectorHandle, DetectorInput, DetectorOptions, SpeakingCallback, SpeechDetector};
use crate::error::{AppError, Result};
use crate::events::{RemoteStreamKind, VoiceEvent};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::{document_addressee, SignalDocument, SignalingMessage};
use crate::utils::short_id;
use crate::webrtc::{
    ConnectionState, IceCandidate, PeerTransport, SenderId, SenderInfo, SessionDescription,
    SignalingState, TransportEvent,
};

/// Label of the placeholder data channel opened by offerers
pub const RESERVED_DATA_CHANNEL: &str = "_sctp";

/// Times a delayed screen-track renegotiation waits for a stable state
const SCREEN_RENEGOTIATION_RETRIES: u32 = 10;

#[derive(Clone)]
struct PeerEntry {
    transport: Arc<dyn PeerTransport>,
    is_offerer: bool,
    generation: u64,
    cancel: CancellationToken,
}

pub struct PeerManager {
    ctx: Arc<SessionContext>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    /// Candidates received before a remote description was set
    pending: Mutex<HashMap<String, Vec<IceCandidate>>>,
    attempts: Mutex<HashMap<String, u32>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    detectors: Mutex<HashMap<String, DetectorHandle>>,
    /// Peers that exhausted their reconnect attempts this session
    abandoned: Mutex<HashSet<String>>,
    next_generation: AtomicU64,
}

impl PeerManager {
    pub fn new(ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            peers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            detectors: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn transport(&self, peer_id: &str) -> Option<Arc<dyn PeerTransport>> {
        self.peers.lock().get(peer_id).map(|e| e.transport.clone())
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Transports that are not closed
    pub fn open_peers(&self) -> Vec<(String, Arc<dyn PeerTransport>)> {
        let mut open: Vec<(String, Arc<dyn PeerTransport>)> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, e)| e.transport.signaling_state() != SignalingState::Closed)
            .map(|(id, e)| (id.clone(), e.transport.clone()))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        open
    }

    pub fn reconnect_attempts(&self, peer_id: &str) -> u32 {
        self.attempts.lock().get(peer_id).copied().unwrap_or(0)
    }

    pub fn is_abandoned(&self, peer_id: &str) -> bool {
        self.abandoned.lock().contains(peer_id)
    }

    pub fn pending_candidates(&self, peer_id: &str) -> usize {
        self.pending.lock().get(peer_id).map_or(0, Vec::len)
    }

    fn current(&self, peer_id: &str, generation: u64) -> Option<Arc<dyn PeerTransport>> {
        self.peers
            .lock()
            .get(peer_id)
            .filter(|e| e.generation == generation)
            .map(|e| e.transport.clone())
    }

    /// Create a transport to `peer_id`
    ///
    /// Only the local audio tracks are attached; screen tracks follow via
    /// renegotiation. With `remote_offer` the connection answers it,
    /// otherwise it sends an offer.
    pub async fn create(
        self: &Arc<Self>,
        peer_id: &str,
        is_offerer: bool,
        remote_offer: Option<SessionDescription>,
    ) -> Result<()> {
        if !self.ctx.is_active() {
            return Err(AppError::NotActive);
        }
        let (transport, events) = self
            .ctx
            .transports
            .create(peer_id, &self.ctx.ice_servers)
            .await?;

        if let Some(stream) = self.ctx.local_stream() {
            for track in stream.audio_tracks() {
                if let Err(e) = transport.add_track(&track, &stream).await {
                    let _ = transport.close().await;
                    return Err(e);
                }
            }
        }
        if is_offerer {
            // Reserve the data section so later channels need no renegotiation
            if let Err(e) = transport.create_data_channel(RESERVED_DATA_CHANNEL).await {
                warn!("Peer {} data channel setup failed: {}", short_id(peer_id), e);
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.ctx.cancel.child_token();
        let entry = PeerEntry {
            transport: transport.clone(),
            is_offerer,
            generation,
            cancel: cancel.clone(),
        };
        let replaced = self.peers.lock().insert(peer_id.to_string(), entry);
        if let Some(old) = replaced {
            old.cancel.cancel();
            let _ = old.transport.close().await;
        }
        let initial = transport.connection_state();
        self.ctx.state.update(|s| {
            s.peers.insert(peer_id.to_string(), initial);
        });
        self.spawn_event_pump(peer_id, generation, cancel, events);

        let negotiated = match remote_offer {
            Some(offer) => self.answer_offer(peer_id, &transport, offer).await,
            None => self.send_offer(peer_id, &transport).await,
        };
        if let Err(e) = negotiated {
            warn!("Peer {} negotiation failed: {}", short_id(peer_id), e);
            self.remove_peer(peer_id).await;
            return Err(e);
        }

        info!(
            "Peer {} created as {}",
            short_id(peer_id),
            if is_offerer { "offerer" } else { "answerer" }
        );

        if self.ctx.screen_stream().is_some() {
            self.schedule_screen_tracks(peer_id, generation);
        }
        Ok(())
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        peer_id: &str,
        generation: u64,
        cancel: CancellationToken,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let this = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                if !this.ctx.is_active() || this.current(&peer_id, generation).is_none() {
                    break;
                }
                this.handle_transport_event(&peer_id, generation, event).await;
            }
            debug!("Peer {} event pump exited", short_id(&peer_id));
        });
    }

    async fn handle_transport_event(
        self: &Arc<Self>,
        peer_id: &str,
        generation: u64,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.ctx
                    .send(SignalingMessage::IceCandidate {
                        from: self.ctx.local_uid.clone(),
                        to: peer_id.to_string(),
                        candidate,
                    })
                    .await;
            }
            TransportEvent::ConnectionState(state) => {
                info!("Peer {} connection state: {}", short_id(peer_id), state);
                self.ctx.state.update(|s| {
                    s.peers.insert(peer_id.to_string(), state);
                });
                self.ctx.publish(VoiceEvent::PeerStateChanged {
                    peer_id: peer_id.to_string(),
                    state,
                });
                match state {
                    ConnectionState::Failed => self.handle_reconnect(peer_id).await,
                    ConnectionState::Connected => {
                        self.attempts.lock().remove(peer_id);
                    }
                    _ => {}
                }
            }
            TransportEvent::Track { track, stream } => {
                self.on_remote_track(peer_id, generation, track, stream);
            }
        }
    }

    fn on_remote_track(
        self: &Arc<Self>,
        peer_id: &str,
        generation: u64,
        track: MediaTrack,
        stream: MediaStream,
    ) {
        match RemoteStreamSet::classify(&track, &stream) {
            TrackClass::MicAudio => {
                debug!("Peer {} mic track {}", short_id(peer_id), track.id());
                self.attach_remote_detector(peer_id, &stream);
                self.ctx.state.update(|s| {
                    s.streams.audio.insert(peer_id.to_string(), stream.clone());
                });
                self.ctx.playback.attach(peer_id, &stream);
                self.ctx.publish(VoiceEvent::RemoteStreamAdded {
                    peer_id: peer_id.to_string(),
                    kind: RemoteStreamKind::Mic,
                    stream_id: stream.id().to_string(),
                });
            }
            TrackClass::ScreenAudio => {
                // Rendered with the screen video, no detector of its own
                debug!("Peer {} screen audio track {}", short_id(peer_id), track.id());
            }
            TrackClass::ScreenVideo => {
                info!("Peer {} screen share is live", short_id(peer_id));
                self.ctx.state.update(|s| {
                    s.streams.video.insert(peer_id.to_string(), stream.clone());
                });
                self.ctx.publish(VoiceEvent::StreamLive {
                    peer_id: peer_id.to_string(),
                });
                self.ctx.publish(VoiceEvent::RemoteStreamAdded {
                    peer_id: peer_id.to_string(),
                    kind: RemoteStreamKind::Screen,
                    stream_id: stream.id().to_string(),
                });
                self.watch_video_end(peer_id, generation, track, stream);
            }
        }
    }

    fn watch_video_end(
        self: &Arc<Self>,
        peer_id: &str,
        generation: u64,
        track: MediaTrack,
        stream: MediaStream,
    ) {
        let Some(cancel) = self
            .peers
            .lock()
            .get(peer_id)
            .filter(|e| e.generation == generation)
            .map(|e| e.cancel.clone())
        else {
            return;
        };
        let ctx = self.ctx.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = track.ended() => {}
            }
            if !ctx.is_active() {
                return;
            }
            let removed = ctx.state.update_if(|s| match s.streams.video.get(&peer_id) {
                Some(current) if current.same_as(&stream) => {
                    s.streams.video.remove(&peer_id);
                    true
                }
                _ => false,
            });
            if removed {
                info!("Peer {} screen share ended", short_id(&peer_id));
                ctx.publish(VoiceEvent::StreamEnded { peer_id });
            }
        });
    }

    fn attach_remote_detector(&self, peer_id: &str, stream: &MediaStream) {
        let state = self.ctx.state.clone();
        let events = self.ctx.events.clone();
        let uid = peer_id.to_string();
        let on_change: SpeakingCallback = Arc::new(move |speaking| {
            if state.set_speaking(&uid, speaking) {
                events.publish(VoiceEvent::SpeakingChanged {
                    uid: uid.clone(),
                    speaking,
                });
            }
        });
        let handle = SpeechDetector::attach(
            &self.ctx.engine,
            DetectorInput::Stream(stream.clone()),
            on_change,
            DetectorOptions::default(),
            &self.ctx.vad,
        );
        if let Some(old) = self.detectors.lock().insert(peer_id.to_string(), handle) {
            old.stop();
        }
    }

    async fn send_offer(&self, peer_id: &str, transport: &Arc<dyn PeerTransport>) -> Result<()> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.ctx
            .send(SignalingMessage::Offer {
                from: self.ctx.local_uid.clone(),
                to: peer_id.to_string(),
                sdp: offer.sdp,
            })
            .await;
        Ok(())
    }

    async fn answer_offer(
        &self,
        peer_id: &str,
        transport: &Arc<dyn PeerTransport>,
        offer: SessionDescription,
    ) -> Result<()> {
        transport.set_remote_description(offer).await?;
        self.flush_candidates(peer_id, transport).await;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.ctx
            .send(SignalingMessage::Answer {
                from: self.ctx.local_uid.clone(),
                to: peer_id.to_string(),
                sdp: answer.sdp,
            })
            .await;
        Ok(())
    }

    /// Apply every queued candidate; a bad one does not stop the rest
    async fn flush_candidates(&self, peer_id: &str, transport: &Arc<dyn PeerTransport>) {
        let queued = self.pending.lock().remove(peer_id).unwrap_or_default();
        if queued.is_empty() {
            return;
        }
        let total = queued.len();
        let mut applied = 0;
        for candidate in queued {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => debug!("Queued candidate for {} rejected: {}", short_id(peer_id), e),
            }
        }
        debug!(
            "Flushed {}/{} queued ICE candidates for {}",
            applied,
            total,
            short_id(peer_id)
        );
    }

    /// Send a fresh offer on an established connection
    pub async fn renegotiate(&self, peer_id: &str) -> Result<()> {
        if !self.ctx.is_active() {
            return Err(AppError::NotActive);
        }
        let transport = self
            .transport(peer_id)
            .ok_or_else(|| AppError::InvalidState(format!("No connection to {}", peer_id)))?;
        debug!("Renegotiating with {}", short_id(peer_id));
        self.send_offer(peer_id, &transport).await
    }

    /// Handle one document from the signaling subscription
    pub async fn handle_document(self: &Arc<Self>, doc: SignalDocument) {
        if !self.ctx.is_active() {
            return;
        }
        if document_addressee(&doc.body) != Some(self.ctx.local_uid.as_str()) {
            return;
        }
        match SignalingMessage::from_document(&doc.body) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => warn!("Dropping signaling document {}: {}", doc.id, e),
        }
        if let Err(e) = self.ctx.signaling.delete(&doc.id).await {
            debug!("Failed to delete signaling document {}: {}", doc.id, e);
        }
    }

    pub async fn handle_message(self: &Arc<Self>, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer { from, sdp, .. } => {
                let offer = SessionDescription::offer(sdp);
                match self.transport(&from) {
                    Some(transport) if transport.signaling_state() != SignalingState::Closed => {
                        debug!("Renegotiation offer from {}", short_id(&from));
                        if let Err(e) = self.answer_offer(&from, &transport, offer).await {
                            warn!("Renegotiation with {} failed: {}", short_id(&from), e);
                        }
                    }
                    _ => {
                        if let Err(e) = self.create(&from, false, Some(offer)).await {
                            warn!("Failed to answer {}: {}", short_id(&from), e);
                        }
                    }
                }
            }
            SignalingMessage::Answer { from, sdp, .. } => {
                let Some(transport) = self.transport(&from) else {
                    debug!("Answer from {} without a connection", short_id(&from));
                    return;
                };
                let state = transport.signaling_state();
                if state != SignalingState::HaveLocalOffer {
                    warn!("Ignoring answer from {} in state {}", short_id(&from), state);
                    return;
                }
                match transport
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await
                {
                    Ok(()) => self.flush_candidates(&from, &transport).await,
                    Err(e) => warn!("Failed to apply answer from {}: {}", short_id(&from), e),
                }
            }
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => {
                let transport = self.transport(&from);
                let ready = match &transport {
                    Some(t) => t.has_remote_description().await,
                    None => false,
                };
                match transport {
                    Some(t) if ready => {
                        if let Err(e) = t.add_ice_candidate(candidate).await {
                            warn!("ICE candidate from {} rejected: {}", short_id(&from), e);
                        }
                    }
                    _ => {
                        self.pending.lock().entry(from).or_default().push(candidate);
                    }
                }
            }
        }
    }

    async fn handle_reconnect(self: &Arc<Self>, peer_id: &str) {
        if !self.ctx.is_active() {
            return;
        }
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(peer_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt > self.ctx.mesh.max_reconnect_attempts {
            warn!(
                "Peer {} failed {} times, giving up",
                short_id(peer_id),
                attempt - 1
            );
            self.attempts.lock().remove(peer_id);
            self.abandoned.lock().insert(peer_id.to_string());
            self.remove_peer(peer_id).await;
            return;
        }

        self.remove_peer(peer_id).await;
        let delay = reconnect_delay(attempt, &self.ctx.mesh);
        info!(
            "Peer {} reconnect attempt {} in {}ms",
            short_id(peer_id),
            attempt,
            delay.as_millis()
        );
        self.ctx.publish(VoiceEvent::PeerReconnecting {
            peer_id: peer_id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        self.schedule_reconnect(peer_id, delay);
    }

    fn schedule_reconnect(self: &Arc<Self>, peer_id: &str, delay: Duration) {
        let this = self.clone();
        let peer = peer_id.to_string();
        let cancel = self.ctx.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.timers.lock().remove(&peer);
            if !this.ctx.is_active() || !this.ctx.is_present(&peer) {
                return;
            }
            if !is_offerer(&this.ctx.local_uid, &peer) {
                debug!("Waiting for {} to reconnect", short_id(&peer));
                return;
            }
            if this.peers.lock().contains_key(&peer) {
                return;
            }
            if let Err(e) = this.create(&peer, true, None).await {
                warn!("Reconnect to {} failed: {}", short_id(&peer), e);
            }
        });
        if let Some(old) = self.timers.lock().insert(peer_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Close and forget a peer; reconnect bookkeeping is kept
    pub async fn remove_peer(&self, peer_id: &str) {
        let entry = self.peers.lock().remove(peer_id);
        self.pending.lock().remove(peer_id);
        if let Some(detector) = self.detectors.lock().remove(peer_id) {
            detector.stop();
        }
        self.ctx.playback.detach(peer_id);
        self.ctx.state.update(|s| {
            s.peers.remove(peer_id);
            s.streams.remove_peer(peer_id);
        });
        if self.ctx.state.set_speaking(peer_id, false) {
            self.ctx.publish(VoiceEvent::SpeakingChanged {
                uid: peer_id.to_string(),
                speaking: false,
            });
        }

        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Err(e) = entry.transport.close().await {
                debug!("Closing transport to {} failed: {}", short_id(peer_id), e);
            }
            info!(
                "Peer {} removed ({})",
                short_id(peer_id),
                if entry.is_offerer { "offerer" } else { "answerer" }
            );
            self.ctx.publish(VoiceEvent::PeerRemoved {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Bring connections in line with the participants currently present
    pub async fn reconcile(self: &Arc<Self>, others: &HashSet<String>) {
        if !self.ctx.is_active() {
            return;
        }
        for peer in self.peer_ids() {
            if !others.contains(&peer) {
                info!("Peer {} left the channel", short_id(&peer));
                self.remove_peer(&peer).await;
            }
        }
        {
            let mut timers = self.timers.lock();
            timers.retain(|peer, handle| {
                let keep = others.contains(peer);
                if !keep {
                    handle.abort();
                }
                keep
            });
        }
        self.attempts.lock().retain(|peer, _| others.contains(peer));
        self.abandoned.lock().retain(|peer| others.contains(peer));
        {
            let peers = self.peers.lock();
            self.pending
                .lock()
                .retain(|peer, _| others.contains(peer) || peers.contains_key(peer));
        }

        let mut targets: Vec<String> = {
            let peers = self.peers.lock();
            let timers = self.timers.lock();
            let abandoned = self.abandoned.lock();
            others
                .iter()
                .filter(|p| is_offerer(&self.ctx.local_uid, p))
                .filter(|p| !peers.contains_key(*p) && !timers.contains_key(*p))
                .filter(|p| !abandoned.contains(*p))
                .cloned()
                .collect()
        };
        targets.sort();
        for peer in targets {
            if !self.ctx.is_active() {
                break;
            }
            if let Err(e) = self.create(&peer, true, None).await {
                warn!("Failed to connect to {}: {}", short_id(&peer), e);
            }
        }
    }

    fn schedule_screen_tracks(self: &Arc<Self>, peer_id: &str, generation: u64) {
        let this = self.clone();
        let peer = peer_id.to_string();
        let cancel = self.ctx.cancel.clone();
        let delay = Duration::from_millis(self.ctx.mesh.screen_renegotiation_delay_ms);
        tokio::spawn(async move {
            let mut transport = None;
            for _ in 0..SCREEN_RENEGOTIATION_RETRIES {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if !this.ctx.is_active() {
                    return;
                }
                let Some(current) = this.current(&peer, generation) else {
                    return;
                };
                if current.signaling_state() == SignalingState::Stable {
                    transport = Some(current);
                    break;
                }
            }
            let (Some(transport), Some(screen)) = (transport, this.ctx.screen_stream()) else {
                return;
            };
            this.add_screen_tracks(&transport, &screen).await;
            if let Err(e) = this.renegotiate(&peer).await {
                warn!("Screen renegotiation with {} failed: {}", short_id(&peer), e);
            }
        });
    }

    /// Add screen video, then its audio, to one transport
    pub async fn add_screen_tracks(&self, transport: &Arc<dyn PeerTransport>, screen: &MediaStream) {
        for track in screen.video_tracks().into_iter().chain(screen.audio_tracks()) {
            if let Err(e) = transport.add_track(&track, screen).await {
                warn!(
                    "Failed to add {} track for {}: {}",
                    track.kind(),
                    short_id(transport.peer_id()),
                    e
                );
            }
        }
    }

    /// Remove video senders and every audio sender that is not the mic
    pub async fn remove_screen_tracks(&self, transport: &Arc<dyn PeerTransport>) {
        let mic = self.ctx.local_audio_track();
        for sender in transport.senders() {
            let remove = match &sender.track {
                Some(track) if track.kind() == TrackKind::Video => true,
                Some(track) => !mic.as_ref().is_some_and(|m| m.same_as(track)),
                None => false,
            };
            if remove {
                if let Err(e) = transport.remove_track(sender.id).await {
                    debug!("Failed to remove sender {}: {}", sender.id, e);
                }
            }
        }
    }

    /// Re-point a displaced mic sender back at the local track
    pub async fn ensure_mic_sender(&self, transport: &Arc<dyn PeerTransport>) {
        let Some(mic) = self.ctx.local_audio_track() else {
            return;
        };
        let senders = transport.senders();
        if senders
            .iter()
            .any(|s| s.track.as_ref().is_some_and(|t| t.same_as(&mic)))
        {
            return;
        }
        if let Some(sender) = self.find_mic_sender(&senders) {
            warn!(
                "Mic sender for {} lost its track, reattaching",
                short_id(transport.peer_id())
            );
            if let Err(e) = transport.replace_track(sender, Some(&mic)).await {
                warn!("Failed to reattach mic for {}: {}", short_id(transport.peer_id()), e);
            }
        }
    }

    fn find_mic_sender(&self, senders: &[SenderInfo]) -> Option<SenderId> {
        let screen = self.ctx.screen_stream();
        senders
            .iter()
            .find(|s| match &s.track {
                None => true,
                Some(track) => {
                    track.kind() == TrackKind::Audio
                        && !screen.as_ref().is_some_and(|st| st.track(track.id()).is_some())
                }
            })
            .map(|s| s.id)
    }

    /// Swap the outgoing mic track on every open connection; returns how
    /// many senders were updated
    pub async fn replace_audio_track(&self, track: &MediaTrack) -> usize {
        let mut replaced = 0;
        for (peer_id, transport) in self.open_peers() {
            let Some(sender) = self.find_mic_sender(&transport.senders()) else {
                debug!("No mic sender on {}", short_id(&peer_id));
                continue;
            };
            match transport.replace_track(sender, Some(track)).await {
                Ok(()) => replaced += 1,
                Err(e) => warn!("Track replace for {} failed: {}", short_id(&peer_id), e),
            }
        }
        replaced
    }

    pub fn stop_detectors(&self) {
        for (_, detector) in self.detectors.lock().drain() {
            detector.stop();
        }
    }

    /// Abort reconnect timers and drop attempt counters and queued candidates
    pub fn cancel_timers(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
        self.attempts.lock().clear();
        self.pending.lock().clear();
    }

    pub async fn close_all(&self) {
        let entries: Vec<(String, PeerEntry)> = self.peers.lock().drain().collect();
        for (peer_id, entry) in entries {
            entry.cancel.cancel();
            let _ = entry.transport.close().await;
            self.ctx.playback.detach(&peer_id);
            debug!("Closed connection to {}", short_id(&peer_id));
        }
        self.ctx.state.update(|s| {
            s.peers.clear();
            s.streams = RemoteStreamSet::default();
        });
    }
}
