//! webrtc-rs peer connection behind the transport seam
//!
//! Outgoing audio tracks are Opus-encoded by a pump task per sender and
//! written as samples; `replace_track` swaps the pump's source while the
//! RTP track (and so the negotiated sender) stays the same. Remote tracks
//! are announced when a remote description is applied, the way a browser
//! fires `ontrack`, and fed once RTP starts flowing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::sdp::SessionDescription as SdpDescription;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::mdns::{mdns_host_name, mdns_mode, mdns_mode_label};
use super::sdp::announced_tracks;
use super::signaling::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState,
};
use super::transport::{PeerTransport, SenderId, SenderInfo, TransportEvent, TransportFactory};
use crate::audio::codec::{OpusDecoder, OpusEncoder};
use crate::config::{AudioConfig, TransportConfig};
use crate::error::{AppError, Result};
use crate::ice::IceServer;
use crate::media::{MediaFrame, MediaStream, MediaTrack, TrackKind, FRAME_SAMPLES};
use crate::utils::{short_id, LogThrottler};
use crate::{debug_throttled, warn_throttled};

/// Nominal duration of one outgoing video sample
const VIDEO_SAMPLE_DURATION: Duration = Duration::from_millis(33);

/// How long RTP on a track waits for its stream grouping from the description
const TRACK_GROUPING_WAIT: Duration = Duration::from_secs(2);

fn webrtc_err(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::WebRtc(format!("{}: {}", context, e))
}

/// Creates webrtc-rs transports
pub struct WebRtcTransportFactory {
    mdns_mode: MulticastDnsMode,
    opus_bitrate: i32,
    throttler: Arc<LogThrottler>,
}

impl WebRtcTransportFactory {
    pub fn new(transport: &TransportConfig, audio: &AudioConfig) -> Self {
        Self {
            mdns_mode: mdns_mode(&transport.mdns_mode),
            opus_bitrate: audio.opus_bitrate,
            throttler: Arc::new(LogThrottler::default()),
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| webrtc_err("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| webrtc_err("Failed to register interceptors", e))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(self.mdns_mode);
        if self.mdns_mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(short_id(peer_id)));
        }
        debug!(
            "WebRTC mDNS mode: {} (peer {})",
            mdns_mode_label(self.mdns_mode),
            short_id(peer_id)
        );

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| webrtc_err("Failed to create peer connection", e))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WebRtcTransport {
            peer_id: peer_id.to_string(),
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            remote: Arc::new(RemoteTracks::default()),
            opus_bitrate: self.opus_bitrate,
            events: events_tx,
            throttler: self.throttler.clone(),
        });
        transport.setup_event_handlers();

        Ok((transport, events_rx))
    }
}

struct OutgoingSender {
    rtp_sender: Arc<RTCRtpSender>,
    local: Arc<TrackLocalStaticSample>,
    track: Option<MediaTrack>,
    pump: Option<JoinHandle<()>>,
}

impl OutgoingSender {
    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Remote tracks keyed by track id, grouped into streams by stream id
#[derive(Default)]
struct RemoteTracks {
    tracks: Mutex<HashMap<String, MediaTrack>>,
    streams: Mutex<HashMap<String, MediaStream>>,
    changed: Notify,
}

impl RemoteTracks {
    fn insert(&self, kind: TrackKind, stream_id: &str, track_id: &str) -> (MediaTrack, MediaStream) {
        let track = MediaTrack::with_id(track_id, kind, format!("remote-{}", kind));
        let stream = self
            .streams
            .lock()
            .entry(stream_id.to_string())
            .or_insert_with(|| MediaStream::with_id(stream_id, vec![]))
            .clone();
        stream.add_track(track.clone());
        self.tracks.lock().insert(track_id.to_string(), track.clone());
        self.changed.notify_waiters();
        (track, stream)
    }

    /// Wait until a track id is registered, up to `wait`
    async fn wait_for(&self, track_id: &str, wait: Duration) -> Option<MediaTrack> {
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            let changed = self.changed.notified();
            if let Some(track) = self.tracks.lock().get(track_id).cloned() {
                return Some(track);
            }
            tokio::select! {
                _ = changed => {}
                _ = &mut deadline => return None,
            }
        }
    }

    fn end_all(&self) {
        for track in self.tracks.lock().drain().map(|(_, t)| t) {
            track.stop();
        }
        self.streams.lock().clear();
    }
}

/// webrtc-rs backed [`PeerTransport`]
pub struct WebRtcTransport {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, OutgoingSender>>,
    next_sender: AtomicU64,
    remote: Arc<RemoteTracks>,
    opus_bitrate: i32,
    events: mpsc::UnboundedSender<TransportEvent>,
    throttler: Arc<LogThrottler>,
}

impl WebRtcTransport {
    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let peer_id = peer_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    debug!("Peer {} transport state: {}", short_id(&peer_id), new_state);
                    let _ = events.send(TransportEvent::ConnectionState(new_state));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();

                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate: {}", init.candidate);
                            let _ = events.send(TransportEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let remote = self.remote.clone();
        let peer_id = self.peer_id.clone();
        let throttler = self.throttler.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = remote.clone();
                let peer_id = peer_id.clone();
                let throttler = throttler.clone();

                Box::pin(async move {
                    let track_id = track.id();
                    // RTP can beat the description that groups this track into its stream
                    let Some(local) = remote.wait_for(&track_id, TRACK_GROUPING_WAIT).await else {
                        let kind = match track.kind() {
                            RTPCodecType::Video => TrackKind::Video,
                            _ => TrackKind::Audio,
                        };
                        warn!(
                            "Ignoring {} track {} from {}: no stream in remote description",
                            kind,
                            track_id,
                            short_id(&peer_id)
                        );
                        return;
                    };
                    info!(
                        "Remote {} track flowing from {}",
                        local.kind(),
                        short_id(&peer_id)
                    );
                    tokio::spawn(pump_remote(track, local, peer_id, throttler));
                })
            },
        ));
    }

    /// Announce tracks new in a remote description and end the ones it dropped
    fn sync_remote_tracks(&self, desc: &SdpDescription) {
        let announced = announced_tracks(desc);
        let keep: HashSet<&str> = announced.iter().map(|a| a.track_id.as_str()).collect();

        let dropped: Vec<MediaTrack> = {
            let mut tracks = self.remote.tracks.lock();
            let ids: Vec<String> = tracks
                .keys()
                .filter(|id| !keep.contains(id.as_str()))
                .cloned()
                .collect();
            ids.iter().filter_map(|id| tracks.remove(id)).collect()
        };
        {
            let mut streams = self.remote.streams.lock();
            for track in &dropped {
                for stream in streams.values() {
                    stream.remove_track(track.id());
                }
            }
            streams.retain(|_, s| !s.tracks().is_empty());
        }
        for track in dropped {
            debug!("Remote {} track {} removed", track.kind(), track.id());
            track.stop();
        }

        let mut added = Vec::new();
        for a in &announced {
            if self.remote.tracks.lock().contains_key(&a.track_id) {
                continue;
            }
            let (track, _) = self.remote.insert(a.kind, &a.stream_id, &a.track_id);
            added.push((track, a.stream_id.clone()));
        }
        // Announce once every track of the description is in its stream
        for (track, stream_id) in added {
            let stream = self.remote.streams.lock().get(&stream_id).cloned();
            if let Some(stream) = stream {
                let _ = self.events.send(TransportEvent::Track { track, stream });
            }
        }
    }

    fn spawn_pump(&self, track: &MediaTrack, local: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
        let mut reader = track.reader();
        let kind = track.kind();
        let bitrate = self.opus_bitrate;
        let peer_id = self.peer_id.clone();
        let throttler = self.throttler.clone();

        tokio::spawn(async move {
            let key = format!("{}:write", peer_id);
            match kind {
                TrackKind::Audio => {
                    let mut encoder = match OpusEncoder::new(bitrate) {
                        Ok(encoder) => encoder,
                        Err(e) => {
                            warn!("Audio sender for {} disabled: {}", short_id(&peer_id), e);
                            return;
                        }
                    };
                    while let Some(frame) = reader.next_audio().await {
                        let packets = match encoder.push(&frame.samples) {
                            Ok(packets) => packets,
                            Err(e) => {
                                warn_throttled!(throttler, &key, "Opus encode for {} failed: {}", short_id(&peer_id), e);
                                continue;
                            }
                        };
                        for packet in packets {
                            let sample = Sample {
                                data: packet.data,
                                duration: Duration::from_micros(packet.samples as u64 * 1_000_000 / 48000),
                                ..Default::default()
                            };
                            if let Err(e) = local.write_sample(&sample).await {
                                warn_throttled!(throttler, &key, "Failed to write audio to {}: {}", short_id(&peer_id), e);
                            }
                        }
                    }
                }
                TrackKind::Video => {
                    while let Some(frame) = reader.next().await {
                        let MediaFrame::Video(data) = frame else { continue };
                        let sample = Sample {
                            data,
                            duration: VIDEO_SAMPLE_DURATION,
                            ..Default::default()
                        };
                        if let Err(e) = local.write_sample(&sample).await {
                            warn_throttled!(throttler, &key, "Failed to write video to {}: {}", short_id(&peer_id), e);
                        }
                    }
                }
            }
        })
    }

    fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| webrtc_err("Invalid session description", e))
    }
}

/// Feed a remote RTP track into its local media track
async fn pump_remote(
    remote: Arc<TrackRemote>,
    track: MediaTrack,
    peer_id: String,
    throttler: Arc<LogThrottler>,
) {
    let mut decoder = match track.kind() {
        TrackKind::Audio => match OpusDecoder::new() {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                warn!("Remote audio from {} not decodable: {}", short_id(&peer_id), e);
                return;
            }
        },
        TrackKind::Video => None,
    };
    let key = format!("{}:decode", peer_id);

    loop {
        let packet = tokio::select! {
            _ = track.ended() => break,
            result = remote.read_rtp() => match result {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!("Remote track from {} closed: {}", short_id(&peer_id), e);
                    break;
                }
            },
        };
        if packet.payload.is_empty() {
            continue;
        }
        match decoder.as_mut() {
            Some(decoder) => match decoder.decode(&packet.payload) {
                Ok(samples) => {
                    for chunk in samples.chunks(FRAME_SAMPLES) {
                        track.push_audio(chunk.to_vec());
                    }
                }
                Err(e) => {
                    debug_throttled!(throttler, &key, "Opus decode from {} failed: {}", short_id(&peer_id), e);
                }
            },
            None => track.push(MediaFrame::Video(packet.payload.clone())),
        }
    }
    track.stop();
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn add_track(&self, track: &MediaTrack, stream: &MediaStream) -> Result<SenderId> {
        let local = Arc::new(TrackLocalStaticSample::new(
            Self::codec_for(track.kind()),
            track.id().to_string(),
            stream.id().to_string(),
        ));
        let rtp_sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| webrtc_err("Failed to add track", e))?;

        // RTCP has to be drained for interceptors to work
        let rtcp = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        let id = self.next_sender.fetch_add(1, Ordering::SeqCst);
        let pump = self.spawn_pump(track, local.clone());
        self.senders.lock().insert(
            id,
            OutgoingSender {
                rtp_sender,
                local,
                track: Some(track.clone()),
                pump: Some(pump),
            },
        );
        debug!("{} track {} added for {}", track.kind(), track.id(), short_id(&self.peer_id));
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let entry = self.senders.lock().remove(&sender);
        let Some(mut entry) = entry else {
            return Err(AppError::InvalidState(format!("Unknown sender {}", sender)));
        };
        entry.stop_pump();
        self.pc
            .remove_track(&entry.rtp_sender)
            .await
            .map_err(|e| webrtc_err("Failed to remove track", e))
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&MediaTrack>) -> Result<()> {
        let local = {
            let mut senders = self.senders.lock();
            let entry = senders
                .get_mut(&sender)
                .ok_or_else(|| AppError::InvalidState(format!("Unknown sender {}", sender)))?;
            entry.stop_pump();
            entry.track = track.cloned();
            entry.local.clone()
        };
        if let Some(track) = track {
            let pump = self.spawn_pump(track, local);
            if let Some(entry) = self.senders.lock().get_mut(&sender) {
                entry.pump = Some(pump);
            } else {
                pump.abort();
            }
        }
        Ok(())
    }

    fn senders(&self) -> Vec<SenderInfo> {
        let mut senders: Vec<SenderInfo> = self
            .senders
            .lock()
            .iter()
            .map(|(id, s)| SenderInfo {
                id: *id,
                track: s.track.clone(),
            })
            .collect();
        senders.sort_by_key(|s| s.id);
        senders
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| webrtc_err("Failed to create data channel", e))?;
        debug!("Data channel '{}' created for {}", label, short_id(&self.peer_id));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| webrtc_err("Failed to create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| webrtc_err("Failed to create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| webrtc_err("Failed to set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = Self::to_rtc(desc)?;
        let parsed = desc
            .unmarshal()
            .map_err(|e| webrtc_err("Invalid session description", e))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| webrtc_err("Failed to set remote description", e))?;
        self.sync_remote_tracks(&parsed);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            return Err(AppError::InvalidState(
                "ICE candidate before remote description".to_string(),
            ));
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| webrtc_err("Failed to add ICE candidate", e))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        match self.pc.connection_state() {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }

    async fn close(&self) -> Result<()> {
        for (_, mut sender) in self.senders.lock().drain() {
            sender.stop_pump();
        }
        self.remote.end_all();
        self.pc
            .close()
            .await
            .map_err(|e| webrtc_err("Failed to close peer connection", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_capabilities() {
        let audio = WebRtcTransport::codec_for(TrackKind::Audio);
        assert_eq!(audio.mime_type, MIME_TYPE_OPUS);
        assert_eq!(audio.clock_rate, 48000);
        let video = WebRtcTransport::codec_for(TrackKind::Video);
        assert_eq!(video.clock_rate, 90000);
    }

    #[tokio::test]
    async fn test_offer_announces_audio_and_data() {
        let factory =
            WebRtcTransportFactory::new(&TransportConfig::default(), &AudioConfig::default());
        let (transport, _events) = factory.create("peer-a", &[]).await.unwrap();

        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        let stream = MediaStream::new(vec![mic.clone()]);
        let sender = transport.add_track(&mic, &stream).await.unwrap();
        transport.create_data_channel("_sctp").await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=application"));
        assert!(offer.sdp.contains(stream.id()));

        transport.set_local_description(offer).await.unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!transport.has_remote_description().await);
        assert!(transport
            .add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host"))
            .await
            .is_err());

        let other = MediaTrack::new(TrackKind::Audio, "mic2");
        transport.replace_track(sender, Some(&other)).await.unwrap();
        assert_eq!(transport.senders()[0].track_id(), Some(other.id()));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_track_waits_for_stream_grouping() {
        let remote = Arc::new(RemoteTracks::default());
        let waiter = {
            let remote = remote.clone();
            tokio::spawn(async move {
                remote
                    .wait_for("screen-audio", Duration::from_secs(2))
                    .await
            })
        };
        tokio::task::yield_now().await;

        remote.insert(TrackKind::Video, "screen", "screen-video");
        remote.insert(TrackKind::Audio, "screen", "screen-audio");

        let track = waiter.await.unwrap().unwrap();
        assert_eq!(track.id(), "screen-audio");
        let stream = remote.streams.lock().get("screen").cloned().unwrap();
        assert_eq!(stream.tracks().len(), 2);

        assert!(remote
            .wait_for("ungrouped", Duration::from_millis(20))
            .await
            .is_none());
        assert!(!remote.tracks.lock().contains_key("ungrouped"));
    }
}
