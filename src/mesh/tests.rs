//! Multi-participant tests over the in-process hub and the fake transport

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};

use super::*;
use crate::agent::{AgentMixer, PipelineAccess};
use crate::config::{PreferenceStore, VoiceConfig};
use crate::events::VoiceEvent;
use crate::ice::IceCredentialProvider;
use crate::media::{Signal, SyntheticDevices};
use crate::signaling::{ChannelDirectory, MemoryHub, PresenceEntry, SignalingMessage};
use crate::utils::now_millis;
use crate::webrtc::mock::MockNetwork;
use crate::webrtc::{ConnectionState, IceCandidate, PeerTransport, TransportFactory};

const GROUP: &str = "g";
const CHANNEL: &str = "c1";

struct Participant {
    client: Arc<VoiceClient>,
    devices: Arc<SyntheticDevices>,
}

fn devices() -> SyntheticDevices {
    SyntheticDevices::with_default_tone(440.0).with_input(
        "usb",
        "USB Microphone",
        Signal::Noise { amplitude: 0.2 },
    )
}

async fn participant(
    uid: &str,
    hub: &MemoryHub,
    network: &MockNetwork,
    devices: SyntheticDevices,
) -> Participant {
    let mut config = VoiceConfig::default();
    config.audio.noise_suppression = false;
    let prefs = PreferenceStore::in_memory().await.unwrap();
    let devices = Arc::new(devices);
    let services = VoiceServices {
        directory: Arc::new(hub.clone()),
        transports: network.factory(uid),
        devices: devices.clone(),
        ice: Arc::new(IceCredentialProvider::new(&config.ice, None)),
        prefs,
    };
    Participant {
        client: Arc::new(VoiceClient::new(Identity::new(uid, uid), config, services)),
        devices,
    }
}

async fn wait_state(client: &VoiceClient, what: &str, pred: impl Fn(&VoiceState) -> bool) -> VoiceState {
    let mut rx = client.subscribe_state();
    let result = timeout(Duration::from_secs(10), rx.wait_for(|s| pred(s)))
        .await
        .map(|r| r.map(|state| state.clone()));
    match result {
        Ok(Ok(state)) => state,
        _ => panic!("timed out waiting for {}", what),
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}

fn drain(rx: &mut broadcast::Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

fn connected(state: &VoiceState, peer: &str) -> bool {
    state.peers.get(peer) == Some(&ConnectionState::Connected)
        && state.streams.audio.contains_key(peer)
}

async fn connected_pair(hub: &MemoryHub, network: &MockNetwork) -> (Participant, Participant) {
    let alice = participant("alice", hub, network, devices()).await;
    let bob = participant("bob", hub, network, devices()).await;
    assert!(alice.client.join(GROUP, CHANNEL).await);
    assert!(bob.client.join(GROUP, CHANNEL).await);
    wait_state(&alice.client, "alice connected", |s| connected(s, "bob")).await;
    wait_state(&bob.client, "bob connected", |s| connected(s, "alice")).await;
    (alice, bob)
}

#[tokio::test]
async fn test_two_participants_connect() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    // Only the smaller id offers
    let offerer = network.latest("alice", "bob").unwrap();
    let answerer = network.latest("bob", "alice").unwrap();
    assert_eq!(offerer.offers_created(), 1);
    assert_eq!(answerer.offers_created(), 0);
    assert_eq!(offerer.data_channels(), vec!["_sctp".to_string()]);
    assert!(answerer.data_channels().is_empty());
    assert_eq!(network.transports("alice", "bob").len(), 1);
    assert_eq!(network.transports("bob", "alice").len(), 1);

    // Initial offers carry audio only
    assert_eq!(
        offerer.sent_kinds(),
        vec![Some(crate::media::TrackKind::Audio)]
    );

    wait_until("candidates applied", || {
        !offerer.applied_candidates().is_empty() && !answerer.applied_candidates().is_empty()
    })
    .await;
    assert_eq!(offerer.invalid_state_errors(), 0);
    assert_eq!(answerer.invalid_state_errors(), 0);

    let state = wait_state(&bob.client, "both present", |s| s.voice_users.len() == 2).await;
    assert!(state.in_voice);
    assert!(!state.streams.audio["alice"].has_video());

    alice.client.leave().await;
    bob.client.leave().await;
}

#[tokio::test]
async fn test_screen_share_reaches_peer_and_ends_once() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;
    let mic_stream_id = bob.client.state().streams.audio["alice"].id().to_string();
    let mut bob_events = bob.client.subscribe_events();

    assert!(alice.client.start_screen_share().await);
    let state = wait_state(&bob.client, "screen stream", |s| {
        s.streams.video.contains_key("alice")
    })
    .await;
    assert!(state.streams.video["alice"].has_video());
    // Screen audio never replaces the mic stream
    assert_eq!(state.streams.audio["alice"].id(), mic_stream_id);
    assert!(alice.client.state().screen_sharing);
    assert!(hub
        .presence_entries(GROUP, CHANNEL)
        .iter()
        .any(|e| e.uid == "alice" && e.is_screen_sharing));

    assert!(alice.client.stop_screen_share().await);
    wait_state(&bob.client, "screen stream removed", |s| {
        !s.streams.video.contains_key("alice")
    })
    .await;
    sleep(Duration::from_millis(100)).await;

    let events = drain(&mut bob_events);
    let live = events
        .iter()
        .filter(|e| matches!(e, VoiceEvent::StreamLive { peer_id } if peer_id == "alice"))
        .count();
    let ended = events
        .iter()
        .filter(|e| matches!(e, VoiceEvent::StreamEnded { peer_id } if peer_id == "alice"))
        .count();
    assert_eq!(live, 1);
    assert_eq!(ended, 1);

    // Mic sender survives the renegotiations
    let offerer = network.latest("alice", "bob").unwrap();
    let session = alice.client.session().unwrap();
    let mic = session.output_track().unwrap();
    let senders = offerer.senders();
    assert_eq!(senders.len(), 1);
    assert!(senders[0].track.as_ref().unwrap().same_as(&mic));
    assert_eq!(bob.client.state().peers["alice"], ConnectionState::Connected);

    alice.client.leave().await;
    bob.client.leave().await;
}

async fn sharer_then_joiner(sharer: &str, joiner: &str) {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let first = participant(sharer, &hub, &network, devices()).await;
    assert!(first.client.join(GROUP, CHANNEL).await);
    assert!(first.client.start_screen_share().await);

    let second = participant(joiner, &hub, &network, devices()).await;
    assert!(second.client.join(GROUP, CHANNEL).await);
    let state = wait_state(&second.client, "existing screen share", |s| {
        connected(s, sharer) && s.streams.video.contains_key(sharer)
    })
    .await;
    assert!(state.streams.video[sharer].has_video());
    assert!(!state.streams.audio[sharer].has_video());
    assert_eq!(first.client.state().peers[joiner], ConnectionState::Connected);

    first.client.leave().await;
    second.client.leave().await;
}

#[tokio::test]
async fn test_joiner_receives_offerer_screen_share() {
    sharer_then_joiner("alice", "bob").await;
}

#[tokio::test]
async fn test_joiner_receives_answerer_screen_share() {
    sharer_then_joiner("bob", "alice").await;
}

#[tokio::test]
async fn test_display_capture_end_stops_sharing() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    assert!(alice.client.start_screen_share().await);
    wait_state(&bob.client, "screen stream", |s| s.streams.video.contains_key("alice")).await;

    alice.devices.end_display_capture();
    wait_state(&alice.client, "sharing stopped", |s| !s.screen_sharing).await;
    wait_state(&bob.client, "screen stream removed", |s| {
        !s.streams.video.contains_key("alice")
    })
    .await;

    alice.client.leave().await;
    bob.client.leave().await;
}

#[tokio::test]
async fn test_device_switch_keeps_connection() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;
    let mut alice_events = alice.client.subscribe_events();
    let before = alice.client.session().unwrap().output_track().unwrap();

    assert!(alice.client.switch_input("usb").await);

    let session = alice.client.session().unwrap();
    let after = session.output_track().unwrap();
    assert!(!after.same_as(&before));
    let offerer = network.latest("alice", "bob").unwrap();
    let senders = offerer.senders();
    assert_eq!(senders.len(), 1);
    assert!(senders[0].track.as_ref().unwrap().same_as(&after));

    sleep(Duration::from_millis(100)).await;
    let events = drain(&mut alice_events);
    assert!(events.iter().any(|e| matches!(e, VoiceEvent::PipelineRebuilt)));
    assert!(events.iter().any(|e| matches!(
        e,
        VoiceEvent::InputSwitched { device_id: Some(id) } if id == "usb"
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        VoiceEvent::PeerStateChanged { state: ConnectionState::Failed, .. }
    )));
    assert_eq!(network.transports("alice", "bob").len(), 1);
    assert_eq!(alice.client.state().peers["bob"], ConnectionState::Connected);
    assert_eq!(bob.client.state().peers["alice"], ConnectionState::Connected);
    assert_eq!(alice.client.state().selected_input.as_deref(), Some("usb"));

    alice.client.leave().await;
    bob.client.leave().await;
}

#[tokio::test]
async fn test_departed_participant_removed_without_reconnect() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;
    let carol = participant("carol", &hub, &network, devices()).await;
    assert!(carol.client.join(GROUP, CHANNEL).await);
    wait_state(&alice.client, "alice-carol", |s| connected(s, "carol")).await;
    wait_state(&bob.client, "bob-carol", |s| connected(s, "carol")).await;
    let mut alice_events = alice.client.subscribe_events();

    // Tab closed: presence vanishes, nothing else happens
    hub.presence(GROUP, CHANNEL).delete("carol").await.unwrap();

    wait_state(&alice.client, "carol removed", |s| !s.peers.contains_key("carol")).await;
    wait_state(&bob.client, "carol removed", |s| !s.peers.contains_key("carol")).await;
    assert!(network.latest("alice", "carol").unwrap().is_closed());
    assert!(network.latest("bob", "carol").unwrap().is_closed());

    sleep(Duration::from_millis(200)).await;
    let events = drain(&mut alice_events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, VoiceEvent::PeerReconnecting { .. })));
    assert_eq!(network.transports("alice", "carol").len(), 1);
    assert_eq!(alice.client.state().peers["bob"], ConnectionState::Connected);

    alice.client.leave().await;
    bob.client.leave().await;
    carol.client.leave().await;
}

#[tokio::test]
async fn test_reconnect_bounded() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    hub.presence(GROUP, CHANNEL)
        .set(PresenceEntry::new("bob", "Bob", now_millis()))
        .await
        .unwrap();
    tokio::time::pause();

    let mut events = alice.client.subscribe_events();
    assert!(alice.client.join(GROUP, CHANNEL).await);
    wait_until("first offer", || network.transports("alice", "bob").len() == 1).await;

    let mut delays = Vec::new();
    for attempt in 1..=3usize {
        let failed_at = Instant::now();
        network
            .latest("alice", "bob")
            .unwrap()
            .emit_state(ConnectionState::Failed);
        wait_until("recreated", || {
            network.transports("alice", "bob").len() == attempt + 1
        })
        .await;
        delays.push(failed_at.elapsed());
    }
    for (delay, expected) in delays.iter().zip([2000u64, 4000, 6000]) {
        assert!(delay.as_millis() as u64 >= expected, "{:?} < {}", delay, expected);
        assert!((delay.as_millis() as u64) < expected + 100, "{:?}", delay);
    }

    network
        .latest("alice", "bob")
        .unwrap()
        .emit_state(ConnectionState::Failed);
    sleep(Duration::from_secs(30)).await;

    assert_eq!(network.transports("alice", "bob").len(), 4);
    let session = alice.client.session().unwrap();
    assert!(session.peers().is_abandoned("bob"));
    assert!(session.peers().transport("bob").is_none());
    assert!(!alice.client.state().peers.contains_key("bob"));

    let announced: Vec<u64> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            VoiceEvent::PeerReconnecting { delay_ms, .. } => Some(delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec![2000, 4000, 6000]);

    alice.client.leave().await;
}

#[tokio::test]
async fn test_early_candidates_are_queued() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    assert!(alice.client.join(GROUP, CHANNEL).await);
    wait_state(&alice.client, "presence settled", |s| s.voice_users.len() == 1).await;
    let signaling = hub.signaling(GROUP, CHANNEL);

    let candidate = |n: u32| SignalingMessage::IceCandidate {
        from: "zed".to_string(),
        to: "alice".to_string(),
        candidate: IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n)),
    };
    for n in 1..=2 {
        signaling.add(candidate(n).to_document().unwrap()).await.unwrap();
    }
    // Malformed candidate must not stop the flush
    let broken = SignalingMessage::IceCandidate {
        from: "zed".to_string(),
        to: "alice".to_string(),
        candidate: IceCandidate::new(""),
    };
    signaling.add(broken.to_document().unwrap()).await.unwrap();

    let (remote, _events) = network.factory("zed").create("alice", &[]).await.unwrap();
    let offer = remote.create_offer().await.unwrap();
    remote.set_local_description(offer.clone()).await.unwrap();
    let message = SignalingMessage::Offer {
        from: "zed".to_string(),
        to: "alice".to_string(),
        sdp: offer.sdp,
    };
    signaling.add(message.to_document().unwrap()).await.unwrap();
    signaling.add(candidate(3).to_document().unwrap()).await.unwrap();

    wait_until("candidates applied", || {
        network
            .latest("alice", "zed")
            .is_some_and(|t| t.applied_candidates().len() == 3)
    })
    .await;
    let transport = network.latest("alice", "zed").unwrap();
    assert_eq!(transport.invalid_state_errors(), 0);

    // Every document addressed to alice was consumed
    wait_until("documents deleted", || {
        hub.signaling_documents(GROUP, CHANNEL)
            .iter()
            .all(|d| d.body["to"] != "alice")
    })
    .await;

    alice.client.leave().await;
}

#[tokio::test]
async fn test_queued_candidates_dropped_when_sender_leaves() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    assert!(alice.client.join(GROUP, CHANNEL).await);
    // "aaron" sorts first, so alice waits for an offer that never comes
    hub.presence(GROUP, CHANNEL)
        .set(PresenceEntry::new("aaron", "Aaron", now_millis()))
        .await
        .unwrap();
    wait_state(&alice.client, "aaron present", |s| s.voice_users.len() == 2).await;

    let signaling = hub.signaling(GROUP, CHANNEL);
    for n in 1..=2 {
        let message = SignalingMessage::IceCandidate {
            from: "aaron".to_string(),
            to: "alice".to_string(),
            candidate: IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n)),
        };
        signaling.add(message.to_document().unwrap()).await.unwrap();
    }
    let session = alice.client.session().unwrap();
    wait_until("candidates queued", || session.peers().pending_candidates("aaron") == 2).await;

    hub.presence(GROUP, CHANNEL).delete("aaron").await.unwrap();
    wait_state(&alice.client, "aaron gone", |s| s.voice_users.len() == 1).await;
    wait_until("queue dropped", || session.peers().pending_candidates("aaron") == 0).await;
    assert!(network.transports("alice", "aaron").is_empty());

    alice.client.leave().await;
}

#[tokio::test]
async fn test_malformed_documents_only_deleted_for_addressee() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    assert!(alice.client.join(GROUP, CHANNEL).await);
    let signaling = hub.signaling(GROUP, CHANNEL);

    signaling
        .add(serde_json::json!({"type": "bogus", "from": "x", "to": "alice"}))
        .await
        .unwrap();
    signaling
        .add(serde_json::json!({"type": "bogus", "from": "x", "to": "someone"}))
        .await
        .unwrap();

    wait_until("malformed deleted", || {
        hub.signaling_documents(GROUP, CHANNEL)
            .iter()
            .all(|d| d.body["to"] != "alice")
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.signaling_documents(GROUP, CHANNEL).len(), 1);
    assert!(alice.client.state().in_voice);

    alice.client.leave().await;
}

#[tokio::test]
async fn test_join_failure_leaves_nothing_behind() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    alice.devices.deny_permission(Some("NotAllowedError"));

    assert!(!alice.client.join(GROUP, CHANNEL).await);
    let state = alice.client.state();
    assert!(!state.in_voice);
    assert_eq!(state.error.as_deref(), Some("mic access denied: NotAllowedError"));
    assert!(hub.presence_entries(GROUP, CHANNEL).is_empty());
    assert!(alice.client.session().is_none());

    // Stopping something that never started is harmless
    alice.client.leave().await;
}

#[tokio::test]
async fn test_second_join_rejected() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    assert!(alice.client.join(GROUP, CHANNEL).await);
    assert!(!alice.client.join(GROUP, "c2").await);
    assert_eq!(alice.client.state().channel_id.as_deref(), Some(CHANNEL));

    // The guard belongs to the client; another client is another participant
    let bob = participant("bob", &hub, &network, devices()).await;
    assert!(bob.client.join(GROUP, "c2").await);
    assert_eq!(bob.client.state().channel_id.as_deref(), Some("c2"));
    bob.client.leave().await;

    alice.client.leave().await;
    alice.client.leave().await;
    assert!(!alice.client.state().in_voice);
}

#[tokio::test]
async fn test_leave_cleans_presence_and_signaling() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    bob.client.leave().await;
    wait_state(&alice.client, "bob gone", |s| !s.peers.contains_key("bob")).await;

    assert!(!hub
        .presence_entries(GROUP, CHANNEL)
        .iter()
        .any(|e| e.uid == "bob"));
    assert!(!hub.signaling_documents(GROUP, CHANNEL).iter().any(|d| {
        d.body["from"] == "bob" || d.body["to"] == "bob"
    }));
    let state = bob.client.state();
    assert!(!state.in_voice);
    assert!(state.peers.is_empty());
    assert!(network.latest("bob", "alice").unwrap().is_closed());

    alice.client.leave().await;
}

#[tokio::test]
async fn test_mute_and_deafen_compose() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;
    let client = &alice.client;

    assert_eq!(client.toggle_mute(), AudioOutputState::Muted);
    assert_eq!(
        client.toggle_deafen(),
        AudioOutputState::Deafened { prior_muted: true }
    );
    // Mute is ignored while deafened
    assert_eq!(
        client.toggle_mute(),
        AudioOutputState::Deafened { prior_muted: true }
    );
    assert_eq!(client.toggle_deafen(), AudioOutputState::Muted);
    let state = client.state();
    assert!(state.muted);
    assert!(!state.deafened);
}

#[tokio::test]
async fn test_deafen_silences_playback_and_mutes_pipeline() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    alice.client.toggle_deafen();
    let session = alice.client.session().unwrap();
    assert!(session.context().playback.is_deafened());
    assert!(alice.client.state().deafened);
    wait_state(&alice.client, "not speaking", |s| !s.is_speaking("alice")).await;

    alice.client.toggle_deafen();
    assert!(!session.context().playback.is_deafened());

    alice.client.leave().await;
    bob.client.leave().await;
}

#[tokio::test]
async fn test_preferences_flow_into_state() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let alice = participant("alice", &hub, &network, devices()).await;

    assert_eq!(alice.client.set_user_volume("bob", 1.7).await, 1.0);
    alice.client.set_vad_threshold(32.0).await;
    assert!(alice.client.switch_input("usb").await);

    let state = alice.client.state();
    assert_eq!(state.user_volumes["bob"], 1.0);
    assert_eq!(state.vad_threshold, 32.0);
    assert_eq!(state.selected_input.as_deref(), Some("usb"));
    assert!(alice.devices.requests().is_empty());
}

#[tokio::test]
async fn test_agent_mixer_follows_session() {
    let hub = MemoryHub::new();
    let network = MockNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    let access: Arc<dyn PipelineAccess> = alice.client.clone();
    let mixer = AgentMixer::attach(access).unwrap();
    assert_eq!(mixer.sources(), vec!["local".to_string(), "peer:bob".to_string()]);
    assert!(mixer.play(&[0.1; 480]));

    // Device switch re-points the agent at the rebuilt pipeline
    assert!(alice.client.switch_input("usb").await);
    wait_until("destination resynced", || mixer.play(&[0.0; 480])).await;
    assert!(mixer.sources().contains(&"local".to_string()));

    alice.client.leave().await;
    assert!(mixer.is_detached());
    assert!(!mixer.play(&[0.1; 480]));
    bob.client.leave().await;
}
