//! Voice session: the mesh orchestrator
//!
//! One `VoiceSession` exists per joined channel. It owns the audio engine,
//! the microphone pipeline, the local speech detector and the presence and
//! signaling subscriptions, and drives the [`PeerManager`] from them.
//!
//! Teardown order matters: the active flag flips first so every callback
//! still in flight bails out, then the before-stop hook runs while the
//! engine is still open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::context::{ContextParts, SessionContext};
use super::output::AudioOutputState;
use super::peer_manager::PeerManager;
use super::presence;
use super::state::StateHandle;
use crate::audio::{
    AudioEngine, AudioPipeline, DetectorHandle, DetectorInput, DetectorOptions,
    PipelineDestination, PipelineOptions, RemotePlayback, SpeakingCallback, SpeechDetector,
    ThresholdFn,
};
use crate::config::{AudioConfig, PreferenceStore, VoiceConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, VoiceEvent};
use crate::ice::IceCredentialProvider;
use crate::media::{AudioConstraints, DeviceKind, MediaDevices, MediaStream, MediaTrack};
use crate::signaling::{ChannelDirectory, PresenceEntry, SignalDocument};
use crate::utils::now_millis;
use crate::webrtc::TransportFactory;

/// Callback run before the session tears anything down
pub type BeforeStopHook = Box<dyn FnOnce() + Send>;

/// Slot holding the registered before-stop hook
pub type HookSlot = Arc<Mutex<Option<BeforeStopHook>>>;

/// Everything a session needs from its owner
pub struct SessionParams {
    pub local_uid: String,
    pub group_id: String,
    pub channel_id: String,
    pub config: VoiceConfig,
    pub directory: Arc<dyn ChannelDirectory>,
    pub transports: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub ice: Arc<IceCredentialProvider>,
    pub prefs: PreferenceStore,
    pub events: Arc<EventBus>,
    pub state: StateHandle,
    pub output: Arc<Mutex<AudioOutputState>>,
    pub before_stop: HookSlot,
}

pub struct VoiceSession {
    ctx: Arc<SessionContext>,
    peers: Arc<PeerManager>,
    devices: Arc<dyn MediaDevices>,
    prefs: PreferenceStore,
    audio: AudioConfig,
    raw: Mutex<Option<MediaStream>>,
    pipeline: Mutex<Option<Arc<AudioPipeline>>>,
    local_detector: Mutex<Option<DetectorHandle>>,
    switching: AtomicBool,
    before_stop: HookSlot,
    weak: Weak<VoiceSession>,
}

/// Open the preferred microphone, falling back to the system default
///
/// Returns the stream and the device id actually used.
async fn acquire_mic(
    devices: &dyn MediaDevices,
    preferred: Option<String>,
) -> Result<(MediaStream, Option<String>)> {
    if let Some(device_id) = preferred {
        match devices
            .get_user_media(&AudioConstraints::voice(Some(device_id.clone())))
            .await
        {
            Ok(stream) => return Ok((stream, Some(device_id))),
            Err(e) => warn!("Input {} unavailable ({}), using default device", device_id, e),
        }
    }
    let stream = devices.get_user_media(&AudioConstraints::voice(None)).await?;
    Ok((stream, None))
}

impl VoiceSession {
    /// Start voice in a channel
    ///
    /// Fails when the microphone or the pipeline cannot be set up; nothing
    /// stays acquired in that case.
    pub async fn start(params: SessionParams) -> Result<Arc<Self>> {
        let SessionParams {
            local_uid,
            group_id,
            channel_id,
            config,
            directory,
            transports,
            devices,
            ice,
            prefs,
            events,
            state,
            output,
            before_stop,
        } = params;

        config.validate()?;
        info!("Starting voice in {}/{}", group_id, channel_id);
        let ice_servers = ice.get_ice_servers().await;

        let stored = prefs.get();
        let (raw, input) = acquire_mic(devices.as_ref(), stored.selected_input.clone()).await?;

        match devices.enumerate_devices().await {
            Ok(list) => state.update(|s| {
                s.input_devices = list
                    .iter()
                    .filter(|d| d.kind == DeviceKind::AudioInput)
                    .cloned()
                    .collect();
                s.output_devices = list
                    .iter()
                    .filter(|d| d.kind == DeviceKind::AudioOutput)
                    .cloned()
                    .collect();
            }),
            Err(e) => warn!("Device enumeration failed: {}", e),
        }

        let engine = AudioEngine::new(config.audio.sample_rate);
        let options = PipelineOptions::from(&config.audio);
        let pipeline = match AudioPipeline::build(&engine, &raw, &options).await {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                raw.stop_all();
                engine.close();
                return Err(e);
            }
        };
        let current = *output.lock();
        pipeline.set_muted(current.is_muted());

        let playback = RemotePlayback::start(
            &engine,
            stored.user_volumes.clone(),
            current.is_deafened(),
        );
        if let Err(e) = devices
            .set_output_device(stored.selected_output.as_deref(), &playback.output())
            .await
        {
            warn!("Output routing failed: {}", e);
        }

        let ctx = SessionContext::new(
            ContextParts {
                local_uid,
                signaling: directory.signaling(&group_id, &channel_id),
                presence: directory.presence(&group_id, &channel_id),
                group_id,
                channel_id,
                mesh: config.mesh.clone(),
                vad: config.audio.vad.clone(),
                transports,
                ice_servers,
                engine,
                playback,
                events,
                state,
                output,
            },
            pipeline.output_stream.clone(),
        );
        let peers = PeerManager::new(ctx.clone());

        let session = Arc::new_cyclic(|weak| Self {
            ctx,
            peers,
            devices,
            prefs,
            audio: config.audio,
            raw: Mutex::new(Some(raw)),
            pipeline: Mutex::new(Some(pipeline.clone())),
            local_detector: Mutex::new(None),
            switching: AtomicBool::new(false),
            before_stop,
            weak: weak.clone(),
        });
        session.start_local_detector(&pipeline);

        let subscriptions = async {
            let presence = session.ctx.presence.subscribe().await?;
            let signaling = session.ctx.signaling.subscribe().await?;
            Ok::<_, AppError>((presence, signaling))
        };
        let (presence_rx, signaling_rx) = match subscriptions.await {
            Ok(receivers) => receivers,
            Err(e) => {
                session.stop().await;
                return Err(e);
            }
        };
        session.spawn_presence_task(presence_rx);
        session.spawn_signaling_task(signaling_rx);

        let ctx = &session.ctx;
        ctx.state.update(|s| {
            s.in_voice = true;
            s.group_id = Some(ctx.group_id.clone());
            s.channel_id = Some(ctx.channel_id.clone());
            s.selected_input = input;
            s.error = None;
        });
        ctx.publish(VoiceEvent::VoiceStarted {
            group_id: ctx.group_id.clone(),
            channel_id: ctx.channel_id.clone(),
        });
        info!("Voice started");
        Ok(session)
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    pub fn engine(&self) -> Option<Arc<AudioEngine>> {
        if self.ctx.engine.is_closed() {
            None
        } else {
            Some(self.ctx.engine.clone())
        }
    }

    pub fn pipeline_destination(&self) -> Option<PipelineDestination> {
        self.pipeline.lock().as_ref().map(|p| p.destination.clone())
    }

    /// Mic-only stream, free of agent audio
    pub fn capture_stream(&self) -> Option<MediaStream> {
        self.pipeline.lock().as_ref().map(|p| p.capture_stream.clone())
    }

    /// Track currently sent to peers
    pub fn output_track(&self) -> Option<MediaTrack> {
        self.ctx.local_audio_track()
    }

    pub fn playback_output(&self) -> MediaTrack {
        self.ctx.playback.output()
    }

    fn start_local_detector(&self, pipeline: &AudioPipeline) {
        let ctx = self.ctx.clone();
        let on_change: SpeakingCallback = Arc::new(move |speaking| {
            // A muted or deafened user never shows as speaking
            let speaking = speaking && !ctx.output.lock().is_muted();
            if ctx.state.set_speaking(&ctx.local_uid, speaking) {
                ctx.publish(VoiceEvent::SpeakingChanged {
                    uid: ctx.local_uid.clone(),
                    speaking,
                });
            }
        });
        let prefs = self.prefs.clone();
        let threshold: ThresholdFn = Arc::new(move || prefs.get().vad_threshold);

        let handle = SpeechDetector::attach(
            &self.ctx.engine,
            DetectorInput::Analyser(pipeline.analyser.clone()),
            on_change,
            DetectorOptions {
                gate: Some(pipeline.gate.clone()),
                threshold: Some(threshold),
            },
            &self.ctx.vad,
        );
        if let Some(old) = self.local_detector.lock().replace(handle) {
            old.stop();
        }
    }

    fn spawn_presence_task(&self, mut rx: mpsc::UnboundedReceiver<Vec<PresenceEntry>>) {
        let weak = self.weak.clone();
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    _ = cancel.cancelled() => break,
                    snapshot = rx.recv() => snapshot,
                };
                let Some(snapshot) = snapshot else {
                    break;
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if !session.is_active() {
                    break;
                }
                session.on_presence(snapshot).await;
            }
            debug!("Presence subscription closed");
        });
    }

    fn spawn_signaling_task(&self, mut rx: mpsc::UnboundedReceiver<SignalDocument>) {
        let weak = self.weak.clone();
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            loop {
                let doc = tokio::select! {
                    _ = cancel.cancelled() => break,
                    doc = rx.recv() => doc,
                };
                let Some(doc) = doc else {
                    break;
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if !session.is_active() {
                    break;
                }
                session.peers.handle_document(doc).await;
            }
            debug!("Signaling subscription closed");
        });
    }

    async fn on_presence(&self, snapshot: Vec<PresenceEntry>) {
        let view = presence::reconcile(
            &snapshot,
            &self.ctx.local_uid,
            &self.ctx.mesh,
            now_millis(),
        );
        presence::collect_garbage(&self.ctx.presence, &view.garbage).await;
        self.ctx.state.update(|s| s.voice_users = view.users.clone());
        self.ctx.set_present(view.others.clone());
        self.peers.reconcile(&view.others).await;
    }

    /// Apply a mute/deafen state to the pipeline and playback
    pub fn apply_output(&self, output: AudioOutputState) {
        if let Some(pipeline) = self.pipeline.lock().as_ref() {
            pipeline.set_muted(output.is_muted());
        }
        self.ctx.playback.set_deafened(output.is_deafened());
        if output.is_muted() && self.ctx.state.set_speaking(&self.ctx.local_uid, false) {
            self.ctx.publish(VoiceEvent::SpeakingChanged {
                uid: self.ctx.local_uid.clone(),
                speaking: false,
            });
        }
    }

    /// Switch the microphone without dropping any peer
    ///
    /// Returns `Ok(false)` when another switch is already running.
    pub async fn switch_input(&self, device_id: Option<String>) -> Result<bool> {
        if !self.is_active() {
            return Err(AppError::NotActive);
        }
        if self.switching.swap(true, Ordering::SeqCst) {
            debug!("Input switch already in progress, ignoring");
            return Ok(false);
        }
        let result = self.rebuild_input(device_id).await;
        self.switching.store(false, Ordering::SeqCst);
        result.map(|_| true)
    }

    async fn rebuild_input(&self, device_id: Option<String>) -> Result<()> {
        let (raw, used) = acquire_mic(self.devices.as_ref(), device_id).await?;
        if !self.is_active() {
            raw.stop_all();
            return Err(AppError::NotActive);
        }

        if let Some(old) = self.raw.lock().replace(raw.clone()) {
            old.stop_all();
        }
        if let Some(detector) = self.local_detector.lock().take() {
            detector.stop();
        }
        let old_pipeline = self.pipeline.lock().take();
        if let Some(old) = old_pipeline {
            old.stop();
        }

        let options = PipelineOptions::from(&self.audio);
        let pipeline = match AudioPipeline::build(&self.ctx.engine, &raw, &options).await {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                self.ctx.set_local_stream(None);
                return Err(e);
            }
        };
        pipeline.set_muted(self.ctx.output.lock().is_muted());
        self.ctx.set_local_stream(Some(pipeline.output_stream.clone()));
        *self.pipeline.lock() = Some(pipeline.clone());
        self.start_local_detector(&pipeline);

        if let Some(track) = pipeline.output_track() {
            let replaced = self.peers.replace_audio_track(&track).await;
            debug!("Replaced outgoing audio on {} connections", replaced);
        }

        let persisted = used.clone();
        if let Err(e) = self.prefs.update(|p| p.selected_input = persisted).await {
            warn!("Failed to persist input selection: {}", e);
        }
        self.ctx.state.update(|s| s.selected_input = used.clone());
        self.ctx.publish(VoiceEvent::PipelineRebuilt);
        self.ctx.publish(VoiceEvent::InputSwitched { device_id: used });
        info!("Input device switched");
        Ok(())
    }

    /// Route remote playback to another output device
    pub async fn route_output(&self, device_id: Option<&str>) -> Result<()> {
        self.devices
            .set_output_device(device_id, &self.ctx.playback.output())
            .await
    }

    pub fn set_peer_volume(&self, peer_id: &str, volume: f32) -> f32 {
        self.ctx.playback.set_volume(peer_id, volume)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.ctx.screen_stream().is_some()
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        if !self.is_active() {
            return Err(AppError::NotActive);
        }
        if self.is_screen_sharing() {
            return Ok(());
        }
        let screen = self.devices.get_display_media(true).await?;
        info!(
            "Screen share started with {} tracks",
            screen.tracks().len()
        );
        self.ctx.set_screen_stream(Some(screen.clone()));

        for (peer_id, transport) in self.peers.open_peers() {
            self.peers.add_screen_tracks(&transport, &screen).await;
            if let Err(e) = self.peers.renegotiate(&peer_id).await {
                warn!("Screen renegotiation with {} failed: {}", peer_id, e);
            }
            self.peers.ensure_mic_sender(&transport).await;
        }

        if let Some(video) = screen.video_tracks().into_iter().next() {
            self.watch_screen_end(video, screen);
        }
        if let Err(e) = self
            .ctx
            .presence
            .update_screen_sharing(&self.ctx.local_uid, true)
            .await
        {
            warn!("Failed to publish screen share presence: {}", e);
        }
        self.ctx.state.update(|s| s.screen_sharing = true);
        self.ctx
            .publish(VoiceEvent::ScreenShareChanged { sharing: true });
        Ok(())
    }

    /// Stop sharing when the capture ends on its own
    fn watch_screen_end(&self, video: MediaTrack, screen: MediaStream) {
        let weak = self.weak.clone();
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = video.ended() => {}
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            let current = session.ctx.screen_stream();
            if current.is_some_and(|s| s.same_as(&screen)) {
                info!("Screen capture ended by the user");
                if let Err(e) = session.stop_screen_share().await {
                    warn!("Failed to stop screen share: {}", e);
                }
            }
        });
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        let Some(screen) = self.ctx.set_screen_stream(None) else {
            return Ok(());
        };
        screen.stop_all();

        if self.is_active() {
            for (peer_id, transport) in self.peers.open_peers() {
                self.peers.remove_screen_tracks(&transport).await;
                if let Err(e) = self.peers.renegotiate(&peer_id).await {
                    warn!("Screen renegotiation with {} failed: {}", peer_id, e);
                }
            }
            if let Err(e) = self
                .ctx
                .presence
                .update_screen_sharing(&self.ctx.local_uid, false)
                .await
            {
                warn!("Failed to clear screen share presence: {}", e);
            }
        }
        info!("Screen share stopped");
        self.ctx.state.update(|s| s.screen_sharing = false);
        self.ctx
            .publish(VoiceEvent::ScreenShareChanged { sharing: false });
        Ok(())
    }

    /// Tear everything down. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.ctx.deactivate() {
            return;
        }
        info!("Stopping voice");

        let hook = self.before_stop.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        if self.is_screen_sharing() {
            if let Err(e) = self.stop_screen_share().await {
                debug!("Screen share teardown: {}", e);
            }
        }
        if let Some(detector) = self.local_detector.lock().take() {
            detector.stop();
        }
        self.peers.stop_detectors();
        self.peers.cancel_timers();
        self.switching.store(false, Ordering::SeqCst);
        if let Some(raw) = self.raw.lock().take() {
            raw.stop_all();
        }
        self.peers.close_all().await;

        let pipeline = self.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            pipeline.stop();
        }
        self.ctx.set_local_stream(None);
        self.ctx.playback.stop();
        self.ctx.engine.close();
        self.ctx.cancel.cancel();

        self.ctx.state.update(|s| {
            s.in_voice = false;
            s.group_id = None;
            s.channel_id = None;
            s.voice_users.clear();
            s.speaking.clear();
            s.screen_sharing = false;
        });
        self.ctx.publish(VoiceEvent::VoiceStopped);
        info!("Voice stopped, all resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Signal, SyntheticDevices};

    #[tokio::test]
    async fn test_acquire_falls_back_to_default() {
        let devices = SyntheticDevices::with_default_tone(440.0).with_input(
            "usb",
            "USB Microphone",
            Signal::Silence,
        );
        devices.break_device("usb");

        let (stream, used) = acquire_mic(&devices, Some("usb".to_string())).await.unwrap();
        assert!(stream.first_audio().is_some());
        assert_eq!(used, None);
        assert_eq!(
            devices.requests(),
            vec![Some("usb".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_acquire_denied_fails() {
        let devices = SyntheticDevices::with_default_tone(440.0);
        devices.deny_permission(Some("blocked"));
        let err = acquire_mic(&devices, None).await.unwrap_err();
        assert_eq!(err.user_message(), "mic access denied: blocked");
    }
}
