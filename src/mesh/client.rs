//! UI-facing voice client
//!
//! Wraps at most one [`VoiceSession`] and exposes the imperative surface
//! (join, leave, mute, deafen, device switching, screen share) plus a
//! `watch` channel with the reactive state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::output::AudioOutputState;
use super::presence;
use super::session::{HookSlot, SessionParams, VoiceSession};
use super::state::{StateHandle, VoiceState};
use crate::agent::PipelineAccess;
use crate::audio::{AudioEngine, PipelineDestination};
use crate::config::{PreferenceStore, VoiceConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, VoiceEvent};
use crate::ice::IceCredentialProvider;
use crate::media::{MediaDevices, MediaStream};
use crate::signaling::{ChannelDirectory, PresenceEntry};
use crate::utils::now_millis;
use crate::webrtc::TransportFactory;

/// Who the local participant is
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: String,
    pub display_name: String,
    pub photo_url: Option<String>,
}

impl Identity {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            photo_url: None,
        }
    }
}

/// External collaborators a client works with
#[derive(Clone)]
pub struct VoiceServices {
    pub directory: Arc<dyn ChannelDirectory>,
    pub transports: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub ice: Arc<IceCredentialProvider>,
    pub prefs: PreferenceStore,
}

/// Voice channel membership for one local identity
///
/// A client runs at most one [`VoiceSession`]; a second `join` while one is
/// starting or active fails with [`AppError::AlreadyActive`]. The guard is
/// held per client, not per process, so a process gets the one-session rule
/// by owning a single client. Several clients in one process act as separate
/// participants.
pub struct VoiceClient {
    identity: Identity,
    config: VoiceConfig,
    services: VoiceServices,
    events: Arc<EventBus>,
    state: StateHandle,
    output: Arc<Mutex<AudioOutputState>>,
    before_stop: HookSlot,
    session: Mutex<Option<Arc<VoiceSession>>>,
    starting: AtomicBool,
}

impl VoiceClient {
    pub fn new(identity: Identity, config: VoiceConfig, services: VoiceServices) -> Self {
        let prefs = services.prefs.get();
        let state = StateHandle::new(VoiceState {
            selected_input: prefs.selected_input.clone(),
            selected_output: prefs.selected_output.clone(),
            user_volumes: prefs.user_volumes.clone(),
            vad_threshold: prefs.vad_threshold,
            ..Default::default()
        });
        Self {
            identity,
            config,
            services,
            events: Arc::new(EventBus::new()),
            state,
            output: Arc::new(Mutex::new(AudioOutputState::Open)),
            before_stop: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> &str {
        &self.identity.uid
    }

    pub fn state(&self) -> VoiceState {
        self.state.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<VoiceState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn output_state(&self) -> AudioOutputState {
        *self.output.lock()
    }

    /// Active session, if any
    pub fn session(&self) -> Option<Arc<VoiceSession>> {
        self.session.lock().clone()
    }

    /// Join a voice channel; false (with a user-visible error) on failure
    pub async fn join(&self, group_id: &str, channel_id: &str) -> bool {
        match self.try_join(group_id, channel_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to join voice: {}", e);
                self.report(&e);
                false
            }
        }
    }

    async fn try_join(&self, group_id: &str, channel_id: &str) -> Result<()> {
        if self.starting.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyActive);
        }
        let result = self.start_session(group_id, channel_id).await;
        self.starting.store(false, Ordering::SeqCst);
        result
    }

    async fn start_session(&self, group_id: &str, channel_id: &str) -> Result<()> {
        if self.session.lock().is_some() {
            return Err(AppError::AlreadyActive);
        }
        let session = VoiceSession::start(SessionParams {
            local_uid: self.identity.uid.clone(),
            group_id: group_id.to_string(),
            channel_id: channel_id.to_string(),
            config: self.config.clone(),
            directory: self.services.directory.clone(),
            transports: self.services.transports.clone(),
            devices: self.services.devices.clone(),
            ice: self.services.ice.clone(),
            prefs: self.services.prefs.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            output: self.output.clone(),
            before_stop: self.before_stop.clone(),
        })
        .await?;

        let mut entry = PresenceEntry::new(
            self.identity.uid.clone(),
            self.identity.display_name.clone(),
            now_millis(),
        );
        entry.photo_url = self.identity.photo_url.clone();
        if let Err(e) = presence::announce(&session.context().presence, entry).await {
            session.stop().await;
            return Err(e);
        }

        *self.session.lock() = Some(session);
        info!("Joined voice channel {}/{}", group_id, channel_id);
        Ok(())
    }

    /// Leave the channel. Safe without a session.
    pub async fn leave(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };
        let ctx = session.context().clone();
        presence::withdraw(&ctx.presence, &ctx.signaling, &self.identity.uid).await;
        session.stop().await;
        info!("Left voice channel {}/{}", ctx.group_id, ctx.channel_id);
    }

    fn report(&self, error: &AppError) {
        let message = error.user_message();
        self.state.update(|s| s.error = Some(message.clone()));
        self.events.publish(VoiceEvent::VoiceError { message });
    }

    fn set_output(&self, next: AudioOutputState) {
        let previous = std::mem::replace(&mut *self.output.lock(), next);
        if previous == next {
            return;
        }
        if let Some(session) = self.session() {
            session.apply_output(next);
        }
        self.state.update(|s| {
            s.muted = next.is_muted();
            s.deafened = next.is_deafened();
        });
        if previous.is_deafened() != next.is_deafened() {
            self.events.publish(VoiceEvent::DeafenChanged {
                deafened: next.is_deafened(),
                muted: next.is_muted(),
            });
        } else {
            self.events.publish(VoiceEvent::MuteChanged {
                muted: next.is_muted(),
            });
        }
    }

    /// Flip mute; does nothing while deafened
    pub fn toggle_mute(&self) -> AudioOutputState {
        let next = self.output_state().toggle_mute();
        self.set_output(next);
        next
    }

    pub fn toggle_deafen(&self) -> AudioOutputState {
        let next = self.output_state().toggle_deafen();
        self.set_output(next);
        next
    }

    /// Switch the microphone; outside a call only the preference changes
    pub async fn switch_input(&self, device_id: &str) -> bool {
        let Some(session) = self.session() else {
            let id = device_id.to_string();
            return match self.services.prefs.update(|p| p.selected_input = Some(id)).await {
                Ok(()) => {
                    self.state
                        .update(|s| s.selected_input = Some(device_id.to_string()));
                    true
                }
                Err(e) => {
                    warn!("Failed to persist input selection: {}", e);
                    false
                }
            };
        };
        match session.switch_input(Some(device_id.to_string())).await {
            Ok(switched) => switched,
            Err(e) => {
                warn!("Input switch failed: {}", e);
                self.report(&e);
                false
            }
        }
    }

    /// Route remote audio to `device_id` (`None` = system default)
    pub async fn switch_output(&self, device_id: Option<&str>) -> bool {
        if let Some(session) = self.session() {
            if let Err(e) = session.route_output(device_id).await {
                warn!("Output switch failed: {}", e);
                self.report(&e);
                return false;
            }
        }
        let selected = device_id.map(str::to_string);
        let persisted = selected.clone();
        if let Err(e) = self
            .services
            .prefs
            .update(|p| p.selected_output = persisted)
            .await
        {
            warn!("Failed to persist output selection: {}", e);
        }
        self.state.update(|s| s.selected_output = selected.clone());
        self.events
            .publish(VoiceEvent::OutputSwitched { device_id: selected });
        true
    }

    /// Set a participant's playback volume (clamped to 0..1)
    pub async fn set_user_volume(&self, uid: &str, volume: f32) -> f32 {
        let volume = volume.clamp(0.0, 1.0);
        if let Some(session) = self.session() {
            session.set_peer_volume(uid, volume);
        }
        let key = uid.to_string();
        if let Err(e) = self
            .services
            .prefs
            .update(|p| {
                p.user_volumes.insert(key, volume);
            })
            .await
        {
            warn!("Failed to persist volume: {}", e);
        }
        self.state.update(|s| {
            s.user_volumes.insert(uid.to_string(), volume);
        });
        volume
    }

    /// Change the local speech threshold; the detector picks it up next frame
    pub async fn set_vad_threshold(&self, threshold: f32) {
        if let Err(e) = self
            .services
            .prefs
            .update(|p| p.vad_threshold = threshold)
            .await
        {
            warn!("Failed to persist speech threshold: {}", e);
        }
        self.state.update(|s| s.vad_threshold = threshold);
    }

    pub async fn start_screen_share(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        match session.start_screen_share().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Screen share failed: {}", e);
                self.report(&e);
                false
            }
        }
    }

    pub async fn stop_screen_share(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        match session.stop_screen_share().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Stopping screen share failed: {}", e);
                false
            }
        }
    }
}

impl PipelineAccess for VoiceClient {
    fn audio_engine(&self) -> Option<Arc<AudioEngine>> {
        self.session().and_then(|s| s.engine())
    }

    fn pipeline_destination(&self) -> Option<PipelineDestination> {
        self.session().and_then(|s| s.pipeline_destination())
    }

    fn capture_stream(&self) -> Option<MediaStream> {
        self.session().and_then(|s| s.capture_stream())
    }

    fn register_before_stop_hook(&self, hook: Option<Box<dyn FnOnce() + Send>>) {
        *self.before_stop.lock() = hook;
    }

    fn voice_state(&self) -> watch::Receiver<VoiceState> {
        self.state.subscribe()
    }

    fn voice_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        let Some(session) = self.session.get_mut().take() else {
            return;
        };
        let uid = self.identity.uid.clone();
        // Best effort, like a page unload
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = session.context().presence.delete(&uid).await;
                session.stop().await;
            });
        }
    }
}
