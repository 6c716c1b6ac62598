use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::events::{EventHandler, VoiceEvent};
use crate::gateway::{GatewaySession, SessionCommand, SessionHooks, SessionTarget};
use crate::manager::ManagerInner;
use crate::model::{
    ChannelId, ConnectionStatus, MainGateway, ServerId, SpeakingFlags, VoiceChannel,
    VoiceServerUpdate, VoiceStateUpdate,
};
use crate::source::AudioSourceHandle;

/// State shared between a connection, its gateway session and its send loop.
pub(crate) struct ConnectionState {
    channel: Mutex<VoiceChannel>,
    self_muted: AtomicBool,
    self_deafened: AtomicBool,
    speaking: AtomicU8,
    status: watch::Sender<ConnectionStatus>,
    source: ArcSwapOption<AudioSourceHandle>,
    commands: ArcSwapOption<mpsc::UnboundedSender<SessionCommand>>,
    events: EventHandler,
}

impl ConnectionState {
    pub(crate) fn new(
        channel: VoiceChannel,
        self_muted: bool,
        self_deafened: bool,
        events: EventHandler,
    ) -> Self {
        Self {
            channel: Mutex::new(channel),
            self_muted: AtomicBool::new(self_muted),
            self_deafened: AtomicBool::new(self_deafened),
            speaking: AtomicU8::new(SpeakingFlags::NONE.bits()),
            status: watch::channel(ConnectionStatus::Connecting).0,
            source: ArcSwapOption::empty(),
            commands: ArcSwapOption::empty(),
            events,
        }
    }

    pub(crate) fn channel(&self) -> VoiceChannel {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_channel(&self, channel: VoiceChannel) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = channel;
    }

    pub(crate) fn server_id(&self) -> ServerId {
        self.channel().server_id
    }

    pub(crate) fn events(&self) -> &EventHandler {
        &self.events
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!("[Voice] Server {} is now {}", self.server_id(), status);
            self.events.emit(VoiceEvent::StatusChanged { server_id: self.server_id(), status });
        }
    }

    pub(crate) fn speaking_flags(&self) -> SpeakingFlags {
        SpeakingFlags::from_bits(self.speaking.load(Ordering::Acquire))
    }

    /// Apply `f` atomically; pushes and returns the new set only if it changed.
    pub(crate) fn update_speaking(
        &self,
        f: impl Fn(SpeakingFlags) -> SpeakingFlags,
    ) -> Option<SpeakingFlags> {
        let previous = self
            .speaking
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = f(SpeakingFlags::from_bits(bits)).bits();
                (next != bits).then_some(next)
            })
            .ok()?;

        let flags = f(SpeakingFlags::from_bits(previous));
        self.send_command(SessionCommand::Speaking(flags));
        Some(flags)
    }

    /// Toggle the SPEAKING bit from the send loop.
    pub(crate) fn set_speaking(&self, speaking: bool) {
        let changed = self.update_speaking(|flags| {
            if speaking {
                flags | SpeakingFlags::SPEAKING
            } else {
                flags.without(SpeakingFlags::SPEAKING)
            }
        });
        if changed.is_some() {
            self.events.emit(VoiceEvent::SpeakingChanged { server_id: self.server_id(), speaking });
        }
    }

    pub(crate) fn audio_source_slot(&self) -> Option<Arc<AudioSourceHandle>> {
        self.source.load_full()
    }

    /// Replace the active source, returning the previous one.
    pub(crate) fn set_audio_source(
        &self,
        source: Option<AudioSourceHandle>,
    ) -> Option<AudioSourceHandle> {
        self.source
            .swap(source.map(Arc::new))
            .map(|previous| AudioSourceHandle::clone(&previous))
    }

    pub(crate) fn install_commands(&self, commands: mpsc::UnboundedSender<SessionCommand>) {
        self.commands.store(Some(Arc::new(commands)));
    }

    fn send_command(&self, command: SessionCommand) {
        if let Some(commands) = self.commands.load().as_deref() {
            // a finished session drops its receiver
            let _ = commands.send(command);
        }
    }

    fn is_self_muted(&self) -> bool {
        self.self_muted.load(Ordering::Acquire)
    }

    fn is_self_deafened(&self) -> bool {
        self.self_deafened.load(Ordering::Acquire)
    }

    pub(crate) fn state_update(&self, channel_id: Option<ChannelId>) -> VoiceStateUpdate {
        VoiceStateUpdate {
            server_id: self.server_id(),
            channel_id,
            self_mute: self.is_self_muted(),
            self_deaf: self.is_self_deafened(),
        }
    }
}

/// A voice connection to one server.
///
/// Obtained from [`crate::VoiceConnectionManager::connect`]. At most one exists per
/// server; moving between servers keeps the same instance.
pub struct VoiceConnection {
    state: Arc<ConnectionState>,
    session: tokio::sync::Mutex<Option<GatewaySession>>,
    gateway: Arc<dyn MainGateway>,
    config: VoiceConfig,
    manager: Weak<ManagerInner>,
}

impl VoiceConnection {
    pub(crate) fn new(
        channel: VoiceChannel,
        self_muted: bool,
        self_deafened: bool,
        manager: &Arc<ManagerInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ConnectionState::new(
                channel,
                self_muted,
                self_deafened,
                manager.events().clone(),
            )),
            session: tokio::sync::Mutex::new(None),
            gateway: Arc::clone(manager.gateway()),
            config: manager.config().clone(),
            manager: Arc::downgrade(manager),
        })
    }

    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn server_id(&self) -> ServerId {
        self.state.server_id()
    }

    pub fn channel(&self) -> VoiceChannel {
        self.state.channel()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Receiver that observes every status transition.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.state.status.subscribe()
    }

    pub fn is_self_muted(&self) -> bool {
        self.state.is_self_muted()
    }

    pub fn is_self_deafened(&self) -> bool {
        self.state.is_self_deafened()
    }

    pub fn speaking_flags(&self) -> SpeakingFlags {
        self.state.speaking_flags()
    }

    pub fn is_priority_speaking(&self) -> bool {
        self.speaking_flags().contains(SpeakingFlags::PRIORITY_SPEAKER)
    }

    /// Mute ourselves; the main gateway is told right away.
    pub fn set_self_muted(&self, muted: bool) {
        self.state.self_muted.store(muted, Ordering::Release);
        self.resend_state();
    }

    /// Deafen ourselves; the main gateway is told right away.
    pub fn set_self_deafened(&self, deafened: bool) {
        self.state.self_deafened.store(deafened, Ordering::Release);
        self.resend_state();
    }

    fn resend_state(&self) {
        if self.status() != ConnectionStatus::Disconnected {
            let channel = self.channel();
            self.gateway.send_voice_state_update(self.state.state_update(Some(channel.id)));
        }
    }

    /// Toggle priority speaking. Also sets or clears SPEAKING.
    pub fn set_priority_speaking(&self, priority: bool) {
        let both = SpeakingFlags::PRIORITY_SPEAKER | SpeakingFlags::SPEAKING;
        self.state.update_speaking(|flags| {
            if priority {
                flags | both
            } else {
                flags.without(both)
            }
        });
    }

    /// Attach a source, returning the one it replaces. The replaced source is not stopped.
    pub fn set_audio_source(&self, source: AudioSourceHandle) -> Option<AudioSourceHandle> {
        self.state.set_audio_source(Some(source))
    }

    pub fn remove_audio_source(&self) -> Option<AudioSourceHandle> {
        self.state.set_audio_source(None)
    }

    pub fn audio_source(&self) -> Option<AudioSourceHandle> {
        self.state.audio_source_slot().map(|handle| AudioSourceHandle::clone(&handle))
    }

    /// Move to another channel, keeping the mute and deafen flags.
    ///
    /// # Errors
    /// [`VoiceError::NotConnected`] once disconnected, otherwise as
    /// [`crate::VoiceConnectionManager::move_connection`].
    pub async fn move_to(self: &Arc<Self>, channel: VoiceChannel) -> Result<Arc<Self>, VoiceError> {
        self.move_to_with(channel, self.is_self_muted(), self.is_self_deafened()).await
    }

    /// Move to another channel with new mute and deafen flags.
    ///
    /// # Errors
    /// [`VoiceError::NotConnected`] once disconnected, otherwise as
    /// [`crate::VoiceConnectionManager::move_connection`].
    pub async fn move_to_with(
        self: &Arc<Self>,
        channel: VoiceChannel,
        self_muted: bool,
        self_deafened: bool,
    ) -> Result<Arc<Self>, VoiceError> {
        if self.status() == ConnectionStatus::Disconnected {
            return Err(VoiceError::NotConnected);
        }
        let manager = self.manager.upgrade().ok_or(VoiceError::NotConnected)?;

        self.state.self_muted.store(self_muted, Ordering::Release);
        self.state.self_deafened.store(self_deafened, Ordering::Release);
        manager.move_connection(self, channel).await
    }

    /// Leave the voice channel.
    ///
    /// # Errors
    /// [`VoiceError::NotConnected`] if already disconnected.
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), VoiceError> {
        if self.status() == ConnectionStatus::Disconnected {
            return Err(VoiceError::NotConnected);
        }

        let channel = self.channel();
        info!("[Voice] Disconnecting from {}", channel);
        self.stop_session().await;

        self.gateway.send_voice_state_update(self.state.state_update(None));
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(channel.server_id, self);
        }
        self.state.set_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    /// Stop the running gateway session, if any.
    pub(crate) async fn stop_session(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    /// Replace the gateway session with one for `update`.
    pub(crate) async fn start_session(self: &Arc<Self>, update: &VoiceServerUpdate, session_id: String) {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            previous.shutdown().await;
        }

        let target = SessionTarget {
            server_id: update.server_id,
            user_id: self.gateway.user_id(),
            session_id,
            endpoint: update.endpoint.clone(),
            token: update.token.clone(),
        };
        debug!("[Voice] Starting gateway session for {} at {}", self.channel(), target.endpoint);

        *slot = Some(GatewaySession::spawn(
            target,
            Arc::clone(&self.state),
            Arc::clone(&self.gateway),
            self.config.clone(),
            self.session_hooks(),
        ));
    }

    fn session_hooks(self: &Arc<Self>) -> SessionHooks {
        let (manager, connection) = (self.manager.clone(), Arc::downgrade(self));
        let on_ready = Box::new(move || {
            if let (Some(manager), Some(connection)) = (manager.upgrade(), connection.upgrade()) {
                manager.complete_handshake(connection.server_id(), &connection);
            }
        });

        let (manager, connection) = (self.manager.clone(), Arc::downgrade(self));
        let on_terminated = Box::new(move || {
            if let (Some(manager), Some(connection)) = (manager.upgrade(), connection.upgrade()) {
                manager.connection_lost(&connection);
            }
        });

        SessionHooks { on_ready, on_terminated }
    }
}

impl std::fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("channel", &self.channel())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
