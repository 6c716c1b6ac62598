use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_channel::Receiver;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::connection::VoiceConnection;
use crate::error::VoiceError;
use crate::events::{EventHandler, VoiceEvent};
use crate::model::{
    ChannelId, ConnectionStatus, MainGateway, ServerId, VoiceChannel, VoiceServerUpdate,
    VoiceStateEvent, VoiceStateUpdate,
};

type Pending<T> = DashMap<ServerId, oneshot::Sender<T>>;

/// Owns every voice connection of one main gateway session.
#[derive(Clone)]
pub struct VoiceConnectionManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    gateway: Arc<dyn MainGateway>,
    config: VoiceConfig,
    events: EventHandler,
    connections: DashMap<ServerId, Arc<VoiceConnection>>,
    locks: DashMap<ServerId, Arc<Mutex<()>>>,
    pending_servers: Pending<VoiceServerUpdate>,
    pending_handshakes: Pending<Result<(), VoiceError>>,
    pending_states: Pending<Option<ChannelId>>,
    session_id: ArcSwapOption<String>,
}

impl VoiceConnectionManager {
    pub fn new(gateway: Arc<dyn MainGateway>, config: VoiceConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                gateway,
                config,
                events: EventHandler::new(),
                connections: DashMap::new(),
                locks: DashMap::new(),
                pending_servers: DashMap::new(),
                pending_handshakes: DashMap::new(),
                pending_states: DashMap::new(),
                session_id: ArcSwapOption::empty(),
            }),
        }
    }

    /// Join `channel`, reusing or moving the server's existing connection.
    ///
    /// # Errors
    /// [`VoiceError::Timeout`] if the voice server update or the handshake does
    /// not arrive in time, or the error that ended the handshake.
    pub async fn connect(
        &self,
        channel: VoiceChannel,
        self_mute: bool,
        self_deafen: bool,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        self.inner.connect(channel, self_mute, self_deafen).await
    }

    /// Move `connection` to `dest`. Moving to the current channel does nothing.
    ///
    /// # Errors
    /// [`VoiceError::Timeout`] if the main gateway does not answer in time,
    /// [`VoiceError::ConnectionFailed`] if it puts us somewhere else.
    pub async fn move_connection(
        &self,
        connection: &Arc<VoiceConnection>,
        dest: VoiceChannel,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        self.inner.move_connection(connection, dest).await
    }

    /// Resolve the pending connect or move for `server_id`.
    pub fn complete_handshake(&self, server_id: ServerId, connection: &Arc<VoiceConnection>) {
        self.inner.complete_handshake(server_id, connection);
    }

    /// Drop a connection from the registry without disconnecting it.
    pub fn remove(&self, server_id: ServerId) -> Option<Arc<VoiceConnection>> {
        self.inner.connections.remove(&server_id).map(|(_, connection)| connection)
    }

    pub async fn disconnect_all(&self) {
        for connection in self.list() {
            if let Err(e) = connection.disconnect().await {
                debug!("[Voice] Skipping {}: {}", connection.channel(), e);
            }
        }
    }

    pub fn list(&self) -> Vec<Arc<VoiceConnection>> {
        self.inner.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// The connection currently in `channel`.
    pub fn get_by_channel(&self, channel: VoiceChannel) -> Option<Arc<VoiceConnection>> {
        self.inner.get(channel.server_id).filter(|connection| connection.channel() == channel)
    }

    pub fn get_by_server(&self, server_id: ServerId) -> Option<Arc<VoiceConnection>> {
        self.inner.get(server_id)
    }

    /// Feed a VOICE_SERVER_UPDATE from the main gateway.
    pub fn handle_voice_server_update(&self, update: VoiceServerUpdate) {
        self.inner.handle_voice_server_update(update);
    }

    /// Feed a VOICE_STATE_UPDATE from the main gateway.
    pub fn handle_voice_state_update(&self, event: &VoiceStateEvent) {
        self.inner.handle_voice_state_update(event);
    }

    /// Get event stream for all connections of this manager
    pub fn event_stream(&self) -> Receiver<VoiceEvent> {
        self.inner.events.event_stream()
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.inner.config
    }
}

impl ManagerInner {
    pub(crate) fn gateway(&self) -> &Arc<dyn MainGateway> {
        &self.gateway
    }

    pub(crate) fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub(crate) fn events(&self) -> &EventHandler {
        &self.events
    }

    fn get(&self, server_id: ServerId) -> Option<Arc<VoiceConnection>> {
        self.connections.get(&server_id).map(|entry| Arc::clone(entry.value()))
    }

    async fn lock(&self, server_id: ServerId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(server_id).or_default().value());
        lock.lock_owned().await
    }

    fn session_id(&self) -> String {
        self.session_id
            .load_full()
            .map_or_else(|| self.gateway.session_id(), |id| String::clone(&id))
    }

    fn send_state(&self, server_id: ServerId, channel_id: Option<ChannelId>, mute: bool, deaf: bool) {
        self.gateway.send_voice_state_update(VoiceStateUpdate {
            server_id,
            channel_id,
            self_mute: mute,
            self_deaf: deaf,
        });
    }

    async fn connect(
        self: &Arc<Self>,
        channel: VoiceChannel,
        self_mute: bool,
        self_deafen: bool,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        let server_id = channel.server_id;
        let guard = self.lock(server_id).await;

        if let Some(existing) = self.get(server_id) {
            if existing.channel() == channel {
                return Ok(existing);
            }
            drop(guard);
            return existing.move_to_with(channel, self_mute, self_deafen).await;
        }

        info!("[Voice] Connecting to {}", channel);
        let server_rx = expect(&self.pending_servers, server_id);
        self.send_state(server_id, Some(channel.id), self_mute, self_deafen);
        let update = self.wait(&self.pending_servers, server_id, server_rx, "voice server update").await?;

        let connection = VoiceConnection::new(channel, self_mute, self_deafen, self);
        let handshake_rx = expect(&self.pending_handshakes, server_id);
        self.connections.insert(server_id, Arc::clone(&connection));
        connection.start_session(&update, self.session_id()).await;

        let handshake = self.wait(&self.pending_handshakes, server_id, handshake_rx, "handshake").await;
        match handshake.and_then(|result| result) {
            Ok(()) => {
                info!("[Voice] Connected to {}", channel);
                Ok(connection)
            }
            Err(e) => {
                warn!("[Voice] Connecting to {} failed: {}", channel, e);
                self.abandon(&connection).await;
                Err(e)
            }
        }
    }

    pub(crate) async fn move_connection(
        self: &Arc<Self>,
        connection: &Arc<VoiceConnection>,
        dest: VoiceChannel,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        let source = connection.channel();
        if source == dest {
            return Ok(Arc::clone(connection));
        }

        let mute = connection.is_self_muted();
        let deaf = connection.is_self_deafened();

        if source.server_id == dest.server_id {
            let _guard = self.lock(dest.server_id).await;
            info!("[Voice] Moving from {} to {}", source, dest);

            let state_rx = expect(&self.pending_states, dest.server_id);
            self.send_state(dest.server_id, Some(dest.id), mute, deaf);
            let landed = self.wait(&self.pending_states, dest.server_id, state_rx, "voice state update").await?;
            if landed != Some(dest.id) {
                return Err(VoiceError::ConnectionFailed(format!(
                    "asked to move to {} but landed in {:?}",
                    dest, landed
                )));
            }
            connection.state().set_channel(dest);
            return Ok(Arc::clone(connection));
        }

        let (first, second) = if source.server_id < dest.server_id {
            (source.server_id, dest.server_id)
        } else {
            (dest.server_id, source.server_id)
        };
        let _first = self.lock(first).await;
        let _second = self.lock(second).await;
        info!("[Voice] Moving from {} to {} across servers", source, dest);

        if let Some(other) = self.get(dest.server_id) {
            if !Arc::ptr_eq(&other, connection) {
                info!("[Voice] Replacing existing connection in {}", other.channel());
                if let Err(e) = other.disconnect().await {
                    debug!("[Voice] Replaced connection was already closed: {}", e);
                }
            }
        }

        let server_rx = expect(&self.pending_servers, dest.server_id);
        self.send_state(dest.server_id, Some(dest.id), mute, deaf);
        let update = self.wait(&self.pending_servers, dest.server_id, server_rx, "voice server update").await?;

        let handshake_rx = expect(&self.pending_handshakes, dest.server_id);
        connection.state().set_channel(dest);
        connection.start_session(&update, self.session_id()).await;

        self.connections.remove_if(&source.server_id, |_, c| Arc::ptr_eq(c, connection));
        self.connections.insert(dest.server_id, Arc::clone(connection));

        let handshake = self.wait(&self.pending_handshakes, dest.server_id, handshake_rx, "handshake").await;
        match handshake.and_then(|result| result) {
            Ok(()) => {
                info!("[Voice] Moved to {}", dest);
                Ok(Arc::clone(connection))
            }
            Err(e) => {
                warn!("[Voice] Moving to {} failed: {}", dest, e);
                self.abandon(connection).await;
                Err(e)
            }
        }
    }

    pub(crate) fn complete_handshake(&self, server_id: ServerId, connection: &Arc<VoiceConnection>) {
        match self.pending_handshakes.remove(&server_id) {
            Some((_, tx)) => {
                debug!("[Voice] Handshake complete for {}", connection.channel());
                let _ = tx.send(Ok(()));
            }
            None => debug!("[Voice] No pending handshake for server {}", server_id),
        }
    }

    /// Remove `connection` if it is the one registered for `server_id`.
    pub(crate) fn deregister(&self, server_id: ServerId, connection: &Arc<VoiceConnection>) -> bool {
        let removed = self
            .connections
            .remove_if(&server_id, |_, c| Arc::ptr_eq(c, connection))
            .is_some();
        if removed {
            if let Some((_, tx)) = self.pending_handshakes.remove(&server_id) {
                let _ = tx.send(Err(VoiceError::ConnectionFailed(
                    "voice connection closed before the handshake completed".to_string(),
                )));
            }
        }
        removed
    }

    /// The session of `connection` ended on its own.
    pub(crate) fn connection_lost(&self, connection: &Arc<VoiceConnection>) {
        let server_id = connection.server_id();
        warn!("[Voice] Lost voice connection in {}", connection.channel());
        self.send_state(server_id, None, connection.is_self_muted(), connection.is_self_deafened());
        self.deregister(server_id, connection);
    }

    async fn abandon(&self, connection: &Arc<VoiceConnection>) {
        connection.stop_session().await;
        let server_id = connection.server_id();
        if self.deregister(server_id, connection) {
            self.send_state(server_id, None, connection.is_self_muted(), connection.is_self_deafened());
        }
        connection.state().set_status(ConnectionStatus::Disconnected);
    }

    async fn wait<T>(
        &self,
        pending: &Pending<T>,
        server_id: ServerId,
        rx: oneshot::Receiver<T>,
        what: &str,
    ) -> Result<T, VoiceError> {
        let result = tokio::time::timeout(self.config.handshake_timeout, rx).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(VoiceError::Cancelled),
            Err(_) => {
                pending.remove_if(&server_id, |_, tx| tx.is_closed());
                Err(VoiceError::Timeout(format!("{} for server {}", what, server_id)))
            }
        }
    }

    fn handle_voice_server_update(self: &Arc<Self>, update: VoiceServerUpdate) {
        let server_id = update.server_id;
        let update = match self.pending_servers.remove(&server_id) {
            Some((_, tx)) => match tx.send(update) {
                Ok(()) => return,
                Err(update) => update,
            },
            None => update,
        };

        let Some(connection) = self.get(server_id) else {
            debug!("[Voice] Ignoring voice server update for server {}", server_id);
            return;
        };
        if connection.status() == ConnectionStatus::Disconnected {
            return;
        }

        info!("[Voice] Voice server for {} moved to {}", connection.channel(), update.endpoint);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = inner.lock(server_id).await;
            connection.start_session(&update, inner.session_id()).await;
        });
    }

    fn handle_voice_state_update(&self, event: &VoiceStateEvent) {
        if event.user_id != self.gateway.user_id() {
            return;
        }
        self.session_id.store(Some(Arc::new(event.session_id.clone())));

        if let Some((_, tx)) = self.pending_states.remove(&event.server_id) {
            let _ = tx.send(event.channel_id);
            return;
        }

        let Some(connection) = self.get(event.server_id) else {
            return;
        };
        if let Some(channel_id) = event.channel_id {
            if channel_id != connection.channel().id {
                let channel = VoiceChannel::new(event.server_id, channel_id);
                info!("[Voice] Moved by the server from {} to {}", connection.channel(), channel);
                connection.state().set_channel(channel);
            }
        }
    }
}

/// Register a one-shot slot for `server_id`, replacing any earlier one.
fn expect<T>(pending: &Pending<T>, server_id: ServerId) -> oneshot::Receiver<T> {
    let (tx, rx) = oneshot::channel();
    pending.insert(server_id, tx);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingGateway {
        updates: StdMutex<Vec<VoiceStateUpdate>>,
    }

    impl MainGateway for RecordingGateway {
        fn send_voice_state_update(&self, update: VoiceStateUpdate) {
            self.updates.lock().unwrap().push(update);
        }

        fn session_id(&self) -> String {
            "session".into()
        }

        fn user_id(&self) -> crate::model::UserId {
            crate::model::UserId(7)
        }

        fn channel_exists(&self, _channel: &VoiceChannel) -> bool {
            true
        }
    }

    fn manager(timeout: Duration) -> (VoiceConnectionManager, Arc<RecordingGateway>) {
        let gateway = Arc::new(RecordingGateway::default());
        let config = VoiceConfig { handshake_timeout: timeout, ..VoiceConfig::default() };
        (VoiceConnectionManager::new(gateway.clone(), config), gateway)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_without_server_update() {
        let (manager, gateway) = manager(Duration::from_secs(15));
        let channel = VoiceChannel::new(1, 10);

        let err = manager.connect(channel, true, false).await.unwrap_err();
        assert!(matches!(err, VoiceError::Timeout(_)));
        assert!(manager.list().is_empty());
        assert!(manager.inner.pending_servers.is_empty());

        let updates = gateway.updates.lock().unwrap();
        assert_eq!(
            *updates,
            vec![VoiceStateUpdate {
                server_id: ServerId(1),
                channel_id: Some(ChannelId(10)),
                self_mute: true,
                self_deaf: false,
            }]
        );
    }

    #[test]
    fn state_updates_from_other_users_are_ignored() {
        let (manager, _gateway) = manager(Duration::from_secs(1));
        manager.handle_voice_state_update(&VoiceStateEvent {
            server_id: ServerId(1),
            user_id: crate::model::UserId(99),
            session_id: "other".into(),
            channel_id: None,
        });
        assert_eq!(manager.inner.session_id(), "session");

        manager.handle_voice_state_update(&VoiceStateEvent {
            server_id: ServerId(1),
            user_id: crate::model::UserId(7),
            session_id: "fresh".into(),
            channel_id: None,
        });
        assert_eq!(manager.inner.session_id(), "fresh");
    }

    #[test]
    fn unsolicited_server_update_without_connection_is_dropped() {
        let (manager, _gateway) = manager(Duration::from_secs(1));
        manager.handle_voice_server_update(VoiceServerUpdate {
            server_id: ServerId(3),
            token: "t".into(),
            endpoint: "e".into(),
        });
        assert!(manager.list().is_empty());
    }
}
