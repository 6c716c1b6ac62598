//! Voice gateway session: websocket handshake, heartbeat and reconnect policy.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voicelink_protocol::{gateway_url, CloseCode, GatewayCommand, GatewayEvent, ENCRYPTION_MODE};

use crate::config::{VoiceConfig, SESSION_SHUTDOWN_TIMEOUT, WRITER_SHUTDOWN_GRACE};
use crate::connection::ConnectionState;
use crate::error::VoiceError;
use crate::events::VoiceEvent;
use crate::model::{ConnectionStatus, MainGateway, ServerId, SpeakingFlags, UserId};
use crate::transport::AudioTransport;

/// Close code recorded when the server closes without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Requests from the connection to its running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Speaking(SpeakingFlags),
}

/// Where and as whom a session connects.
#[derive(Debug, Clone)]
pub(crate) struct SessionTarget {
    pub(crate) server_id: ServerId,
    pub(crate) user_id: UserId,
    pub(crate) session_id: String,
    pub(crate) endpoint: String,
    pub(crate) token: String,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Callbacks fired at most once per session.
pub(crate) struct SessionHooks {
    /// The transport is ready for the first time.
    pub(crate) on_ready: Hook,
    /// The session ended without being asked to.
    pub(crate) on_terminated: Hook,
}

/// Who closed the websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Initiator {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CloseInfo {
    pub(crate) code: CloseCode,
    pub(crate) initiator: Initiator,
}

impl CloseInfo {
    fn server(code: CloseCode) -> Self {
        Self { code, initiator: Initiator::Server }
    }

    fn client(code: CloseCode) -> Self {
        Self { code, initiator: Initiator::Client }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    Reconnect,
    Terminate,
}

/// Decide what follows a closed websocket.
pub(crate) fn close_action(
    close: CloseInfo,
    disconnect_requested: bool,
    channel_exists: impl FnOnce() -> bool,
) -> CloseAction {
    if disconnect_requested {
        return CloseAction::Terminate;
    }
    match close.initiator {
        Initiator::Server if close.code.requires_channel() => {
            if channel_exists() {
                CloseAction::Reconnect
            } else {
                CloseAction::Terminate
            }
        }
        Initiator::Server if close.code == CloseCode::VoiceServerCrashed => CloseAction::Terminate,
        Initiator::Server => CloseAction::Reconnect,
        Initiator::Client if close.code == CloseCode::Normal => CloseAction::Terminate,
        Initiator::Client => CloseAction::Reconnect,
    }
}

/// A running voice gateway session.
pub(crate) struct GatewaySession {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewaySession {
    /// Start the session actor. Speaking changes reach it through `state`.
    pub(crate) fn spawn(
        target: SessionTarget,
        state: Arc<ConnectionState>,
        gateway: Arc<dyn MainGateway>,
        config: VoiceConfig,
        hooks: SessionHooks,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        state.install_commands(command_tx);

        let cancel = CancellationToken::new();
        let actor = SessionActor {
            target,
            state,
            gateway,
            config,
            commands: command_rx,
            cancel: cancel.clone(),
            on_ready: Some(hooks.on_ready),
            on_terminated: Some(hooks.on_terminated),
            transport: None,
            resumable: false,
            resuming: false,
            requested: false,
            failed_attempts: 0,
        };
        let task = tokio::spawn(actor.run());

        Self { cancel, task: Mutex::new(Some(task)) }
    }

    /// Close the websocket and wait for the session to wind down.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("[Voice gateway] Session did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-websocket resources. Dropping it stops the heartbeat.
struct Link {
    out: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
    last_heartbeat: Arc<Mutex<Option<Instant>>>,
}

impl Link {
    fn send(&self, command: &GatewayCommand) -> Result<(), VoiceError> {
        debug!("[Voice gateway] Sending {:?}", command.opcode());
        self.out
            .send(Message::Text(command.encode().into()))
            .map_err(|_| VoiceError::Gateway("websocket writer closed".to_string()))
    }

    fn close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame { code: WsCloseCode::from(code.as_u16()), reason: reason.to_string().into() };
        let _ = self.out.send(Message::Close(Some(frame)));
    }

    fn start_heartbeat(&mut self, interval: Duration) {
        if let Some(old) = self.heartbeat.take() {
            old.abort();
        }

        let out = self.out.clone();
        let cancel = self.cancel.clone();
        let last = Arc::clone(&self.last_heartbeat);

        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let heartbeat = GatewayCommand::Heartbeat { nonce: unix_millis() };
                        *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                        if out.send(Message::Text(heartbeat.encode().into())).is_err() {
                            break;
                        }
                        debug!("[Voice gateway] Heartbeat sent");
                    }
                }
            }
        }));
    }

    fn latency(&self) -> Option<Duration> {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|sent| sent.elapsed())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

struct SessionActor {
    target: SessionTarget,
    state: Arc<ConnectionState>,
    gateway: Arc<dyn MainGateway>,
    config: VoiceConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
    on_ready: Option<Hook>,
    on_terminated: Option<Hook>,
    transport: Option<Arc<AudioTransport>>,
    /// The session reached `Connected` and can be resumed.
    resumable: bool,
    resuming: bool,
    requested: bool,
    failed_attempts: u32,
}

impl SessionActor {
    async fn run(mut self) {
        let server_id = self.target.server_id;
        info!("[Voice gateway] Starting session for server {}", server_id);

        loop {
            self.state.set_status(ConnectionStatus::Connecting);
            let close = self.run_attempt().await;

            if let Some(transport) = &self.transport {
                transport.stop_send();
            }
            info!(
                "[Voice gateway] Closed with code {} by {:?} (server {})",
                close.code, close.initiator, server_id
            );

            let channel = self.state.channel();
            let gateway = Arc::clone(&self.gateway);
            let action = close_action(close, self.requested, || gateway.channel_exists(&channel));
            if action == CloseAction::Terminate {
                break;
            }

            if close.code == CloseCode::SessionNoLongerValid {
                self.resumable = false;
            }
            self.resuming = self.resumable;

            self.failed_attempts += 1;
            if self.failed_attempts > self.config.max_reconnect_attempts {
                error!(
                    "[Voice gateway] Giving up on server {} after {} reconnect attempts",
                    server_id, self.config.max_reconnect_attempts
                );
                self.state.events().emit(VoiceEvent::ReconnectAbandoned {
                    server_id,
                    attempts: self.config.max_reconnect_attempts,
                });
                break;
            }

            let delay = self.config.reconnect_delay(self.failed_attempts);
            self.state.set_status(ConnectionStatus::Reconnecting);
            info!(
                "[Voice gateway] Reconnecting to server {} in {:?} (attempt {}, resume: {})",
                server_id, delay, self.failed_attempts, self.resuming
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.requested = true;
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.finish();
    }

    fn finish(&mut self) {
        self.cancel.cancel();
        if let Some(transport) = self.transport.take() {
            transport.disconnect();
        }

        if self.requested {
            debug!("[Voice gateway] Session for server {} stopped", self.target.server_id);
            return;
        }

        if let Some(hook) = self.on_terminated.take() {
            hook();
        }
        self.state.set_status(ConnectionStatus::Disconnected);
    }

    async fn run_attempt(&mut self) -> CloseInfo {
        let url = gateway_url(&self.target.endpoint);
        debug!("[Voice gateway] Connecting to {}", url);

        let connect = tokio::time::timeout(self.config.handshake_timeout, connect_async(url.as_str()));
        let ws = tokio::select! {
            () = self.cancel.cancelled() => {
                self.requested = true;
                return CloseInfo::client(CloseCode::Normal);
            }
            result = connect => match result {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    warn!("[Voice gateway] Failed to connect to {}: {}", url, e);
                    return CloseInfo::client(CloseCode::Abnormal);
                }
                Err(_) => {
                    warn!("[Voice gateway] Timed out connecting to {}", url);
                    return CloseInfo::client(CloseCode::Abnormal);
                }
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let mut writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("[Voice gateway] Write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let mut link = Link {
            out: out_tx,
            cancel: self.cancel.child_token(),
            heartbeat: None,
            last_heartbeat: Arc::new(Mutex::new(None)),
        };

        let close = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.requested = true;
                    link.close(CloseCode::Normal, "disconnect");
                    break CloseInfo::client(CloseCode::Normal);
                }
                Some(command) = self.commands.recv() => match command {
                    SessionCommand::Speaking(flags) => self.send_speaking(&link, flags),
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match GatewayEvent::decode(&text) {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event, &mut link).await {
                                warn!("[Voice gateway] Handshake step failed: {}", e);
                                link.close(CloseCode::GoingAway, "reconnecting");
                                break CloseInfo::client(CloseCode::Abnormal);
                            }
                        }
                        Err(e) => debug!("[Voice gateway] Ignoring message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map_or(NO_STATUS_RECEIVED, |f| f.code.into());
                        break CloseInfo::server(CloseCode::from(code));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("[Voice gateway] Read failed: {}", e);
                        break CloseInfo::client(CloseCode::Abnormal);
                    }
                    None => break CloseInfo::server(CloseCode::Abnormal),
                },
            }
        };

        drop(link);
        if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }

        close
    }

    async fn handle_event(&mut self, event: GatewayEvent, link: &mut Link) -> Result<(), VoiceError> {
        let server_id = self.target.server_id;
        debug!("[Voice gateway] Received {:?} (server {})", event.opcode(), server_id);

        match event {
            GatewayEvent::Hello { heartbeat_interval } => {
                link.start_heartbeat(heartbeat_interval);
                let command = if self.resuming {
                    GatewayCommand::Resume {
                        server_id: server_id.0,
                        session_id: self.target.session_id.clone(),
                        token: self.target.token.clone(),
                    }
                } else {
                    GatewayCommand::Identify {
                        server_id: server_id.0,
                        user_id: self.target.user_id.0,
                        session_id: self.target.session_id.clone(),
                        token: self.target.token.clone(),
                    }
                };
                link.send(&command)?;
            }
            GatewayEvent::Ready { ssrc, ip, port, modes } => {
                if !modes.is_empty() && !modes.iter().any(|m| m.as_str() == ENCRYPTION_MODE) {
                    warn!("[Voice gateway] Server does not list {} in {:?}", ENCRYPTION_MODE, modes);
                }
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|_| VoiceError::ConnectionFailed(format!("invalid voice server ip {:?}", ip)))?;

                if let Some(old) = self.transport.take() {
                    old.disconnect();
                }
                let transport = Arc::new(AudioTransport::bind(SocketAddr::new(ip, port), ssrc).await?);
                self.transport = Some(Arc::clone(&transport));

                let local = transport.discover_local_address(self.config.discovery_timeout).await?;
                link.send(&GatewayCommand::SelectProtocol { address: local.ip, port: local.port })?;
            }
            GatewayEvent::SessionDescription { mode, secret_key } => {
                let Some(transport) = self.transport.clone() else {
                    warn!("[Voice gateway] Session description before ready, ignoring");
                    return Ok(());
                };
                if mode != ENCRYPTION_MODE {
                    warn!("[Voice gateway] Unexpected encryption mode {:?}", mode);
                }
                transport.set_secret_key(&secret_key)?;
                transport.start_send(Arc::clone(&self.state), &self.cancel)?;
                self.on_connected();

                let flags = self.state.speaking_flags();
                if flags != SpeakingFlags::NONE {
                    self.send_speaking(link, flags);
                }
                if let Some(hook) = self.on_ready.take() {
                    hook();
                }
            }
            GatewayEvent::HeartbeatAck => {
                if let Some(latency) = link.latency() {
                    debug!("[Voice gateway] Heartbeat acknowledged after {:?}", latency);
                }
            }
            GatewayEvent::Resumed => {
                self.resuming = false;
                match &self.transport {
                    Some(transport) => transport.start_send(Arc::clone(&self.state), &self.cancel)?,
                    None => warn!("[Voice gateway] Resumed without an audio transport"),
                }
                self.on_connected();
            }
            GatewayEvent::Speaking { user_id, ssrc, speaking } => {
                self.state.events().emit(VoiceEvent::UserSpeaking {
                    server_id,
                    user_id: user_id.map(UserId),
                    ssrc,
                    flags: SpeakingFlags::from_bits(speaking),
                });
            }
            GatewayEvent::ClientDisconnect { user_id } => {
                self.state.events().emit(VoiceEvent::UserDisconnected {
                    server_id,
                    user_id: UserId(user_id),
                });
            }
        }
        Ok(())
    }

    fn on_connected(&mut self) {
        self.failed_attempts = 0;
        self.resumable = true;
        self.state.set_status(ConnectionStatus::Connected);
    }

    fn send_speaking(&self, link: &Link, flags: SpeakingFlags) {
        let Some(transport) = &self.transport else {
            return;
        };
        let command = GatewayCommand::Speaking { speaking: flags.bits(), delay: 0, ssrc: transport.ssrc() };
        if let Err(e) = link.send(&command) {
            debug!("[Voice gateway] Could not send speaking state: {}", e);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
