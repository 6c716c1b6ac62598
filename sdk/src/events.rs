use async_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::EVENT_QUEUE_CAPACITY;

use crate::model::{ConnectionStatus, ServerId, SpeakingFlags, UserId};

/// Events emitted by voice connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    /// A connection changed status
    StatusChanged {
        server_id: ServerId,
        status: ConnectionStatus,
    },
    /// Our own speaking state changed
    SpeakingChanged { server_id: ServerId, speaking: bool },
    /// The gateway session gave up reconnecting; the connection is disconnected
    ReconnectAbandoned { server_id: ServerId, attempts: u32 },
    /// The send loop took the first frame from a newly attached source
    AudioSourceStarted { server_id: ServerId },
    /// The active source has no more frames and is not paused
    AudioSourceFinished { server_id: ServerId },
    /// The active source was paused
    AudioSourcePaused { server_id: ServerId },
    /// The active source was resumed
    AudioSourceResumed { server_id: ServerId },
    /// Another participant started or stopped speaking
    UserSpeaking {
        server_id: ServerId,
        user_id: Option<UserId>,
        ssrc: u32,
        flags: SpeakingFlags,
    },
    /// Another participant left the voice channel
    UserDisconnected { server_id: ServerId, user_id: UserId },
}

/// Fan-in point for voice events, drained through [`EventHandler::event_stream`]
#[derive(Debug, Clone)]
pub struct EventHandler {
    event_tx: Sender<VoiceEvent>,
    event_rx: Receiver<VoiceEvent>,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (event_tx, event_rx) = bounded(capacity);

        Self {
            event_tx,
            event_rx,
        }
    }

    /// Get event stream for emitted events
    pub fn event_stream(&self) -> Receiver<VoiceEvent> {
        self.event_rx.clone()
    }

    pub fn emit(&self, event: VoiceEvent) {
        debug!("Voice event: {:?}", event);
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Voice event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => warn!("Voice event channel closed"),
        }
    }
}
