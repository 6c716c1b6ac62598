use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voicelink_protocol::{
    decode_reply, encode_probe, AudioPacket, DiscoveredAddress, PacketCipher, RtpHeader,
    SILENCE_FRAME_COUNT,
};

use crate::config::{DATAGRAM_BUFFER_SIZE, FRAME_MILLIS, SAMPLES_PER_FRAME};
use crate::connection::ConnectionState;
use crate::error::VoiceError;
use crate::events::VoiceEvent;
use crate::source::{AudioSourceExt, AudioSourceHandle, Pausable};

/// UDP audio transport to one voice server, identified by (remote, ssrc).
pub(crate) struct AudioTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    remote: SocketAddr,
    ssrc: u32,
    cipher: ArcSwapOption<PacketCipher>,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    sender: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AudioTransport {
    /// Bind a local socket and connect it to the voice server.
    pub(crate) async fn bind(remote: SocketAddr, ssrc: u32) -> Result<Self, VoiceError> {
        let local = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!("[Voice UDP] Bound {} -> {} (ssrc {})", socket.local_addr()?, remote, ssrc);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            remote,
            ssrc,
            cipher: ArcSwapOption::empty(),
            sequence: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
            sender: Mutex::new(None),
        })
    }

    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, VoiceError> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(VoiceError::NotConnected)
    }

    pub(crate) fn set_secret_key(&self, key: &[u8]) -> Result<(), VoiceError> {
        let cipher = PacketCipher::new(key)?;
        self.cipher.store(Some(Arc::new(cipher)));
        Ok(())
    }

    pub(crate) fn has_secret_key(&self) -> bool {
        self.cipher.load().is_some()
    }

    /// Build a sealed datagram; `None` sends a silence frame.
    pub(crate) fn encode_frame(
        &self,
        frame: Option<&[u8]>,
        sequence: u16,
        timestamp: u32,
    ) -> Result<Vec<u8>, VoiceError> {
        let cipher = self.cipher.load();
        let cipher = cipher.as_deref().ok_or(VoiceError::MissingSecretKey)?;
        let packet = AudioPacket::new(RtpHeader::new(sequence, timestamp, self.ssrc), frame);
        Ok(packet.seal(cipher)?)
    }

    /// Claim the sequence number and timestamp of the next datagram.
    fn next_header(&self) -> (u16, u32) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.timestamp.fetch_add(SAMPLES_PER_FRAME, Ordering::Relaxed);
        (sequence, timestamp)
    }

    /// Ask the voice server which public address our packets come from.
    pub(crate) async fn discover_local_address(
        &self,
        timeout: Duration,
    ) -> Result<DiscoveredAddress, VoiceError> {
        let socket = self.socket()?;
        socket.send(&encode_probe(self.ssrc)).await?;

        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];
        let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| VoiceError::Timeout(format!("IP discovery with {}", self.remote)))??;

        let address = decode_reply(&buf[..n])?;
        debug!("[Voice UDP] Discovered local address {}:{}", address.ip, address.port);
        Ok(address)
    }

    /// Start (or restart) the 20 ms send loop.
    pub(crate) fn start_send(
        self: &Arc<Self>,
        state: Arc<ConnectionState>,
        parent: &CancellationToken,
    ) -> Result<(), VoiceError> {
        if !self.has_secret_key() {
            return Err(VoiceError::MissingSecretKey);
        }
        let socket = self.socket()?;
        self.stop_send();

        let cancel = parent.child_token();
        let task = tokio::spawn(send_loop(Arc::clone(self), socket, state, cancel.clone()));
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some((cancel, task));
        Ok(())
    }

    pub(crate) fn stop_send(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((cancel, _task)) = sender {
            cancel.cancel();
        }
    }

    /// Stop sending and release the socket. Safe to call repeatedly.
    pub(crate) fn disconnect(&self) {
        self.stop_send();
        if self.socket.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            debug!("[Voice UDP] Closed socket to {} (ssrc {})", self.remote, self.ssrc);
        }
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        self.stop_send();
    }
}

async fn send_loop(
    transport: Arc<AudioTransport>,
    socket: Arc<UdpSocket>,
    state: Arc<ConnectionState>,
    cancel: CancellationToken,
) {
    info!("[Voice UDP] Send loop started (ssrc {})", transport.ssrc);

    let mut pacer = FramePacer::new(Instant::now());
    let mut send_state = SendState::default();
    let mut tracker = SourceTracker::default();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(pacer.next_deadline()) => {}
        }
        pacer.advance();

        let frame = tracker.poll(&state);
        let (outgoing, speaking) = send_state.step(frame);
        if let Some(speaking) = speaking {
            state.set_speaking(speaking);
        }

        let payload = match outgoing {
            Outgoing::Audio(frame) => Some(frame),
            Outgoing::Silence => None,
            Outgoing::Nothing => continue,
        };

        let (sequence, timestamp) = transport.next_header();
        match transport.encode_frame(payload.as_deref(), sequence, timestamp) {
            Ok(datagram) => {
                if let Err(e) = socket.send(&datagram).await {
                    warn!("[Voice UDP] Dropped frame {}: {}", sequence, e);
                }
            }
            Err(e) => warn!("[Voice UDP] Failed to encode frame {}: {}", sequence, e),
        }
    }

    if send_state.speaking {
        state.set_speaking(false);
    }
    debug!("[Voice UDP] Send loop stopped (ssrc {})", transport.ssrc);
}

/// Frame deadlines at exact multiples of the frame period from a fixed start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FramePacer {
    start: Instant,
    frames: u64,
}

impl FramePacer {
    pub(crate) fn new(start: Instant) -> Self {
        Self { start, frames: 0 }
    }

    pub(crate) fn next_deadline(&self) -> Instant {
        self.start + Duration::from_millis(self.frames * FRAME_MILLIS)
    }

    pub(crate) fn advance(&mut self) {
        self.frames += 1;
    }
}

/// What a single tick puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outgoing {
    Audio(Vec<u8>),
    Silence,
    Nothing,
}

/// Speaking state and silence padding across ticks.
#[derive(Debug, Default)]
pub(crate) struct SendState {
    silence_left: u8,
    speaking: bool,
}

impl SendState {
    /// Returns what to send and, on a transition, the new speaking state.
    pub(crate) fn step(&mut self, frame: Option<Vec<u8>>) -> (Outgoing, Option<bool>) {
        match frame {
            Some(frame) => {
                self.silence_left = SILENCE_FRAME_COUNT;
                let changed = (!self.speaking).then_some(true);
                self.speaking = true;
                (Outgoing::Audio(frame), changed)
            }
            None if self.silence_left > 0 => {
                self.silence_left -= 1;
                (Outgoing::Silence, None)
            }
            None => {
                let changed = self.speaking.then_some(false);
                self.speaking = false;
                (Outgoing::Nothing, changed)
            }
        }
    }
}

/// Polls the attached source and reports its lifecycle as events.
#[derive(Debug, Default)]
pub(crate) struct SourceTracker {
    current: Option<Arc<AudioSourceHandle>>,
    started: bool,
    paused: bool,
    finished: bool,
}

impl SourceTracker {
    pub(crate) fn poll(&mut self, state: &ConnectionState) -> Option<Vec<u8>> {
        let attached = state.audio_source_slot();
        let replaced = match (&self.current, &attached) {
            (Some(current), Some(attached)) => !current.ptr_eq(attached),
            (None, None) => false,
            _ => true,
        };
        if replaced {
            *self = Self { current: attached.clone(), ..Self::default() };
        }

        let handle = attached?;
        let server_id = state.server_id();
        let events = state.events();
        let mut source = handle.lock();

        let paused = source.try_as::<dyn Pausable>().is_some_and(|p| p.is_paused());
        if paused != self.paused {
            self.paused = paused;
            events.emit(if paused {
                VoiceEvent::AudioSourcePaused { server_id }
            } else {
                VoiceEvent::AudioSourceResumed { server_id }
            });
        }

        if source.has_next_frame() {
            let frame = source.poll_next_frame();
            if frame.is_some() {
                if !self.started {
                    self.started = true;
                    events.emit(VoiceEvent::AudioSourceStarted { server_id });
                }
                self.finished = false;
            }
            return frame;
        }

        if self.started && !paused && !self.finished {
            self.finished = true;
            events.emit(VoiceEvent::AudioSourceFinished { server_id });
        }
        None
    }
}
