use std::time::Duration;

use super::{
    AudioSource, CapabilityKind, CapabilityMut, FixedLength, FrameCursor, Nameable, Pausable,
    Replayable, Seekable,
};
use crate::error::SourceError;

/// Plays a list of pre-encoded frames held in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferedAudioSource {
    frames: Vec<Vec<u8>>,
    cursor: FrameCursor,
    paused: bool,
    name: String,
}

impl BufferedAudioSource {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        let cursor = FrameCursor::new(frames.len());
        Self { frames, cursor, paused: false, name: String::from("buffer") }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl AudioSource for BufferedAudioSource {
    fn poll_next_frame(&mut self) -> Option<Vec<u8>> {
        if !self.has_next_frame() {
            return None;
        }
        let frame = self.frames.get(self.cursor.next()).cloned();
        self.cursor.advance();
        frame
    }

    fn has_next_frame(&self) -> bool {
        !self.paused && !self.cursor.is_exhausted()
    }

    fn stop(&mut self) {
        self.frames.clear();
        self.cursor.rewind(0);
    }

    fn capability(&mut self, kind: CapabilityKind) -> Option<CapabilityMut<'_>> {
        Some(match kind {
            CapabilityKind::Pausable => CapabilityMut::Pausable(self),
            CapabilityKind::Seekable => CapabilityMut::Seekable(self),
            CapabilityKind::FixedLength => CapabilityMut::FixedLength(self),
            CapabilityKind::Replayable => CapabilityMut::Replayable(self),
            CapabilityKind::Nameable => CapabilityMut::Nameable(self),
        })
    }
}

impl Pausable for BufferedAudioSource {
    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}

impl FixedLength for BufferedAudioSource {
    fn length(&self) -> Duration {
        self.cursor.length()
    }

    fn played(&self) -> Duration {
        self.cursor.position()
    }
}

impl Seekable for BufferedAudioSource {
    fn jump_to(&mut self, position: Duration) -> Result<(), SourceError> {
        self.cursor.jump_to(position)
    }

    fn position(&self) -> Duration {
        self.cursor.position()
    }
}

impl Replayable for BufferedAudioSource {
    fn reset(&mut self) {
        self.cursor.rewind(self.frames.len());
    }
}

impl Nameable for BufferedAudioSource {
    fn name(&self) -> &str {
        &self.name
    }
}
