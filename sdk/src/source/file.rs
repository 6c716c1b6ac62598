use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    AudioSource, CapabilityKind, CapabilityMut, FixedLength, FrameCursor, Nameable, Pausable,
    Replayable, Seekable,
};
use crate::config::FILE_FRAME_SIZE;
use crate::error::SourceError;

/// Plays a raw file of pre-encoded audio in fixed-size frames.
///
/// The file is read into memory once, at construction, and kept until the
/// source is dropped. A trailing partial frame is not played.
#[derive(Debug)]
pub struct FileAudioSource {
    path: PathBuf,
    name: String,
    data: Vec<u8>,
    cursor: FrameCursor,
    paused: bool,
    stopped: bool,
}

impl FileAudioSource {
    /// Opens `path`; a missing or unreadable file is logged and yields no frames.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!("[Audio source] Failed to read {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self::from_bytes(path, data)
    }

    /// Like [`FileAudioSource::new`] but surfaces the read error.
    ///
    /// # Errors
    /// Returns error if the file cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        Ok(Self::from_bytes(path, data))
    }

    fn from_bytes(path: PathBuf, data: Vec<u8>) -> Self {
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let cursor = FrameCursor::new(data.len() / FILE_FRAME_SIZE);
        debug!("[Audio source] Loaded {} ({} bytes, {:?})", name, data.len(), cursor.length());

        Self { path, name, data, cursor, paused: false, stopped: false }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for FileAudioSource {
    fn poll_next_frame(&mut self) -> Option<Vec<u8>> {
        if !self.has_next_frame() {
            return None;
        }
        let start = self.cursor.next() * FILE_FRAME_SIZE;
        let frame = self.data.get(start..start + FILE_FRAME_SIZE).map(<[u8]>::to_vec);
        self.cursor.advance();
        frame
    }

    fn has_next_frame(&self) -> bool {
        !self.stopped && !self.paused && !self.cursor.is_exhausted()
    }

    fn stop(&mut self) {
        self.stopped = true;
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

impl Pausable for FileAudioSource {
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

impl FixedLength for FileAudioSource {
    fn length(&self) -> Duration {
        self.cursor.length()
    }

    fn played(&self) -> Duration {
        self.cursor.position()
    }
}

impl Seekable for FileAudioSource {
    fn jump_to(&mut self, position: Duration) -> Result<(), SourceError> {
        self.cursor.jump_to(position)
    }

    fn position(&self) -> Duration {
        self.cursor.position()
    }
}

impl Replayable for FileAudioSource {
    /// Rewinds to the first frame, also after [`AudioSource::stop`].
    fn reset(&mut self) {
        self.stopped = false;
        self.cursor.rewind(self.data.len() / FILE_FRAME_SIZE);
    }
}

impl Nameable for FileAudioSource {
    fn name(&self) -> &str {
        &self.name
    }
}
