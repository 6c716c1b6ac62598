//! Audio sources and their optional capabilities.
//!
//! A source hands out one opaque encoded frame per 20 ms tick. Extra
//! behaviour (pausing, seeking, ...) is discovered at runtime:
//!
//! ```ignore
//! if let Some(seekable) = source.try_as::<dyn Seekable>() {
//!     seekable.forward(Duration::from_secs(10))?;
//! }
//! ```

mod buffered;
mod file;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::FRAME_DURATION;
use crate::error::SourceError;

pub use buffered::BufferedAudioSource;
pub use file::FileAudioSource;

/// A producer of encoded audio frames.
pub trait AudioSource: Send {
    /// Take the next frame, if one is ready.
    fn poll_next_frame(&mut self) -> Option<Vec<u8>>;

    fn has_next_frame(&self) -> bool;

    /// Release underlying resources. Safe to call more than once.
    fn stop(&mut self) {}

    /// Expose one of the optional capabilities, if implemented.
    fn capability(&mut self, kind: CapabilityKind) -> Option<CapabilityMut<'_>> {
        let _ = kind;
        None
    }
}

/// Tag for each optional capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Pausable,
    Seekable,
    FixedLength,
    Replayable,
    Nameable,
}

/// Borrowed view of a source through one capability.
pub enum CapabilityMut<'a> {
    Pausable(&'a mut (dyn Pausable + 'static)),
    Seekable(&'a mut (dyn Seekable + 'static)),
    FixedLength(&'a mut (dyn FixedLength + 'static)),
    Replayable(&'a mut (dyn Replayable + 'static)),
    Nameable(&'a mut (dyn Nameable + 'static)),
}

/// Sources that can be paused without losing their position.
pub trait Pausable {
    fn pause(&mut self);
    fn resume(&mut self);
    fn is_paused(&self) -> bool;
}

/// Sources with a known total length.
pub trait FixedLength {
    fn length(&self) -> Duration;
    fn played(&self) -> Duration;

    fn remaining(&self) -> Duration {
        self.length().saturating_sub(self.played())
    }
}

/// Sources that can jump to a position.
///
/// A failed jump leaves the position unchanged.
pub trait Seekable {
    /// # Errors
    /// Returns [`SourceError::OutOfBounds`] if `position` is past the end.
    fn jump_to(&mut self, position: Duration) -> Result<(), SourceError>;

    fn position(&self) -> Duration;

    /// # Errors
    /// Returns [`SourceError::OutOfBounds`] if the target is past the end.
    fn forward(&mut self, offset: Duration) -> Result<(), SourceError> {
        let target = self
            .position()
            .checked_add(offset)
            .ok_or(SourceError::OutOfBounds { target_ms: i128::MAX })?;
        self.jump_to(target)
    }

    /// # Errors
    /// Returns [`SourceError::OutOfBounds`] if the target is before the start.
    fn backward(&mut self, offset: Duration) -> Result<(), SourceError> {
        let position = self.position();
        match position.checked_sub(offset) {
            Some(target) => self.jump_to(target),
            None => Err(SourceError::OutOfBounds {
                target_ms: signed_millis(position) - signed_millis(offset),
            }),
        }
    }
}

/// Sources that can start over with identical output.
pub trait Replayable {
    fn reset(&mut self);
}

pub trait Nameable {
    fn name(&self) -> &str;
}

/// Maps a capability trait object to its tag.
pub trait Capability {
    const KIND: CapabilityKind;

    fn from_capability(capability: CapabilityMut<'_>) -> Option<&mut Self>;
}

macro_rules! capabilities {
    ($($name:ident),* $(,)?) => {
        $(
            impl Capability for dyn $name {
                const KIND: CapabilityKind = CapabilityKind::$name;

                fn from_capability(capability: CapabilityMut<'_>) -> Option<&mut Self> {
                    match capability {
                        CapabilityMut::$name(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

capabilities!(Pausable, Seekable, FixedLength, Replayable, Nameable);

/// Capability lookup for any source, including `dyn AudioSource`.
pub trait AudioSourceExt {
    fn try_as<C: Capability + ?Sized>(&mut self) -> Option<&mut C>;
}

impl<S: AudioSource + ?Sized> AudioSourceExt for S {
    fn try_as<C: Capability + ?Sized>(&mut self) -> Option<&mut C> {
        self.capability(C::KIND).and_then(C::from_capability)
    }
}

/// Shared handle to the source attached to a connection.
///
/// The send loop and the caller both hold one; the caller keeps control
/// (pause, seek, stop) after attaching it.
#[derive(Clone)]
pub struct AudioSourceHandle {
    inner: Arc<Mutex<Box<dyn AudioSource>>>,
}

impl AudioSourceHandle {
    pub fn new(source: impl AudioSource + 'static) -> Self {
        Self { inner: Arc::new(Mutex::new(Box::new(source))) }
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn AudioSource>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the source.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn AudioSource) -> R) -> R {
        let mut guard = self.lock();
        f(guard.as_mut())
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AudioSourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSourceHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

fn signed_millis(d: Duration) -> i128 {
    i128::try_from(d.as_millis()).unwrap_or(i128::MAX)
}

/// Frame-granular play position shared by the bundled sources.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FrameCursor {
    next: usize,
    total: usize,
}

impl FrameCursor {
    pub(crate) fn new(total: usize) -> Self {
        Self { next: 0, total }
    }

    pub(crate) fn next(&self) -> usize {
        self.next
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.next >= self.total
    }

    pub(crate) fn advance(&mut self) {
        self.next = (self.next + 1).min(self.total);
    }

    pub(crate) fn rewind(&mut self, total: usize) {
        self.next = 0;
        self.total = total;
    }

    pub(crate) fn length(&self) -> Duration {
        frames_to_duration(self.total)
    }

    pub(crate) fn position(&self) -> Duration {
        frames_to_duration(self.next)
    }

    /// Positions inside a frame round down to its start.
    pub(crate) fn jump_to(&mut self, position: Duration) -> Result<(), SourceError> {
        if position > self.length() {
            return Err(SourceError::OutOfBounds { target_ms: signed_millis(position) });
        }
        let frame = position.as_nanos() / FRAME_DURATION.as_nanos();
        self.next = usize::try_from(frame).unwrap_or(self.total).min(self.total);
        Ok(())
    }
}

fn frames_to_duration(frames: usize) -> Duration {
    FRAME_DURATION * u32::try_from(frames).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(seconds: usize) -> BufferedAudioSource {
        // 50 frames per second
        BufferedAudioSource::new((0..seconds * 50).map(|i| vec![(i % 251) as u8; 8]).collect())
    }

    #[test]
    fn seek_forward_then_out_of_bounds_backward() {
        let mut src = source(60);
        let seekable = src.try_as::<dyn Seekable>().unwrap();

        seekable.jump_to(Duration::from_secs(30)).unwrap();
        seekable.forward(Duration::from_secs(10)).unwrap();
        assert_eq!(seekable.position(), Duration::from_secs(40));

        let err = seekable.backward(Duration::from_secs(50)).unwrap_err();
        assert!(matches!(err, SourceError::OutOfBounds { target_ms: -10_000 }));
        assert_eq!(seekable.position(), Duration::from_secs(40));
    }

    #[test]
    fn jump_past_end_keeps_position() {
        let mut src = source(5);
        let seekable = src.try_as::<dyn Seekable>().unwrap();
        seekable.jump_to(Duration::from_secs(2)).unwrap();

        assert!(seekable.jump_to(Duration::from_secs(6)).is_err());
        assert!(seekable.forward(Duration::from_secs(4)).is_err());
        assert_eq!(seekable.position(), Duration::from_secs(2));
    }

    #[test]
    fn pausing_holds_frames() {
        let mut src = source(1);
        src.poll_next_frame().unwrap();

        src.try_as::<dyn Pausable>().unwrap().pause();
        assert!(!src.has_next_frame());
        assert!(src.poll_next_frame().is_none());

        src.try_as::<dyn Pausable>().unwrap().resume();
        assert!(src.has_next_frame());
        assert_eq!(src.try_as::<dyn FixedLength>().unwrap().played(), FRAME_DURATION);
    }

    #[test]
    fn fixed_length_rounds_down_in_coarser_units() {
        let mut src = BufferedAudioSource::new(vec![vec![0]; 76]);
        let len = src.try_as::<dyn FixedLength>().unwrap();
        assert_eq!(len.length(), Duration::from_millis(1520));
        assert_eq!(len.length().as_secs(), 1);
        assert_eq!(len.remaining(), len.length());
    }

    #[test]
    fn replay_yields_identical_output() {
        let mut src = source(1);
        let first: Vec<Vec<u8>> = std::iter::from_fn(|| src.poll_next_frame()).collect();
        assert!(!src.has_next_frame());

        src.try_as::<dyn Replayable>().unwrap().reset();
        let second: Vec<Vec<u8>> = std::iter::from_fn(|| src.poll_next_frame()).collect();
        assert_eq!(first.len(), 50);
        assert_eq!(first, second);
    }

    #[test]
    fn capabilities_through_trait_object() {
        struct Plain;
        impl AudioSource for Plain {
            fn poll_next_frame(&mut self) -> Option<Vec<u8>> {
                None
            }
            fn has_next_frame(&self) -> bool {
                false
            }
        }

        let mut plain: Box<dyn AudioSource> = Box::new(Plain);
        assert!(plain.try_as::<dyn Pausable>().is_none());
        assert!(plain.try_as::<dyn Nameable>().is_none());

        let mut named: Box<dyn AudioSource> = Box::new(source(1).with_name("jingle"));
        assert_eq!(named.try_as::<dyn Nameable>().unwrap().name(), "jingle");
    }

    #[test]
    fn handle_shares_state() {
        let handle = AudioSourceHandle::new(source(1));
        let other = handle.clone();
        handle.with(|s| s.poll_next_frame());
        let played = other.with(|s| s.try_as::<dyn FixedLength>().map(|f| f.played()));
        assert_eq!(played, Some(FRAME_DURATION));
        assert!(handle.ptr_eq(&other));
    }
}
