//! Identifiers, flags and main-gateway payloads shared across the SDK.

use std::fmt;
use std::ops::BitOr;

macro_rules! snowflake {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u64> for $name {
                fn from(id: u64) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

snowflake! {
    /// A server (guild) id.
    ServerId,
    /// A voice channel id.
    ChannelId,
    /// A user id.
    UserId,
}

/// A voice channel and the server that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub server_id: ServerId,
}

impl VoiceChannel {
    #[must_use]
    pub fn new(server_id: impl Into<ServerId>, id: impl Into<ChannelId>) -> Self {
        Self { id: id.into(), server_id: server_id.into() }
    }
}

impl fmt::Display for VoiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.id)
    }
}

/// Speaking mode bitmask sent with SPEAKING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpeakingFlags(u8);

impl SpeakingFlags {
    pub const NONE: Self = Self(0);
    pub const SPEAKING: Self = Self(1);
    pub const SOUNDSHARE: Self = Self(1 << 1);
    pub const PRIORITY_SPEAKER: Self = Self(1 << 2);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for SpeakingFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Lifecycle status of a voice connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Voice state update sent on the main gateway. `channel_id: None` leaves voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub server_id: ServerId,
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Voice server assignment received from the main gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerUpdate {
    pub server_id: ServerId,
    pub token: String,
    pub endpoint: String,
}

/// A user's voice state as reported by the main gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateEvent {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub session_id: String,
    pub channel_id: Option<ChannelId>,
}

/// The slice of the main gateway connection that voice needs.
pub trait MainGateway: Send + Sync + 'static {
    /// Queue a voice state update on the main gateway socket.
    fn send_voice_state_update(&self, update: VoiceStateUpdate);

    /// Session id of the main gateway, used to identify on the voice gateway.
    fn session_id(&self) -> String;

    fn user_id(&self) -> UserId;

    /// Whether the channel still exists in the latest known state.
    fn channel_exists(&self, channel: &VoiceChannel) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_speaking_sets_both_bits() {
        let flags = SpeakingFlags::NONE | SpeakingFlags::PRIORITY_SPEAKER | SpeakingFlags::SPEAKING;
        assert_eq!(flags.bits(), 5);
        assert!(flags.contains(SpeakingFlags::SPEAKING));
        assert!(!flags.contains(SpeakingFlags::SOUNDSHARE));
        assert_eq!(flags.without(SpeakingFlags::PRIORITY_SPEAKER), SpeakingFlags::SPEAKING);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        assert_eq!(SpeakingFlags::from_bits(0xFF).bits(), 7);
    }
}
