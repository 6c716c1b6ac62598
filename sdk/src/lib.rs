pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod source;

mod connection;
mod gateway;
mod manager;
mod transport;

pub use config::VoiceConfig;
pub use connection::VoiceConnection;
pub use error::{SourceError, VoiceError};
pub use events::{EventHandler, VoiceEvent};
pub use manager::VoiceConnectionManager;
pub use model::{
    ChannelId, ConnectionStatus, MainGateway, ServerId, SpeakingFlags, UserId, VoiceChannel,
    VoiceServerUpdate, VoiceStateEvent, VoiceStateUpdate,
};
pub use source::{
    AudioSource, AudioSourceExt, AudioSourceHandle, BufferedAudioSource, FileAudioSource,
    FixedLength, Nameable, Pausable, Replayable, Seekable,
};
