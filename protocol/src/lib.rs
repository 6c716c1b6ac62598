//! Wire formats for the voicelink voice gateway and UDP audio transport.

mod io;

pub mod close_code;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod opcode;
pub mod packet;
pub mod rtp;

pub use close_code::CloseCode;
pub use discovery::{decode_reply, encode_probe, DiscoveredAddress, DISCOVERY_PACKET_LEN};
pub use error::ProtocolError;
pub use gateway::{gateway_url, GatewayCommand, GatewayEvent, GATEWAY_VERSION};
pub use opcode::Opcode;
pub use packet::{
    AudioPacket, PacketCipher, ENCRYPTION_MODE, KEY_LEN, SILENCE_FRAME, SILENCE_FRAME_COUNT,
};
pub use rtp::{RtpHeader, NONCE_LEN, RTP_HEADER_LEN};
