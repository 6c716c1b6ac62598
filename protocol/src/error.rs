use std::fmt;

/// Protocol encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    PacketTooShort { expected: usize, got: usize },
    UnknownOpcode(u8),
    UnexpectedOpcode(u8),
    InvalidUtf8,
    InvalidHeader { packet_type: u8, version: u8 },
    MalformedPayload(String),
    InvalidKeyLength(usize),
    EncryptionFailed,
    AuthenticationFailed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PacketTooShort { expected, got } => {
                write!(f, "packet too short: expected at least {} bytes, got {}", expected, got)
            }
            ProtocolError::UnknownOpcode(op) => {
                write!(f, "unknown opcode: {}", op)
            }
            ProtocolError::UnexpectedOpcode(op) => {
                write!(f, "opcode {} is not sent by the server", op)
            }
            ProtocolError::InvalidUtf8 => {
                write!(f, "invalid UTF-8 encoding")
            }
            ProtocolError::InvalidHeader { packet_type, version } => {
                write!(f, "invalid RTP header: type 0x{:02x}, version 0x{:02x}", packet_type, version)
            }
            ProtocolError::MalformedPayload(msg) => {
                write!(f, "malformed payload: {}", msg)
            }
            ProtocolError::InvalidKeyLength(len) => {
                write!(f, "invalid secret key length: {} bytes", len)
            }
            ProtocolError::EncryptionFailed => {
                write!(f, "audio payload encryption failed")
            }
            ProtocolError::AuthenticationFailed => {
                write!(f, "audio payload failed authentication")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::MalformedPayload(e.to_string())
    }
}
