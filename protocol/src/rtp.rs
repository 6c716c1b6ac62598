use crate::error::ProtocolError;
use crate::io::{Reader, Writer};

/// Length of the RTP header preceding every audio payload.
pub const RTP_HEADER_LEN: usize = 12;

/// First header byte (RTP version 2, no padding/extension/CSRC).
pub const RTP_TYPE: u8 = 0x80;

/// Second header byte (payload type used for voice audio).
pub const RTP_VERSION: u8 = 0x78;

/// Nonce length of the XSalsa20-Poly1305 secret box.
pub const NONCE_LEN: usize = 24;

/// Header of one outgoing audio datagram.
///
/// Layout: `[0x80][0x78][sequence: u16][timestamp: u32][ssrc: u32]`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    #[must_use]
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self { sequence, timestamp, ssrc }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut w = Writer::with_capacity(RTP_HEADER_LEN);
        w.write_u8(RTP_TYPE);
        w.write_u8(RTP_VERSION);
        w.write_u16(self.sequence);
        w.write_u32(self.timestamp);
        w.write_u32(self.ssrc);

        let mut out = [0u8; RTP_HEADER_LEN];
        out.copy_from_slice(&w.into_vec());
        out
    }

    /// The header zero-padded to the cipher's nonce length.
    #[must_use]
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut w = Writer::with_capacity(NONCE_LEN);
        w.write_bytes(&self.to_bytes());
        w.pad_to(NONCE_LEN);

        let mut out = [0u8; NONCE_LEN];
        out.copy_from_slice(&w.into_vec());
        out
    }

    /// Parse the header at the front of a datagram.
    ///
    /// # Errors
    /// Returns error if the buffer is shorter than a header or the fixed bytes are wrong.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf);
        let packet_type = r.read_u8()?;
        let version = r.read_u8()?;
        if packet_type != RTP_TYPE || version != RTP_VERSION {
            return Err(ProtocolError::InvalidHeader { packet_type, version });
        }

        Ok(Self {
            sequence: r.read_u16()?,
            timestamp: r.read_u32()?,
            ssrc: r.read_u32()?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unreadable_literal)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = RtpHeader::new(0x0102, 0x03040506, 0x0708090A);
        assert_eq!(
            header.to_bytes(),
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
    }

    #[test]
    fn nonce_is_zero_padded_header() {
        let header = RtpHeader::new(7, 960, 42);
        let nonce = header.nonce();
        assert_eq!(&nonce[..RTP_HEADER_LEN], &header.to_bytes());
        assert!(nonce[RTP_HEADER_LEN..].iter().all(|b| *b == 0));
    }

    #[test]
    fn parse_rejects_foreign_header() {
        let mut bytes = RtpHeader::new(1, 2, 3).to_bytes();
        bytes[1] = 0x60;
        assert_eq!(
            RtpHeader::parse(&bytes),
            Err(ProtocolError::InvalidHeader { packet_type: 0x80, version: 0x60 })
        );
    }

    #[test]
    fn parse_rejects_truncated_header() {
        let bytes = RtpHeader::new(1, 2, 3).to_bytes();
        assert!(matches!(
            RtpHeader::parse(&bytes[..8]),
            Err(ProtocolError::PacketTooShort { .. })
        ));
    }
}
