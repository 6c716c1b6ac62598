use std::fmt;

use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Nonce, XSalsa20Poly1305};

use crate::error::ProtocolError;
use crate::rtp::{RtpHeader, RTP_HEADER_LEN};

/// Length of the secret key handed out in the session description.
pub const KEY_LEN: usize = 32;

/// One Opus frame of silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Silence frames sent after speech stops, so decoders don't interpolate.
pub const SILENCE_FRAME_COUNT: u8 = 5;

/// Audio encryption mode announced in SELECT PROTOCOL.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// Secret box used to seal audio payloads.
#[derive(Clone)]
pub struct PacketCipher {
    inner: XSalsa20Poly1305,
}

impl PacketCipher {
    /// # Errors
    /// Returns error if `key` is not exactly [`KEY_LEN`] bytes.
    pub fn new(key: &[u8]) -> Result<Self, ProtocolError> {
        if key.len() != KEY_LEN {
            return Err(ProtocolError::InvalidKeyLength(key.len()));
        }
        let inner = XSalsa20Poly1305::new_from_slice(key)
            .map_err(|_| ProtocolError::InvalidKeyLength(key.len()))?;
        Ok(Self { inner })
    }
}

impl fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCipher").finish_non_exhaustive()
    }
}

/// An outgoing audio packet before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPacket<'a> {
    pub header: RtpHeader,
    pub payload: &'a [u8],
}

impl<'a> AudioPacket<'a> {
    /// A `None` payload is sent as a silence frame.
    #[must_use]
    pub fn new(header: RtpHeader, payload: Option<&'a [u8]>) -> Self {
        Self {
            header,
            payload: payload.unwrap_or(&SILENCE_FRAME),
        }
    }

    /// Header followed by the sealed payload, ready to send.
    ///
    /// # Errors
    /// Returns error if the cipher rejects the payload.
    pub fn seal(&self, cipher: &PacketCipher) -> Result<Vec<u8>, ProtocolError> {
        let nonce = self.header.nonce();
        let sealed = cipher
            .inner
            .encrypt(Nonce::from_slice(&nonce), self.payload)
            .map_err(|_| ProtocolError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(RTP_HEADER_LEN + sealed.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Split a sealed datagram into its header and decrypted payload.
    ///
    /// # Errors
    /// Returns error if the header is invalid or authentication fails.
    pub fn open(datagram: &[u8], cipher: &PacketCipher) -> Result<(RtpHeader, Vec<u8>), ProtocolError> {
        let header = RtpHeader::parse(datagram)?;
        let nonce = header.nonce();
        let payload = cipher
            .inner
            .decrypt(Nonce::from_slice(&nonce), &datagram[RTP_HEADER_LEN..])
            .map_err(|_| ProtocolError::AuthenticationFailed)?;
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PacketCipher {
        PacketCipher::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn sealed_packet_opens_with_same_key() {
        let header = RtpHeader::new(41, 19_200, 1234);
        let packet = AudioPacket::new(header, Some(&[1, 2, 3, 4, 5]));

        let datagram = packet.seal(&cipher()).unwrap();
        assert_eq!(&datagram[..RTP_HEADER_LEN], &header.to_bytes());
        // 16 byte Poly1305 tag
        assert_eq!(datagram.len(), RTP_HEADER_LEN + 5 + 16);

        let (parsed, payload) = AudioPacket::open(&datagram, &cipher()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn missing_payload_is_silence() {
        let packet = AudioPacket::new(RtpHeader::new(0, 0, 1), None);
        assert_eq!(packet.payload, &SILENCE_FRAME);

        let datagram = packet.seal(&cipher()).unwrap();
        let (_, payload) = AudioPacket::open(&datagram, &cipher()).unwrap();
        assert_eq!(payload, SILENCE_FRAME);
    }

    #[test]
    fn tampered_datagram_is_rejected() {
        let packet = AudioPacket::new(RtpHeader::new(1, 960, 99), Some(&[9; 40]));
        let datagram = packet.seal(&cipher()).unwrap();
        let last = datagram.len() - 1;

        let mut flipped = datagram.clone();
        flipped[last] ^= 0x01;
        assert_eq!(
            AudioPacket::open(&flipped, &cipher()),
            Err(ProtocolError::AuthenticationFailed)
        );

        for i in 0..datagram.len() {
            let mut flipped = datagram.clone();
            flipped[i] ^= 0x01;
            assert!(AudioPacket::open(&flipped, &cipher()).is_err(), "byte {} accepted", i);
        }
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let packet = AudioPacket::new(RtpHeader::new(7, 1920, 4242), Some(&[3; 20]));
        let datagram = packet.seal(&cipher()).unwrap();

        // sequence, timestamp and ssrc are all bound through the nonce
        for i in 2..RTP_HEADER_LEN {
            let mut flipped = datagram.clone();
            flipped[i] ^= 0x80;
            assert_eq!(
                AudioPacket::open(&flipped, &cipher()),
                Err(ProtocolError::AuthenticationFailed),
                "header byte {}",
                i
            );
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let packet = AudioPacket::new(RtpHeader::new(1, 960, 99), Some(&[9; 40]));
        let datagram = packet.seal(&cipher()).unwrap();
        let other = PacketCipher::new(&[8u8; KEY_LEN]).unwrap();
        assert!(AudioPacket::open(&datagram, &other).is_err());
    }

    #[test]
    fn key_length_is_checked() {
        assert_eq!(
            PacketCipher::new(&[0u8; 16]).unwrap_err(),
            ProtocolError::InvalidKeyLength(16)
        );
    }
}
