use std::net::IpAddr;

use crate::error::ProtocolError;
use crate::io::{Reader, Writer};

/// Size of both the IP discovery probe and its reply.
pub const DISCOVERY_PACKET_LEN: usize = 70;

/// Public address as seen by the voice server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: String,
    pub port: u16,
}

/// Probe packet: the ssrc followed by zero padding.
#[must_use]
pub fn encode_probe(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut w = Writer::with_capacity(DISCOVERY_PACKET_LEN);
    w.write_u32(ssrc);
    w.pad_to(DISCOVERY_PACKET_LEN);

    let mut out = [0u8; DISCOVERY_PACKET_LEN];
    out.copy_from_slice(&w.into_vec());
    out
}

/// Decode the server's reply to a probe.
///
/// The address is read from byte 3 up to the two trailing port bytes
/// (little-endian). Byte 3 is the low byte of the echoed ssrc, so if the text
/// there is not an address the read starts one byte later.
///
/// # Errors
/// Returns error if the reply is too short or the address is not UTF-8.
pub fn decode_reply(reply: &[u8]) -> Result<DiscoveredAddress, ProtocolError> {
    if reply.len() < 6 {
        return Err(ProtocolError::PacketTooShort { expected: 6, got: reply.len() });
    }

    let mut r = Reader::new(reply);
    r.read_bytes(3)?;
    let ip_bytes = r.read_bytes(reply.len() - 5)?;
    let port_bytes = r.read_bytes(2)?;
    let port = u16::from_le_bytes([port_bytes[0], port_bytes[1]]);

    let ip = match trimmed_ip(ip_bytes) {
        Ok(ip) if ip.parse::<IpAddr>().is_ok() => ip,
        _ => trimmed_ip(&ip_bytes[1..])?,
    };

    Ok(DiscoveredAddress { ip, port })
}

fn trimmed_ip(bytes: &[u8]) -> Result<String, ProtocolError> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let text = std::str::from_utf8(&bytes[..end]).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(text.trim_matches(|c: char| c <= ' ').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(ip: &str, port: u16) -> Vec<u8> {
        let mut buf = vec![0u8; DISCOVERY_PACKET_LEN];
        buf[..4].copy_from_slice(&77u32.to_be_bytes());
        buf[4..4 + ip.len()].copy_from_slice(ip.as_bytes());
        let n = buf.len();
        buf[n - 2..].copy_from_slice(&port.to_le_bytes());
        buf
    }

    #[test]
    fn probe_carries_ssrc() {
        let probe = encode_probe(0xDEAD_BEEF);
        assert_eq!(probe.len(), DISCOVERY_PACKET_LEN);
        assert_eq!(&probe[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(probe[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn reply_yields_address_and_port() {
        let addr = decode_reply(&reply("203.0.113.9", 50_004)).unwrap();
        assert_eq!(addr.ip, "203.0.113.9");
        assert_eq!(addr.port, 50_004);
    }

    #[test]
    fn address_may_start_at_byte_three() {
        let mut buf = vec![0u8; DISCOVERY_PACKET_LEN];
        buf[3..12].copy_from_slice(b"10.1.2.30");
        let n = buf.len();
        buf[n - 2..].copy_from_slice(&443u16.to_le_bytes());

        let addr = decode_reply(&buf).unwrap();
        assert_eq!(addr, DiscoveredAddress { ip: "10.1.2.30".into(), port: 443 });
    }

    #[test]
    fn short_reply_is_rejected() {
        assert!(matches!(decode_reply(&[0; 4]), Err(ProtocolError::PacketTooShort { .. })));
    }
}
