use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::packet::ENCRYPTION_MODE;

/// Voice gateway protocol version requested in the connect url.
pub const GATEWAY_VERSION: u8 = 4;

/// Build the websocket url for a voice server endpoint.
#[must_use]
pub fn gateway_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    let endpoint = endpoint.strip_suffix(":80").unwrap_or(endpoint);
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        format!("{}/?v={}", endpoint, GATEWAY_VERSION)
    } else {
        format!("wss://{}/?v={}", endpoint, GATEWAY_VERSION)
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    op: u8,
    #[serde(default)]
    d: Value,
}

/// Snowflake ids arrive either as strings or as numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Snowflake {
    Text(String),
    Number(u64),
}

impl Snowflake {
    fn into_u64(self) -> Result<u64, ProtocolError> {
        match self {
            Snowflake::Number(n) => Ok(n),
            Snowflake::Text(s) => s
                .parse()
                .map_err(|_| ProtocolError::MalformedPayload(format!("invalid id {:?}", s))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadyData {
    ssrc: u32,
    ip: String,
    port: u16,
    #[serde(default)]
    modes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SessionDescriptionData {
    #[serde(default)]
    mode: String,
    secret_key: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct SpeakingData {
    user_id: Option<Snowflake>,
    #[serde(default)]
    ssrc: u32,
    #[serde(default)]
    speaking: u8,
}

#[derive(Debug, Deserialize)]
struct HelloData {
    heartbeat_interval: f64,
}

#[derive(Debug, Deserialize)]
struct ClientDisconnectData {
    user_id: Snowflake,
}

/// Messages received from the voice gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Ready {
        ssrc: u32,
        ip: String,
        port: u16,
        modes: Vec<String>,
    },
    SessionDescription {
        mode: String,
        secret_key: Vec<u8>,
    },
    Speaking {
        user_id: Option<u64>,
        ssrc: u32,
        speaking: u8,
    },
    HeartbeatAck,
    Hello {
        heartbeat_interval: Duration,
    },
    Resumed,
    ClientDisconnect {
        user_id: u64,
    },
}

impl GatewayEvent {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error on invalid JSON, unknown or client-only opcodes and bad payloads.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)?;
        let op = Opcode::try_from(frame.op)?;

        match op {
            Opcode::Ready => {
                let d: ReadyData = serde_json::from_value(frame.d)?;
                Ok(GatewayEvent::Ready { ssrc: d.ssrc, ip: d.ip, port: d.port, modes: d.modes })
            }
            Opcode::SessionDescription => {
                let d: SessionDescriptionData = serde_json::from_value(frame.d)?;
                Ok(GatewayEvent::SessionDescription { mode: d.mode, secret_key: d.secret_key })
            }
            Opcode::Speaking => {
                let d: SpeakingData = serde_json::from_value(frame.d)?;
                Ok(GatewayEvent::Speaking {
                    user_id: d.user_id.map(Snowflake::into_u64).transpose()?,
                    ssrc: d.ssrc,
                    speaking: d.speaking,
                })
            }
            Opcode::HeartbeatAck => Ok(GatewayEvent::HeartbeatAck),
            Opcode::Hello => {
                let d: HelloData = serde_json::from_value(frame.d)?;
                if !d.heartbeat_interval.is_finite() || d.heartbeat_interval <= 0.0 {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "invalid heartbeat interval {}",
                        d.heartbeat_interval
                    )));
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let micros = (d.heartbeat_interval * 1000.0).round() as u64;
                Ok(GatewayEvent::Hello { heartbeat_interval: Duration::from_micros(micros) })
            }
            Opcode::Resumed => Ok(GatewayEvent::Resumed),
            Opcode::ClientDisconnect => {
                let d: ClientDisconnectData = serde_json::from_value(frame.d)?;
                Ok(GatewayEvent::ClientDisconnect { user_id: d.user_id.into_u64()? })
            }
            Opcode::Identify | Opcode::SelectProtocol | Opcode::Heartbeat | Opcode::Resume => {
                Err(ProtocolError::UnexpectedOpcode(op.as_u8()))
            }
        }
    }

    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            GatewayEvent::Ready { .. } => Opcode::Ready,
            GatewayEvent::SessionDescription { .. } => Opcode::SessionDescription,
            GatewayEvent::Speaking { .. } => Opcode::Speaking,
            GatewayEvent::HeartbeatAck => Opcode::HeartbeatAck,
            GatewayEvent::Hello { .. } => Opcode::Hello,
            GatewayEvent::Resumed => Opcode::Resumed,
            GatewayEvent::ClientDisconnect { .. } => Opcode::ClientDisconnect,
        }
    }
}

/// Messages sent to the voice gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    Identify {
        server_id: u64,
        user_id: u64,
        session_id: String,
        token: String,
    },
    SelectProtocol {
        address: String,
        port: u16,
    },
    Heartbeat {
        nonce: u64,
    },
    Speaking {
        speaking: u8,
        delay: u32,
        ssrc: u32,
    },
    Resume {
        server_id: u64,
        session_id: String,
        token: String,
    },
}

impl GatewayCommand {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            GatewayCommand::Identify { .. } => Opcode::Identify,
            GatewayCommand::SelectProtocol { .. } => Opcode::SelectProtocol,
            GatewayCommand::Heartbeat { .. } => Opcode::Heartbeat,
            GatewayCommand::Speaking { .. } => Opcode::Speaking,
            GatewayCommand::Resume { .. } => Opcode::Resume,
        }
    }

    /// Encode as a JSON text frame.
    #[must_use]
    pub fn encode(&self) -> String {
        let d = match self {
            GatewayCommand::Identify { server_id, user_id, session_id, token } => json!({
                "server_id": server_id.to_string(),
                "user_id": user_id.to_string(),
                "session_id": session_id,
                "token": token,
            }),
            GatewayCommand::SelectProtocol { address, port } => json!({
                "protocol": "udp",
                "data": {
                    "address": address,
                    "port": port,
                    "mode": ENCRYPTION_MODE,
                },
            }),
            GatewayCommand::Heartbeat { nonce } => json!(nonce),
            GatewayCommand::Speaking { speaking, delay, ssrc } => json!({
                "speaking": speaking,
                "delay": delay,
                "ssrc": ssrc,
            }),
            GatewayCommand::Resume { server_id, session_id, token } => json!({
                "server_id": server_id.to_string(),
                "session_id": session_id,
                "token": token,
            }),
        };

        json!({ "op": self.opcode().as_u8(), "d": d }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_strips_default_port() {
        assert_eq!(gateway_url("eu-west1.example.gg:80"), "wss://eu-west1.example.gg/?v=4");
        assert_eq!(gateway_url("127.0.0.1:9000"), "wss://127.0.0.1:9000/?v=4");
        assert_eq!(gateway_url("ws://127.0.0.1:9000"), "ws://127.0.0.1:9000/?v=4");
        assert_eq!(gateway_url("voice.example.gg:8080"), "wss://voice.example.gg:8080/?v=4");
        assert_eq!(gateway_url("127.0.0.1:8000"), "wss://127.0.0.1:8000/?v=4");
        assert_eq!(gateway_url("voice.example.gg:80/"), "wss://voice.example.gg/?v=4");
    }

    #[test]
    fn decodes_ready() {
        let event = GatewayEvent::decode(
            r#"{"op":2,"d":{"ssrc":1,"ip":"127.0.0.1","port":1234,"modes":["xsalsa20_poly1305"]}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            GatewayEvent::Ready {
                ssrc: 1,
                ip: "127.0.0.1".into(),
                port: 1234,
                modes: vec!["xsalsa20_poly1305".into()],
            }
        );
    }

    #[test]
    fn decodes_hello_with_fractional_interval() {
        let event = GatewayEvent::decode(r#"{"op":8,"d":{"heartbeat_interval":41250.5}}"#).unwrap();
        assert_eq!(
            event,
            GatewayEvent::Hello { heartbeat_interval: Duration::from_micros(41_250_500) }
        );
    }

    #[test]
    fn decodes_session_description_key() {
        let key: Vec<u8> = (0..32).collect();
        let text = json!({"op": 4, "d": {"mode": "xsalsa20_poly1305", "secret_key": key}}).to_string();
        match GatewayEvent::decode(&text).unwrap() {
            GatewayEvent::SessionDescription { secret_key, .. } => assert_eq!(secret_key, key),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        let a = GatewayEvent::decode(r#"{"op":13,"d":{"user_id":"80351110224678912"}}"#).unwrap();
        let b = GatewayEvent::decode(r#"{"op":13,"d":{"user_id":80351110224678912}}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, GatewayEvent::ClientDisconnect { user_id: 80_351_110_224_678_912 });
    }

    #[test]
    fn rejects_unknown_and_client_opcodes() {
        assert_eq!(
            GatewayEvent::decode(r#"{"op":42,"d":null}"#),
            Err(ProtocolError::UnknownOpcode(42))
        );
        assert_eq!(
            GatewayEvent::decode(r#"{"op":0,"d":{}}"#),
            Err(ProtocolError::UnexpectedOpcode(0))
        );
        assert!(matches!(
            GatewayEvent::decode("not json"),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn heartbeat_ack_without_payload() {
        assert_eq!(GatewayEvent::decode(r#"{"op":6}"#), Ok(GatewayEvent::HeartbeatAck));
    }

    #[test]
    fn select_protocol_layout() {
        let text = GatewayCommand::SelectProtocol { address: "10.0.0.2".into(), port: 5000 }.encode();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["op"], 1);
        assert_eq!(value["d"]["protocol"], "udp");
        assert_eq!(value["d"]["data"]["address"], "10.0.0.2");
        assert_eq!(value["d"]["data"]["port"], 5000);
        assert_eq!(value["d"]["data"]["mode"], "xsalsa20_poly1305");
    }

    #[test]
    fn identify_sends_ids_as_strings() {
        let text = GatewayCommand::Identify {
            server_id: 10,
            user_id: 20,
            session_id: "abc".into(),
            token: "tok".into(),
        }
        .encode();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["op"], 0);
        assert_eq!(value["d"]["server_id"], "10");
        assert_eq!(value["d"]["user_id"], "20");
        assert_eq!(value["d"]["session_id"], "abc");
    }

    #[test]
    fn heartbeat_payload_is_bare_nonce() {
        let text = GatewayCommand::Heartbeat { nonce: 1_700_000_000_000 }.encode();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"op": 3, "d": 1_700_000_000_000u64}));
    }
}
