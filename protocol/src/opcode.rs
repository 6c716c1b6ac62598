use crate::error::ProtocolError;

macro_rules! opcodes {
    ($($name:ident = $val:expr),* $(,)?) => {
        /// Voice gateway opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode { $($name = $val,)* }

        impl Opcode {
            #[must_use]
            pub const fn as_u8(self) -> u8 { self as u8 }
        }

        impl TryFrom<u8> for Opcode {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($val => Ok(Self::$name),)*
                    _ => Err(ProtocolError::UnknownOpcode(value)),
                }
            }
        }
    };
}

opcodes! {
    // Client -> server
    Identify = 0,
    SelectProtocol = 1,
    Heartbeat = 3,
    Resume = 7,

    // Server -> client
    Ready = 2,
    SessionDescription = 4,
    HeartbeatAck = 6,
    Hello = 8,
    Resumed = 9,
    ClientDisconnect = 13,

    // Both directions
    Speaking = 5,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(Opcode::try_from(12), Err(ProtocolError::UnknownOpcode(12)));
        assert_eq!(Opcode::try_from(13), Ok(Opcode::ClientDisconnect));
    }
}
