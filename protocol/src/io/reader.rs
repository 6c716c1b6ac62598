use crate::error::ProtocolError;

/// Helper for reading binary data with automatic cursor advancement.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(ProtocolError::PacketTooShort {
                expected: self.pos + len,
                got: self.data.len(),
            })?;
        self.pos += len;
        Ok(bytes)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bytes(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
