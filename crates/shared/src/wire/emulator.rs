use super::header::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorId {
    Unknown,
    QemuTraditional,
    QemuUpstream,
}

impl EmulatorId {
    pub fn wire_value(self) -> u32 {
        match self {
            EmulatorId::Unknown => 0,
            EmulatorId::QemuTraditional => 1,
            EmulatorId::QemuUpstream => 2,
        }
    }

    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => EmulatorId::QemuTraditional,
            2 => EmulatorId::QemuUpstream,
            _ => EmulatorId::Unknown,
        }
    }
}

/// Header prefixing an emulator-context record's body: which emulator
/// produced it, and its index (stub domains may run more than one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorHeader {
    pub id: EmulatorId,
    pub index: u32,
}

impl EmulatorHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&self.id.wire_value().to_be_bytes());
        buf[4..8].copy_from_slice(&self.index.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(CodecError::Truncated {
                needed: Self::WIRE_LEN,
                had: buf.len(),
            });
        }
        let id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let index = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        Ok(EmulatorHeader {
            id: EmulatorId::from_wire(id),
            index,
        })
    }
}
