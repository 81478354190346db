use super::header::CodecError;

/// Sub-id carried inside a COLO_CONTEXT record, marking which phase of the
/// checkpoint handshake the sender has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColoSubId {
    NewCheckpoint,
    SvmSuspended,
    SvmReady,
    SvmResumed,
}

impl ColoSubId {
    pub fn wire_value(self) -> u32 {
        match self {
            ColoSubId::NewCheckpoint => 0,
            ColoSubId::SvmSuspended => 1,
            ColoSubId::SvmReady => 2,
            ColoSubId::SvmResumed => 3,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self, CodecError> {
        Ok(match value {
            0 => ColoSubId::NewCheckpoint,
            1 => ColoSubId::SvmSuspended,
            2 => ColoSubId::SvmReady,
            3 => ColoSubId::SvmResumed,
            other => return Err(CodecError::UnknownRecordType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColoContext {
    pub id: ColoSubId,
}

impl ColoContext {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        self.id.wire_value().to_be_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(CodecError::Truncated {
                needed: Self::WIRE_LEN,
                had: buf.len(),
            });
        }
        let id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        Ok(ColoContext {
            id: ColoSubId::from_wire(id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_sub_id() {
        for id in [
            ColoSubId::NewCheckpoint,
            ColoSubId::SvmSuspended,
            ColoSubId::SvmReady,
            ColoSubId::SvmResumed,
        ] {
            let ctx = ColoContext { id };
            assert_eq!(ColoContext::decode(&ctx.encode()).unwrap(), ctx);
        }
    }
}
