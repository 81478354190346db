use thiserror::Error;

/// Magic identifying a migration-v2 stream: ASCII "LibxlFmt" read as a
/// big-endian u64.
pub const STREAM_IDENT: u64 = 0x4c69_6278_6c46_6d74;
pub const STREAM_IDENT_SWAPPED: u64 = STREAM_IDENT.swap_bytes();

pub const STREAM_VERSION: u32 = 2;

pub const OPT_BIG_ENDIAN: u32 = 1 << 0;
pub const OPT_LEGACY: u32 = 1 << 1;

/// All records are padded so the next record header starts on an 8-octet
/// boundary.
pub const REC_ALIGN: u64 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("stream does not start with the migration-v2 magic")]
    InvalidMagic,
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u32),
    #[error("stream is big-endian; only little-endian streams are accepted")]
    UnsupportedEndianness,
    #[error("unknown record type {0}")]
    UnknownRecordType(u32),
    #[error("buffer truncated: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u32,
    pub options: u32,
}

impl StreamHeader {
    pub const WIRE_LEN: usize = 16;

    pub fn new() -> Self {
        StreamHeader {
            version: STREAM_VERSION,
            options: 0,
        }
    }

    pub fn legacy(mut self) -> Self {
        self.options |= OPT_LEGACY;
        self
    }

    pub fn is_legacy(&self) -> bool {
        self.options & OPT_LEGACY != 0
    }

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..8].copy_from_slice(&STREAM_IDENT.to_be_bytes());
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.options.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(CodecError::Truncated {
                needed: Self::WIRE_LEN,
                had: buf.len(),
            });
        }
        let ident = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if ident == STREAM_IDENT_SWAPPED {
            return Err(CodecError::UnsupportedEndianness);
        }
        if ident != STREAM_IDENT {
            return Err(CodecError::InvalidMagic);
        }
        let version = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        if version != STREAM_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let options = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        if options & OPT_BIG_ENDIAN != 0 {
            return Err(CodecError::UnsupportedEndianness);
        }
        Ok(StreamHeader { version, options })
    }
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    End,
    LibxcContext,
    XenstoreData,
    EmulatorContext,
    CheckpointEnd,
    ColoContext,
}

impl RecordType {
    pub fn wire_value(self) -> u32 {
        match self {
            RecordType::End => 0,
            RecordType::LibxcContext => 1,
            RecordType::XenstoreData => 2,
            RecordType::EmulatorContext => 3,
            RecordType::CheckpointEnd => 4,
            RecordType::ColoContext => 5,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self, CodecError> {
        Ok(match value {
            0 => RecordType::End,
            1 => RecordType::LibxcContext,
            2 => RecordType::XenstoreData,
            3 => RecordType::EmulatorContext,
            4 => RecordType::CheckpointEnd,
            5 => RecordType::ColoContext,
            other => return Err(CodecError::UnknownRecordType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub rec_type: RecordType,
    pub length: u32,
}

impl RecordHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&self.rec_type.wire_value().to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(CodecError::Truncated {
                needed: Self::WIRE_LEN,
                had: buf.len(),
            });
        }
        let rec_type = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        Ok(RecordHeader {
            rec_type: RecordType::from_wire(rec_type)?,
            length,
        })
    }
}

/// Number of zero-padding bytes needed after a payload of `len` bytes so
/// the next record header starts on an 8-octet boundary.
pub fn record_padding(len: usize) -> usize {
    let rem = len as u64 % REC_ALIGN;
    if rem == 0 { 0 } else { (REC_ALIGN - rem) as usize }
}

/// Encode a full record: header, payload, and zero padding.
pub fn encode_record(rec_type: RecordType, payload: &[u8]) -> Vec<u8> {
    let header = RecordHeader {
        rec_type,
        length: payload.len() as u32,
    };
    let pad = record_padding(payload.len());
    let mut buf = Vec::with_capacity(RecordHeader::WIRE_LEN + payload.len() + pad);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.extend(std::iter::repeat_n(0u8, pad));
    buf
}
