use super::header::CodecError;

pub const TOOLSTACK_SAVE_VERSION: u32 = 1;

/// One entry of the toolstack physmap record: a single MMIO/RAM region
/// the toolstack asked the hypervisor to map for the guest, keyed by its
/// physical offset. Mirrors `libxl__physmap_info` byte for byte, except
/// `name` is a `String` here instead of a trailing flexible array member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysmapEntry {
    pub phys_offset: u64,
    pub start_addr: u64,
    pub size: u64,
    pub name: String,
}

impl PhysmapEntry {
    fn encoded_len(&self) -> usize {
        8 + 8 + 8 + 4 + self.name.len()
    }
}

/// The toolstack save record: a version tag followed by a count of
/// physmap entries, each self-describing its name length. Entries are
/// packed back to back with no per-entry padding; only the whole record
/// is padded to the 8-octet stream alignment by the generic record
/// encoder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolstackRecord {
    pub entries: Vec<PhysmapEntry>,
}

impl ToolstackRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&TOOLSTACK_SAVE_VERSION.to_be_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for e in &self.entries {
            buf.extend_from_slice(&e.phys_offset.to_be_bytes());
            buf.extend_from_slice(&e.start_addr.to_be_bytes());
            buf.extend_from_slice(&e.size.to_be_bytes());
            buf.extend_from_slice(&(e.name.len() as u32).to_be_bytes());
            buf.extend_from_slice(e.name.as_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::Truncated {
                needed: 8,
                had: buf.len(),
            });
        }
        let version = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if version != TOOLSTACK_SAVE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let mut pos = 8usize;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.len() < pos + 28 {
                return Err(CodecError::Truncated {
                    needed: pos + 28,
                    had: buf.len(),
                });
            }
            let phys_offset = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
            let start_addr = u64::from_be_bytes(buf[pos + 8..pos + 16].try_into().unwrap());
            let size = u64::from_be_bytes(buf[pos + 16..pos + 24].try_into().unwrap());
            let namelen =
                u32::from_be_bytes(buf[pos + 24..pos + 28].try_into().unwrap()) as usize;
            pos += 28;
            if buf.len() < pos + namelen {
                return Err(CodecError::Truncated {
                    needed: pos + namelen,
                    had: buf.len(),
                });
            }
            let name = String::from_utf8_lossy(&buf[pos..pos + namelen]).into_owned();
            pos += namelen;
            entries.push(PhysmapEntry {
                phys_offset,
                start_addr,
                size,
                name,
            });
        }
        Ok(ToolstackRecord { entries })
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.entries.iter().map(PhysmapEntry::encoded_len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_named_and_unnamed_entries() {
        let rec = ToolstackRecord {
            entries: vec![
                PhysmapEntry {
                    phys_offset: 0xf0000,
                    start_addr: 0xc0000,
                    size: 0x10000,
                    name: "ioreq".to_string(),
                },
                PhysmapEntry {
                    phys_offset: 0xfee00000,
                    start_addr: 0xfee00000,
                    size: 0x1000,
                    name: String::new(),
                },
            ],
        };
        let buf = rec.encode();
        assert_eq!(buf.len(), rec.encoded_len());
        assert_eq!(ToolstackRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn empty_record_round_trips() {
        let rec = ToolstackRecord::default();
        let buf = rec.encode();
        assert_eq!(ToolstackRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn rejects_truncated_entry() {
        let rec = ToolstackRecord {
            entries: vec![PhysmapEntry {
                phys_offset: 1,
                start_addr: 2,
                size: 3,
                name: "x".to_string(),
            }],
        };
        let mut buf = rec.encode();
        buf.truncate(buf.len() - 1);
        assert!(ToolstackRecord::decode(&buf).is_err());
    }
}
