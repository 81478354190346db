mod colo;
mod emulator;
mod header;
mod toolstack;

pub use colo::{ColoContext, ColoSubId};
pub use emulator::{EmulatorHeader, EmulatorId};
pub use header::{
    encode_record, record_padding, CodecError, RecordHeader, RecordType, StreamHeader,
    OPT_BIG_ENDIAN, OPT_LEGACY, REC_ALIGN, STREAM_IDENT, STREAM_VERSION,
};
pub use toolstack::{PhysmapEntry, ToolstackRecord, TOOLSTACK_SAVE_VERSION};
