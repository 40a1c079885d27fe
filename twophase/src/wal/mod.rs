//! Write-ahead log contract, frame codec and record payloads.

pub mod frame;
pub mod journal;
pub mod reader;
pub mod record;

pub use frame::{decode_frame, encode_frame, Frame, FrameDecode};
pub use journal::{MemoryWal, WriteAheadLog, WAL_START};
pub use reader::{read_record_at, WalRead, WalReader};
pub use record::{FinishRecord, PreparedState, RecordKind, TwoPhaseRecord};
