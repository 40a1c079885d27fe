/// Maximum length of a global transaction identifier, including the terminator slot.
/// Identifiers must be strictly shorter than this.
pub const GID_SIZE: usize = 200;

/// Magic number opening every WAL frame.
pub const FRAME_MAGIC: u32 = 0x5450_5746;

/// Marker closing every WAL frame.
pub const FRAME_END: u32 = 0x454E_4421;

/// Magic number opening every durable-state file.
pub const STATE_FILE_MAGIC: u32 = 0x57F9_4534;

/// Largest payload accepted in a single frame or state file.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Suffix of state files that were not completely written.
pub const STATE_FILE_TEMP_SUFFIX: &str = ".tmp";

/// Default number of backends used to compute placeholder backend ids.
pub const DEFAULT_MAX_BACKENDS: u32 = 100;
