use crate::common::{TransactionId, STATE_FILE_MAGIC, STATE_FILE_TEMP_SUFFIX};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::wal::PreparedState;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// Directory of durable-state files, one per prepared transaction that
/// outlived a checkpoint.
///
/// A file is named after the transaction id in eight upper-case hex digits and
/// holds `magic | total length | payload | crc32`, all integers little-endian.
/// Files are written to a temporary name, synced, then renamed into place.
#[derive(Debug, Clone)]
pub struct StateFileStore {
    dir: PathBuf,
}

impl StateFileStore {
    /// Opens the store, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> TwoPhaseResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            log::error!("Could not create state directory {:?}: {}", dir, e);
            TwoPhaseError::new_with_cause(
                &format!("could not create state directory {:?}", dir),
                ErrorKind::IOError,
                e.into(),
            )
        })?;
        Ok(StateFileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `xid`.
    pub fn path_for(&self, xid: TransactionId) -> PathBuf {
        self.dir.join(format!("{:08X}", xid.0))
    }

    pub fn exists(&self, xid: TransactionId) -> bool {
        self.path_for(xid).is_file()
    }

    /// Durably writes the state of a prepared transaction.
    ///
    /// An existing file for the same transaction is replaced atomically.
    pub fn write(&self, state: &PreparedState) -> TwoPhaseResult<()> {
        let payload = state.to_bytes()?;
        let total_len = HEADER_SIZE + payload.len() + CRC_SIZE;
        let total_len_u32 = u32::try_from(total_len).map_err(|_| {
            TwoPhaseError::new(
                &format!("two-phase state of transaction {} is too large", state.xid),
                ErrorKind::EncodingError,
            )
        })?;

        let mut buffer = Vec::with_capacity(total_len);
        buffer.extend_from_slice(&STATE_FILE_MAGIC.to_le_bytes());
        buffer.extend_from_slice(&total_len_u32.to_le_bytes());
        buffer.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buffer);
        buffer.extend_from_slice(&crc.to_le_bytes());

        let path = self.path_for(state.xid);
        let temp = temp_path(&path);
        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&buffer)?;
            file.sync_all()?;
            fs::rename(&temp, &path)?;
            sync_dir(&self.dir)
        })();

        result.map_err(|e| {
            log::error!("Could not write two-phase state file {:?}: {}", path, e);
            let _ = fs::remove_file(&temp);
            TwoPhaseError::new_with_cause(
                &format!("could not write two-phase state file {:?}", path),
                ErrorKind::IOError,
                e.into(),
            )
        })
    }

    /// Reads and validates the state file of `xid`.
    ///
    /// # Errors
    ///
    /// A missing, short, mis-sized, mis-tagged or checksum-failing file, or one
    /// recorded under another transaction id, is
    /// [`ErrorKind::CorruptDurableState`]. Other read failures are
    /// [`ErrorKind::IOError`].
    pub fn read(&self, xid: TransactionId) -> TwoPhaseResult<PreparedState> {
        let path = self.path_for(xid);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(corrupt(xid, "file does not exist"));
            }
            Err(e) => {
                return Err(TwoPhaseError::new_with_cause(
                    &format!("could not read two-phase state file {:?}", path),
                    ErrorKind::IOError,
                    e.into(),
                ))
            }
        };

        if bytes.len() < HEADER_SIZE + CRC_SIZE {
            return Err(corrupt(xid, "incorrect size of file"));
        }
        let magic = read_u32(&bytes[0..4]);
        if magic != STATE_FILE_MAGIC {
            return Err(corrupt(xid, "invalid magic number"));
        }
        let total_len = read_u32(&bytes[4..8]) as usize;
        if total_len != bytes.len() {
            return Err(corrupt(xid, "invalid size stored in file"));
        }
        let body_end = bytes.len() - CRC_SIZE;
        let stored_crc = read_u32(&bytes[body_end..]);
        if crc32fast::hash(&bytes[..body_end]) != stored_crc {
            return Err(corrupt(xid, "calculated CRC checksum does not match value stored in file"));
        }

        let state = PreparedState::from_bytes(&bytes[HEADER_SIZE..body_end]).map_err(|e| {
            TwoPhaseError::new_with_cause(
                &corrupt_message(xid, "invalid payload"),
                ErrorKind::CorruptDurableState,
                e,
            )
        })?;
        if state.xid != xid {
            return Err(corrupt(xid, &format!("file records transaction {}", state.xid)));
        }
        Ok(state)
    }

    /// Removes the file of `xid`, returns whether a file was removed.
    ///
    /// A missing file is only reported when `give_warning` is set.
    pub fn remove(&self, xid: TransactionId, give_warning: bool) -> TwoPhaseResult<bool> {
        let path = self.path_for(xid);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Removed two-phase state file {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                if give_warning {
                    log::warn!("Could not remove two-phase state file {:?}: file does not exist", path);
                }
                Ok(false)
            }
            Err(e) => {
                log::error!("Could not remove two-phase state file {:?}: {}", path, e);
                Err(TwoPhaseError::new_with_cause(
                    &format!("could not remove two-phase state file {:?}", path),
                    ErrorKind::IOError,
                    e.into(),
                ))
            }
        }
    }

    /// Transaction ids of every state file in the directory, sorted.
    ///
    /// Leftover temporary files from an interrupted write are deleted. Names
    /// that are not eight hex digits are ignored.
    pub fn list(&self) -> TwoPhaseResult<Vec<TransactionId>> {
        let mut xids = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(STATE_FILE_TEMP_SUFFIX) {
                log::warn!("Removing leftover temporary two-phase state file {:?}", dir_entry.path());
                fs::remove_file(dir_entry.path())?;
                continue;
            }
            match parse_file_name(name) {
                Some(xid) => xids.push(xid),
                None => log::debug!("Ignoring unexpected file {:?} in state directory", name),
            }
        }
        xids.sort_by_key(|xid| xid.0);
        Ok(xids)
    }
}

fn parse_file_name(name: &str) -> Option<TransactionId> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(name, 16).ok().map(TransactionId)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(STATE_FILE_TEMP_SUFFIX);
    PathBuf::from(name)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn corrupt_message(xid: TransactionId, detail: &str) -> String {
    format!("corrupted two-phase state file for transaction {}: {}", xid, detail)
}

fn corrupt(xid: TransactionId, detail: &str) -> TwoPhaseError {
    log::error!("{}", corrupt_message(xid, detail));
    TwoPhaseError::new(&corrupt_message(xid, detail), ErrorKind::CorruptDurableState)
}
