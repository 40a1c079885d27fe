use crate::common::{Lsn, LsnRange};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::wal::frame::{declared_frame_len, decode_frame, Frame, FrameDecode, FRAME_HEADER_SIZE};
use crate::wal::journal::WriteAheadLog;
use crate::wal::record::TwoPhaseRecord;

/// Result of reading the next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRead {
    Frame(LsnRange, Frame),
    /// Clean end of the log.
    End,
    /// The last frame of the log starting at this position is incomplete or
    /// fails its checksum: a write interrupted by a crash.
    TornTail(Lsn),
}

/// Sequential frame reader over a [`WriteAheadLog`].
pub struct WalReader<'a> {
    wal: &'a dyn WriteAheadLog,
    position: Lsn,
}

impl<'a> WalReader<'a> {
    pub fn new(wal: &'a dyn WriteAheadLog, from: Lsn) -> Self {
        WalReader {
            wal,
            position: from,
        }
    }

    /// Position of the next frame to read.
    pub fn position(&self) -> Lsn {
        self.position
    }

    /// Reads the next frame.
    ///
    /// A malformed frame that is the last thing in the log is reported as
    /// [`WalRead::TornTail`]. A malformed frame with more data after it, or one
    /// whose header cannot be trusted, fails with
    /// [`ErrorKind::TruncatedWalRecord`].
    pub fn next_frame(&mut self) -> TwoPhaseResult<WalRead> {
        let end = self.wal.end_lsn();
        if self.position >= end {
            return Ok(WalRead::End);
        }
        let remaining = (end.0 - self.position.0) as usize;

        let header = self.wal.read(self.position, FRAME_HEADER_SIZE)?;
        let bytes = match declared_frame_len(&header) {
            Some(total) => self.wal.read(self.position, total.min(remaining))?,
            None => header,
        };

        match decode_frame(&bytes) {
            FrameDecode::Complete(frame) => {
                let range = LsnRange {
                    start: self.position,
                    end: self.position.offset(frame.encoded_len() as u64),
                };
                self.position = range.end;
                Ok(WalRead::Frame(range, frame))
            }
            FrameDecode::Torn => Ok(WalRead::TornTail(self.position)),
            FrameDecode::Corrupt {
                declared_len: Some(total),
                ..
            } if total == remaining => Ok(WalRead::TornTail(self.position)),
            FrameDecode::Corrupt { reason, .. } => Err(TwoPhaseError::new(
                &format!(
                    "invalid WAL record at {} with {} bytes following it: {}",
                    self.position, remaining, reason
                ),
                ErrorKind::TruncatedWalRecord,
            )),
        }
    }
}

/// Reads and decodes the single record starting at `at`.
///
/// Used to fetch the PREPARE record of a live prepared transaction; anything but
/// a complete frame there is corruption.
pub fn read_record_at(wal: &dyn WriteAheadLog, at: Lsn) -> TwoPhaseResult<(LsnRange, TwoPhaseRecord)> {
    let mut reader = WalReader::new(wal, at);
    match reader.next_frame()? {
        WalRead::Frame(range, frame) => Ok((range, TwoPhaseRecord::decode(&frame)?)),
        WalRead::End | WalRead::TornTail(_) => Err(TwoPhaseError::new(
            &format!("could not read a complete WAL record at {}", at),
            ErrorKind::CorruptDurableState,
        )),
    }
}
