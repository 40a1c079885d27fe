use crate::common::{LockDescriptor, Lsn, Oid, OriginId, ResourceRecord, TransactionId};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::wal::frame::{encode_frame, Frame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of WAL records this crate produces.
///
/// Any other kind byte belongs to another subsystem and is skipped by replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Prepare = 1,
    CommitPrepared = 2,
    AbortPrepared = 3,
}

impl RecordKind {
    pub fn from_u8(kind: u8) -> Option<RecordKind> {
        match kind {
            1 => Some(RecordKind::Prepare),
            2 => Some(RecordKind::CommitPrepared),
            3 => Some(RecordKind::AbortPrepared),
            _ => None,
        }
    }
}

/// Everything needed to rebuild a prepared transaction.
///
/// This is the payload of a PREPARE record and the body of a durable-state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedState {
    pub xid: TransactionId,
    pub gid: String,
    pub database: Oid,
    pub owner: Oid,
    pub prepared_at: DateTime<Utc>,
    pub subxids: Vec<TransactionId>,
    pub locks: Vec<LockDescriptor>,
    pub resources: Vec<ResourceRecord>,
    pub origin: OriginId,
    pub origin_lsn: Lsn,
}

/// Payload of COMMIT-PREPARED and ABORT-PREPARED records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRecord {
    pub xid: TransactionId,
    pub gid: String,
    pub subxids: Vec<TransactionId>,
    /// Start of the PREPARE record, invalid if the state had moved to a file.
    pub prepare_lsn: Lsn,
    pub origin: OriginId,
}

/// A decoded record of interest to the prepared-transaction manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoPhaseRecord {
    Prepare(PreparedState),
    CommitPrepared(FinishRecord),
    AbortPrepared(FinishRecord),
    /// A record written by another subsystem.
    Foreign(u8),
}

fn encode_payload<T: Serialize>(value: &T) -> TwoPhaseResult<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::legacy())?)
}

pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> TwoPhaseResult<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    if read != bytes.len() {
        return Err(TwoPhaseError::new(
            &format!("{} trailing bytes after record payload", bytes.len() - read),
            ErrorKind::EncodingError,
        ));
    }
    Ok(value)
}

impl PreparedState {
    /// Serializes the state without framing, as stored in state files.
    pub fn to_bytes(&self) -> TwoPhaseResult<Vec<u8>> {
        encode_payload(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> TwoPhaseResult<PreparedState> {
        decode_payload(bytes)
    }
}

impl TwoPhaseRecord {
    pub fn kind(&self) -> u8 {
        match self {
            TwoPhaseRecord::Prepare(_) => RecordKind::Prepare as u8,
            TwoPhaseRecord::CommitPrepared(_) => RecordKind::CommitPrepared as u8,
            TwoPhaseRecord::AbortPrepared(_) => RecordKind::AbortPrepared as u8,
            TwoPhaseRecord::Foreign(kind) => *kind,
        }
    }

    /// Encodes the record into a complete WAL frame.
    pub fn encode(&self) -> TwoPhaseResult<Vec<u8>> {
        let payload = match self {
            TwoPhaseRecord::Prepare(state) => encode_payload(state)?,
            TwoPhaseRecord::CommitPrepared(finish) | TwoPhaseRecord::AbortPrepared(finish) => {
                encode_payload(finish)?
            }
            TwoPhaseRecord::Foreign(kind) => {
                return Err(TwoPhaseError::new(
                    &format!("cannot encode foreign record kind {}", kind),
                    ErrorKind::InvalidOperation,
                ))
            }
        };
        encode_frame(self.kind(), &payload)
    }

    /// Decodes the payload of a checksummed frame.
    ///
    /// The frame already passed its checksum, so a payload that does not decode
    /// means the writer produced garbage: it is reported as corruption.
    pub fn decode(frame: &Frame) -> TwoPhaseResult<TwoPhaseRecord> {
        let result = match RecordKind::from_u8(frame.kind) {
            Some(RecordKind::Prepare) => decode_payload(&frame.payload).map(TwoPhaseRecord::Prepare),
            Some(RecordKind::CommitPrepared) => {
                decode_payload(&frame.payload).map(TwoPhaseRecord::CommitPrepared)
            }
            Some(RecordKind::AbortPrepared) => {
                decode_payload(&frame.payload).map(TwoPhaseRecord::AbortPrepared)
            }
            None => return Ok(TwoPhaseRecord::Foreign(frame.kind)),
        };
        result.map_err(|e| {
            TwoPhaseError::new_with_cause(
                &format!("invalid payload in record of kind {}", frame.kind),
                ErrorKind::CorruptDurableState,
                e,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{LockMode, ResourceRecord};
    use crate::wal::frame::{decode_frame, FrameDecode};

    fn sample_state() -> PreparedState {
        PreparedState {
            xid: TransactionId(100),
            gid: "tx1".to_string(),
            database: 5,
            owner: 10,
            prepared_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            subxids: vec![TransactionId(101)],
            locks: vec![LockDescriptor::relation(5, 16384, LockMode::RowExclusive)],
            resources: vec![ResourceRecord::new(1, 0, vec![1, 2, 3])],
            origin: OriginId::INVALID,
            origin_lsn: Lsn::INVALID,
        }
    }

    fn decode_bytes(bytes: &[u8]) -> TwoPhaseRecord {
        match decode_frame(bytes) {
            FrameDecode::Complete(frame) => TwoPhaseRecord::decode(&frame).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prepare_record_survives_framing() {
        let record = TwoPhaseRecord::Prepare(sample_state());
        let bytes = record.encode().unwrap();
        assert_eq!(decode_bytes(&bytes), record);
    }

    #[test]
    fn test_finish_record_kind_is_preserved() {
        let finish = FinishRecord {
            xid: TransactionId(100),
            gid: "tx1".to_string(),
            subxids: vec![],
            prepare_lsn: Lsn(16),
            origin: OriginId::INVALID,
        };
        let commit = TwoPhaseRecord::CommitPrepared(finish.clone());
        let abort = TwoPhaseRecord::AbortPrepared(finish);
        assert!(matches!(decode_bytes(&commit.encode().unwrap()), TwoPhaseRecord::CommitPrepared(_)));
        assert!(matches!(decode_bytes(&abort.encode().unwrap()), TwoPhaseRecord::AbortPrepared(_)));
    }

    #[test]
    fn test_unknown_kind_is_foreign() {
        let frame = Frame {
            kind: 42,
            payload: vec![0xde, 0xad],
        };
        assert_eq!(TwoPhaseRecord::decode(&frame).unwrap(), TwoPhaseRecord::Foreign(42));
        assert!(TwoPhaseRecord::Foreign(42).encode().is_err());
    }

    #[test]
    fn test_garbage_payload_is_corruption() {
        let frame = Frame {
            kind: RecordKind::Prepare as u8,
            payload: vec![1, 2, 3],
        };
        let err = TwoPhaseRecord::decode(&frame).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::CorruptDurableState);
    }

    #[test]
    fn test_state_bytes_reject_trailing_data() {
        let state = sample_state();
        let mut bytes = state.to_bytes().unwrap();
        assert_eq!(PreparedState::from_bytes(&bytes).unwrap(), state);
        bytes.push(0);
        assert!(PreparedState::from_bytes(&bytes).is_err());
    }
}
