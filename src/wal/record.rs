//! On-disk record layout and the in-memory log entry shape.
//!
//! ```text
//! offset  size  field
//! 0       8     LogID
//! 8       8     TermID
//! 16      4     ClusterID
//! 20      4     payload_length  (N)
//! 24      N     payload bytes
//! 24+N    4     total_record_length = 24 + N
//! ```
//!
//! The trailing length enables backward scanning for recovery: a fixed
//! little-endian header with no checksum, relying on replication (not a
//! CRC) for integrity.

use crate::error::{RaftError, Result};
use crate::ids::{ClusterId, LogId, TermId};
use serde::{Deserialize, Serialize};

/// Fixed header size before the payload: LogID(8) + TermID(8) + ClusterID(4) + len(4).
pub const HEADER_SIZE: usize = 24;
/// Size of the trailing `total_record_length` footer.
pub const FOOTER_SIZE: usize = 4;

/// How a log entry should be treated by batching and commit logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    /// Ordinary application command. May batch freely with other NORMAL entries.
    Normal,
    /// A pre-replication atomic check on the leader that may emit a
    /// substitute payload or abort. Must start a new batch.
    AtomicOp,
    /// In-band membership/transfer-leader directive. Must end the batch it
    /// appears in.
    Command,
}

/// The in-memory shape of a WAL record: the on-disk fields plus `log_type`,
/// which is never persisted (a replayed record's type is re-derived by the
/// pre-process hook from its payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub log_id: LogId,
    pub term: TermId,
    pub cluster: ClusterId,
    pub log_type: LogType,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(log_id: LogId, term: TermId, cluster: ClusterId, payload: Vec<u8>) -> Self {
        LogEntry { log_id, term, cluster, log_type: LogType::Normal, payload }
    }

    /// Encode this entry to its exact on-disk byte layout.
    pub fn encode(&self) -> Vec<u8> {
        let n = self.payload.len() as u32;
        let total_len = (HEADER_SIZE + self.payload.len()) as u32;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len() + FOOTER_SIZE);
        buf.extend_from_slice(&self.log_id.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&(self.cluster as i32).to_le_bytes());
        buf.extend_from_slice(&n.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&total_len.to_le_bytes());
        buf
    }

    /// Decode a record from `buf`, which must contain at least the header.
    /// Returns the entry (with `log_type` defaulted to `Normal` — callers
    /// apply the pre-process hook to refine it) and the total record length
    /// consumed, including header and footer.
    pub fn decode(buf: &[u8]) -> Result<(LogEntry, usize)> {
        if buf.len() < HEADER_SIZE {
            return Err(RaftError::WalCorruption(format!(
                "record header truncated: have {} bytes, need {}",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let log_id = LogId::from_le_bytes(buf[0..8].try_into().unwrap());
        let term = TermId::from_le_bytes(buf[8..16].try_into().unwrap());
        let cluster = i32::from_le_bytes(buf[16..20].try_into().unwrap()) as ClusterId;
        let n = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        let total_len = HEADER_SIZE + n + FOOTER_SIZE;
        if buf.len() < total_len {
            return Err(RaftError::WalCorruption(format!(
                "record payload truncated: have {} bytes, need {}",
                buf.len(),
                total_len
            )));
        }
        let payload = buf[HEADER_SIZE..HEADER_SIZE + n].to_vec();
        let footer = u32::from_le_bytes(
            buf[HEADER_SIZE + n..HEADER_SIZE + n + FOOTER_SIZE].try_into().unwrap(),
        ) as usize;
        if footer != HEADER_SIZE + n {
            return Err(RaftError::WalCorruption(format!(
                "record footer mismatch: expected {}, got {}",
                HEADER_SIZE + n,
                footer
            )));
        }
        Ok((
            LogEntry { log_id, term, cluster, log_type: LogType::Normal, payload },
            total_len,
        ))
    }
}
