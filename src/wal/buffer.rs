//! In-memory buffer chain: an explicit three-state `Active`/`Frozen`/
//! `Flushed` lifecycle for log entries accumulating ahead of durable
//! storage.

use crate::ids::{LogId, TermId};
use crate::wal::record::LogEntry;
use std::collections::VecDeque;

/// A buffer's position in the Active → Frozen → Flushed lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Being appended to; at most one Active at a time, always the last.
    Active,
    /// Closed to further appends; eligible for flushing.
    Frozen,
    /// Durably written to the file; retained for recent-read cache until evicted.
    Flushed,
}

/// One accumulation unit in the WAL's buffer chain. Holds encoded records
/// (not raw entries) so the Flusher can write them out verbatim.
#[derive(Debug)]
pub struct Buffer {
    pub state: BufferState,
    entries: Vec<LogEntry>,
    encoded_len: usize,
    pub first_log_id: LogId,
    pub last_log_id: LogId,
    pub last_log_term: TermId,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            state: BufferState::Active,
            entries: Vec::new(),
            encoded_len: 0,
            first_log_id: 0,
            last_log_id: 0,
            last_log_term: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.encoded_len
    }

    /// Append an entry to this (necessarily Active) buffer.
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(self.state, BufferState::Active);
        if self.entries.is_empty() {
            self.first_log_id = entry.log_id;
        }
        self.last_log_id = entry.log_id;
        self.last_log_term = entry.term;
        self.encoded_len += crate::wal::record::HEADER_SIZE
            + entry.payload.len()
            + crate::wal::record::FOOTER_SIZE;
        self.entries.push(entry);
    }

    /// Serve a read of entries in `[from, to]` without I/O. Returns `None`
    /// if this buffer holds no entries in range.
    pub fn read_range(&self, from: LogId, to: LogId) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.log_id >= from && e.log_id <= to)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn freeze(&mut self) {
        self.state = BufferState::Frozen;
    }

    pub fn mark_flushed(&mut self) {
        self.state = BufferState::Flushed;
    }

    /// Drop entries with `log_id > k`, used by rollback. Returns `true` if
    /// any entry remains.
    pub fn truncate_after(&mut self, k: LogId) {
        self.entries.retain(|e| e.log_id <= k);
        self.encoded_len = self
            .entries
            .iter()
            .map(|e| crate::wal::record::HEADER_SIZE + e.payload.len() + crate::wal::record::FOOTER_SIZE)
            .sum();
        if let Some(last) = self.entries.last() {
            self.last_log_id = last.log_id;
            self.last_log_term = last.term;
        } else {
            self.last_log_id = 0;
            self.last_log_term = 0;
        }
    }
}

/// The ordered chain of buffers owned by one WAL. At most
/// `policy.num_buffers` may exist simultaneously; exceeding the count
/// blocks the appender (enforced by the caller via the `slotReadyCV`-style
/// condvar in `WalFile`, not here).
#[derive(Debug, Default)]
pub struct BufferChain {
    buffers: VecDeque<Buffer>,
}

impl BufferChain {
    pub fn new() -> Self {
        BufferChain { buffers: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// The Active buffer, creating one if the chain is empty or the last
    /// buffer has already been frozen.
    pub fn active_mut(&mut self) -> &mut Buffer {
        if self.buffers.back().map(|b| b.state != BufferState::Active).unwrap_or(true) {
            self.buffers.push_back(Buffer::new());
        }
        self.buffers.back_mut().unwrap()
    }

    pub fn freeze_active(&mut self) {
        if let Some(b) = self.buffers.back_mut() {
            if b.state == BufferState::Active && !b.is_empty() {
                b.freeze();
            }
        }
    }

    /// Pop the oldest Frozen buffer, if any, for the Flusher to drain.
    pub fn pop_frozen(&mut self) -> Option<Buffer> {
        let idx = self.buffers.iter().position(|b| b.state == BufferState::Frozen)?;
        self.buffers.remove(idx)
    }

    /// Reinsert a buffer the Flusher has finished with, marked Flushed, at
    /// the front (oldest) so eviction is FIFO.
    pub fn push_flushed_front(&mut self, buf: Buffer) {
        self.buffers.push_front(buf);
    }

    /// Evict Flushed buffers from the front until the chain is within cap.
    pub fn evict_to_cap(&mut self, cap: usize) {
        while self.buffers.len() > cap {
            match self.buffers.front() {
                Some(b) if b.state == BufferState::Flushed => {
                    self.buffers.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Read every entry in `[from, to]` visible across the whole chain
    /// (Active serves the tail without I/O).
    pub fn read_range(&self, from: LogId, to: LogId) -> Vec<LogEntry> {
        let mut out = Vec::new();
        for b in &self.buffers {
            out.extend(b.read_range(from, to));
        }
        out
    }

    /// The highest log id held anywhere in the chain (Active, Frozen, or
    /// still-cached Flushed), regardless of whether it has reached disk
    /// yet. `None` if the chain holds no entries at all.
    pub fn last_log_id(&self) -> Option<LogId> {
        self.buffers.iter().rev().find(|b| !b.is_empty()).map(|b| b.last_log_id)
    }

    /// The term of `last_log_id`, by the same rule.
    pub fn last_log_term(&self) -> Option<TermId> {
        self.buffers.iter().rev().find(|b| !b.is_empty()).map(|b| b.last_log_term)
    }

    /// Clear everything after a rollback/reset boundary.
    pub fn truncate_after(&mut self, k: LogId) {
        while let Some(b) = self.buffers.back() {
            if b.first_log_id > k && !b.is_empty() {
                self.buffers.pop_back();
            } else {
                break;
            }
        }
        if let Some(b) = self.buffers.back_mut() {
            b.truncate_after(k);
            if b.state != BufferState::Active {
                // the tail we kept is no longer fully flushed-consistent; treat it
                // as re-opened for append so subsequent writes continue linearly.
                b.state = BufferState::Active;
            }
        }
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
