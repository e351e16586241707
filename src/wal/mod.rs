//! The file-based write-ahead log: `append`/`iterator`/`rollback_to_log`/
//! `link_current_wal` over a rotating set of on-disk files backed by an
//! in-memory buffer chain and a dedicated flusher thread.

pub mod buffer;
pub mod file;
pub mod flusher;
pub mod iter;
pub mod record;

use crate::config::WalPolicy;
use crate::error::{RaftError, Result};
use crate::ids::{ClusterId, LogId, TermId, INVALID_TERM};
use buffer::BufferChain;
use file::WalFileSet;
use flusher::{FlushTarget, Flusher};
use iter::LogIter;
use parking_lot::{Condvar, Mutex};
use record::LogEntry;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Called on every successful append (leader side) and on every WAL-replay
/// record (recovery). Must be pure with respect to the WAL: it may react
/// (e.g. update an in-memory peer set for a COMMAND payload) but never
/// mutates WAL state directly.
pub type PreProcessLogFn = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct WalState {
    files: WalFileSet,
    chain: BufferChain,
}

/// A durable, append-only sequence of entries for one partition's local
/// replica. `append`/`append_batch` are not thread-safe; the owning
/// `RaftPart` serializes all writers. `iterator` is safe to call
/// concurrently with appends.
pub struct Wal {
    inner: Arc<WalCore>,
}

struct WalCore {
    id_str: String,
    policy: WalPolicy,
    state: Mutex<WalState>,
    slot_ready: Condvar,
    flusher: Flusher,
    pre_process: PreProcessLogFn,
}

impl Wal {
    /// Open `dir` under `flusher`'s shared flush thread, replaying any
    /// unflushed tail through `pre_process_fn` as recovery proceeds.
    pub fn open(
        dir: &Path,
        policy: WalPolicy,
        flusher: Flusher,
        id_str: String,
        pre_process_fn: PreProcessLogFn,
    ) -> Result<Self> {
        let (files, recovered) = WalFileSet::open(dir)?;
        for entry in &recovered {
            pre_process_fn(entry);
        }
        let mut chain = BufferChain::new();
        for entry in recovered {
            chain.active_mut().push(entry);
        }
        chain.freeze_active();
        // Recovered entries are already durable on disk; mark the buffer
        // Flushed immediately rather than re-flushing them.
        if let Some(mut b) = chain.pop_frozen() {
            b.mark_flushed();
            chain.push_flushed_front(b);
        }

        info!(wal = %id_str, first = files.first_log_id(), last = files.last_log_id(), "opened WAL");

        Ok(Wal {
            inner: Arc::new(WalCore {
                id_str,
                policy,
                state: Mutex::new(WalState { files, chain }),
                slot_ready: Condvar::new(),
                flusher,
                pre_process: pre_process_fn,
            }),
        })
    }

    /// An `Arc`-erased handle the flusher can hold without depending on `Wal` directly.
    pub fn as_flush_target(&self) -> Arc<dyn FlushTarget> {
        self.inner.clone()
    }

    pub fn last_log_id(&self) -> LogId {
        let s = self.inner.state.lock();
        s.chain.last_log_id().unwrap_or_else(|| s.files.last_log_id())
    }

    pub fn last_log_term(&self) -> TermId {
        let s = self.inner.state.lock();
        s.chain.last_log_term().unwrap_or_else(|| s.files.last_log_term())
    }

    pub fn first_log_id(&self) -> LogId {
        self.inner.state.lock().files.first_log_id()
    }

    /// Append a single entry. Enforces `id == lastLogId()+1` and
    /// `term >= lastLogTerm()`; a violation indicates a programmer error —
    /// the caller must abort, not retry.
    pub fn append(&self, log_id: LogId, term: TermId, cluster: ClusterId, payload: Vec<u8>) -> Result<()> {
        self.append_batch(std::iter::once(LogEntry::new(log_id, term, cluster, payload)))
    }

    /// Append a contiguous batch. Non-thread-safe; the caller (`RaftPart`)
    /// serializes all writers.
    ///
    /// An append fulfils once the in-memory buffer holds the entry; it does
    /// not itself touch the file. Durability (and the actual disk write) is
    /// the Flusher's job once the buffer holding this entry is frozen —
    /// writing here too would duplicate every record once the Flusher
    /// later drains the same buffer.
    pub fn append_batch(&self, entries: impl IntoIterator<Item = LogEntry>) -> Result<()> {
        let mut state = self.inner.state.lock();

        for entry in entries {
            let expected = state.chain.last_log_id().unwrap_or_else(|| state.files.last_log_id()) + 1;
            if entry.log_id != expected {
                return Err(RaftError::AppendOutOfOrder { expected, got: entry.log_id });
            }
            let last_term_known = state.chain.last_log_term().unwrap_or_else(|| state.files.last_log_term());
            if entry.term < last_term_known {
                return Err(RaftError::AppendTermRegressed { last: last_term_known, got: entry.term });
            }

            (self.inner.pre_process)(&entry);

            state.chain.active_mut().push(entry);

            while state.chain.active_mut().byte_len() >= self.inner.policy.buffer_size {
                self.freeze_and_maybe_flush(&mut state);
                while state.chain.len() >= self.inner.policy.num_buffers {
                    self.inner.slot_ready.wait(&mut state);
                }
            }
        }
        Ok(())
    }

    fn freeze_and_maybe_flush(&self, state: &mut WalState) {
        state.chain.freeze_active();
        if let Some(buf) = state.chain.pop_frozen() {
            self.inner.flusher.enqueue(self.inner.clone(), buf);
        }
    }

    /// A thread-safe forward cursor over `[first_log_id, last_log_id]`.
    /// Takes a consistent snapshot at creation time (see `wal::iter`).
    pub fn iterator(&self, first_log_id: LogId, last_log_id: LogId) -> Result<LogIter> {
        let state = self.inner.state.lock();
        let mut entries = state.files.read_range(first_log_id, last_log_id)?;
        entries.extend(state.chain.read_range(first_log_id, last_log_id));
        entries.sort_by_key(|e| e.log_id);
        entries.dedup_by_key(|e| e.log_id);
        Ok(LogIter::new(entries))
    }

    /// `INVALID_TERM` if `log_id` is not present.
    pub fn get_log_term(&self, log_id: LogId) -> TermId {
        let state = self.inner.state.lock();
        let mut hits = state.chain.read_range(log_id, log_id);
        if let Some(e) = hits.pop() {
            return e.term;
        }
        match state.files.read_range(log_id, log_id) {
            Ok(mut v) => v.pop().map(|e| e.term).unwrap_or(INVALID_TERM),
            Err(_) => INVALID_TERM,
        }
    }

    /// Roll back to `k`. Caller (`RaftPart`) must ensure `k >= committedLogId()`;
    /// the WAL itself does not track commit state. `k == 0` is equivalent to `reset`.
    pub fn rollback_to_log(&self, k: LogId) -> Result<()> {
        if k == 0 {
            return self.reset();
        }
        let mut state = self.inner.state.lock();
        state.files.rollback_to(k)?;
        state.chain.truncate_after(k);
        debug!(wal = %self.inner.id_str, k, "rolled back WAL");
        Ok(())
    }

    /// Truncate everything; next append uses id 1.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.files.reset()?;
        state.chain.clear();
        info!(wal = %self.inner.id_str, "reset WAL");
        Ok(())
    }

    /// Advisory retention below `below_log_id` (see `WalPolicy::ttl`).
    pub fn clean_wal(&self, below_log_id: LogId) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.files.clean_wal(below_log_id, self.inner.policy.ttl)
    }

    pub fn link_current_wal(&self, dest_dir: &Path) -> Result<()> {
        self.inner.state.lock().files.link_current_wal(dest_dir)
    }
}

impl Clone for Wal {
    fn clone(&self) -> Self {
        Wal { inner: self.inner.clone() }
    }
}

impl FlushTarget for WalCore {
    /// The sole writer of WAL bytes to disk: drains one frozen buffer,
    /// opening the active file first if this is the WAL's very first
    /// flush, then fsyncs and rotates if the file has grown past
    /// `policy.file_size`.
    fn flush_buffer(&self, buf: buffer::Buffer) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let encoded: Vec<Vec<u8>> = buf.entries().iter().map(|e| e.encode()).collect();
        let mut state = self.state.lock();
        if state.files.files().is_empty() {
            state.files.open_new_file(buf.first_log_id)?;
        }
        state.files.write_encoded(&encoded, buf.last_log_id, buf.last_log_term)?;
        state.files.sync()?;
        if state.files.active_size() >= self.policy.file_size {
            state.files.open_new_file(buf.last_log_id + 1)?;
        }
        let mut flushed = buf;
        flushed.mark_flushed();
        state.chain.push_flushed_front(flushed);
        state.chain.evict_to_cap(self.policy.num_buffers);
        drop(state);
        self.slot_ready.notify_all();
        Ok(())
    }

    fn id_str(&self) -> String {
        self.id_str.clone()
    }
}
