//! Client append path and follower `AppendEntries` handling: the pending-
//! batch promise machinery, the replication round, and the follower-side
//! log-matching algorithm, expressed with `tokio::sync::oneshot` promises
//! (see `DESIGN.md`).

use super::{RaftPart, Role, Status};
use crate::error::{ErrorCode, RaftError, Result};
use crate::ids::{ClusterId, LogId, TermId};
use crate::transport::{AppendLogRequest, AppendLogResponse, HeartbeatRequest, HeartbeatResponse, WireLogEntry};
use crate::wal::record::{LogEntry, LogType};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Resolves once the entry it is attached to either commits or definitively
/// fails. `AtomicOp` entries each get their own; `Normal`/`Command` entries
/// submitted in the same round share one.
pub(crate) type AppendOutcome = std::result::Result<(), ErrorCode>;

pub(crate) enum PendingPayload {
    Normal(ClusterId, Vec<u8>),
    /// Evaluated once, immediately before the batch is appended to the
    /// leader's own WAL; `None` means "propose nothing" (an atomic op may
    /// no-op based on state observed at propose time).
    AtomicOp(ClusterId, Box<dyn FnOnce() -> Option<Vec<u8>> + Send>),
    Command(ClusterId, Vec<u8>),
}

pub(crate) struct PendingEntry {
    pub payload: PendingPayload,
    pub tx: oneshot::Sender<AppendOutcome>,
}

pub(crate) struct PendingBatch {
    pub entries: VecDeque<PendingEntry>,
}

impl PendingBatch {
    pub fn new() -> Self {
        PendingBatch { entries: VecDeque::new() }
    }
}

/// Draws the next round's batch off the front of `pending`, honoring the
/// per-`LogType` batch-boundary rules (spec §3.2): an `AtomicOp` must start
/// a new batch and is sent alone; a `Command` ends whatever batch it's in,
/// so anything queued behind it waits for the next round (which only
/// starts once this round's commit resolves).
fn take_next_batch(pending: &mut VecDeque<PendingEntry>, cap: usize) -> Vec<PendingEntry> {
    let mut batch = Vec::new();
    if matches!(pending.front().map(|e| &e.payload), Some(PendingPayload::AtomicOp(..))) {
        batch.push(pending.pop_front().unwrap());
        return batch;
    }
    while let Some(front) = pending.front() {
        if matches!(front.payload, PendingPayload::AtomicOp(..)) {
            break;
        }
        let is_command = matches!(front.payload, PendingPayload::Command(..));
        batch.push(pending.pop_front().unwrap());
        if is_command || batch.len() >= cap {
            break;
        }
    }
    batch
}

impl RaftPart {
    /// Propose a normal write. Resolves once the entry containing it commits
    /// (or definitively fails).
    pub async fn append_async(self: &Arc<Self>, cluster: ClusterId, payload: Vec<u8>) -> Result<()> {
        self.enqueue(PendingPayload::Normal(cluster, payload)).await
    }

    /// Propose an atomic, leader-evaluated compare-and-swap style op. `op`
    /// runs on the leader's worker executor immediately before the entry is
    /// appended; returning `None` aborts the proposal with no log entry
    /// written.
    pub async fn atomic_op_async(
        self: &Arc<Self>,
        cluster: ClusterId,
        op: impl FnOnce() -> Option<Vec<u8>> + Send + 'static,
    ) -> Result<()> {
        self.enqueue(PendingPayload::AtomicOp(cluster, Box::new(op))).await
    }

    /// Propose a `COMMAND`-type entry (used internally for membership
    /// changes; also exposed for any caller needing a commit-ordered
    /// control message alongside ordinary writes).
    pub async fn send_command_async(self: &Arc<Self>, cluster: ClusterId, payload: Vec<u8>) -> Result<()> {
        self.enqueue(PendingPayload::Command(cluster, payload)).await
    }

    async fn enqueue(self: &Arc<Self>, payload: PendingPayload) -> Result<()> {
        if self.is_stopped() {
            return Err(RaftError::RaftStopped);
        }
        if self.state.lock().role != Role::Leader {
            let leader = self.state.lock().leader_addr.clone();
            return Err(RaftError::LeaderChanged(leader));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.entries.len() >= self.config.max_batch_size {
                return Err(RaftError::BufferOverflow);
            }
            pending.entries.push_back(PendingEntry { payload, tx });
        }

        self.kick_replication();

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(code)) => Err(code_to_error(code)),
            Err(_) => Err(RaftError::RaftStopped),
        }
    }

    /// Starts a replication round if one isn't already in flight — at most
    /// one in-flight replication round per partition.
    fn kick_replication(self: &Arc<Self>) {
        use std::sync::atomic::Ordering;
        if self
            .replicating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let this = self.clone();
            tokio::spawn(async move {
                this.replicate_round().await;
                this.replicating.store(false, Ordering::SeqCst);
                // A proposal may have arrived while this round was in
                // flight; drain it with another round.
                if !this.pending.lock().entries.is_empty() {
                    this.kick_replication();
                }
            });
        }
    }

    async fn replicate_round(self: &Arc<Self>) {
        let batch: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            take_next_batch(&mut pending.entries, self.config.max_appendlog_batch_size)
        };
        if batch.is_empty() {
            return;
        }

        let (term, role) = {
            let s = self.state.lock();
            (s.term, s.role)
        };
        if role != Role::Leader {
            for e in batch {
                let _ = e.tx.send(Err(ErrorCode::LeaderChanged));
            }
            return;
        }

        let mut log_entries = Vec::with_capacity(batch.len());
        let mut senders = Vec::with_capacity(batch.len());
        let start_id = self.wal.last_log_id() + 1;
        let mut next_id = start_id;

        for entry in batch {
            match entry.payload {
                PendingPayload::Normal(cluster, payload) => {
                    log_entries.push(LogEntry { log_id: next_id, term, cluster, log_type: LogType::Normal, payload });
                    senders.push(entry.tx);
                    next_id += 1;
                }
                PendingPayload::AtomicOp(cluster, op) => {
                    match op() {
                        Some(payload) => {
                            log_entries.push(LogEntry {
                                log_id: next_id,
                                term,
                                cluster,
                                log_type: LogType::AtomicOp,
                                payload,
                            });
                            senders.push(entry.tx);
                            next_id += 1;
                        }
                        None => {
                            let _ = entry.tx.send(Err(ErrorCode::AtomicOpFailed));
                        }
                    }
                }
                PendingPayload::Command(cluster, payload) => {
                    log_entries.push(LogEntry { log_id: next_id, term, cluster, log_type: LogType::Command, payload });
                    senders.push(entry.tx);
                    next_id += 1;
                }
            }
        }

        if log_entries.is_empty() {
            return;
        }
        let last_id = next_id - 1;

        for e in &log_entries {
            self.apply_preprocess(e);
        }

        if let Err(e) = self.wal.append_batch(log_entries.into_iter()) {
            warn!(part = %self.id_str, error = %e, "failed to append proposed batch to local WAL");
            for tx in senders {
                let _ = tx.send(Err(e.to_error_code()));
            }
            return;
        }

        {
            let mut s = self.state.lock();
            s.last_log_id = last_id;
            s.last_log_term = term;
        }

        self.drive_to_quorum(last_id, term, senders).await;
    }

    /// Fans `(term, last_id]` out to every peer and learner in parallel —
    /// learners receive the entries but their acks never count toward
    /// quorum — and retries with a small backoff until a quorum of voters
    /// (including self) has matched, or this replica stops being leader of
    /// `term` (spec §4.4.3 step 6: a transient quorum miss retries; only a
    /// higher term observed fails the promise, and with `E_UNKNOWN_APPEND_LOG`
    /// since the entries may or may not commit under the next leader).
    async fn drive_to_quorum(
        self: &Arc<Self>,
        last_id: LogId,
        term: TermId,
        senders: Vec<oneshot::Sender<AppendOutcome>>,
    ) {
        loop {
            if self.is_stopped() {
                for tx in senders {
                    let _ = tx.send(Err(ErrorCode::RaftStopped));
                }
                return;
            }
            let (role, cur_term) = {
                let s = self.state.lock();
                (s.role, s.term)
            };
            if role != Role::Leader || cur_term != term {
                for tx in senders {
                    let _ = tx.send(Err(ErrorCode::UnknownAppendLog));
                }
                return;
            }

            let committed_log_id = { self.state.lock().committed_log_id };
            let hosts = self.hosts_snapshot();
            let voters = { self.state.lock().peers.clone() };
            let quorum = { self.state.lock().quorum() };

            let mut futs = Vec::new();
            for host in &hosts {
                let addr = host.addr.clone();
                let host = host.clone();
                futs.push(async move { (addr, host.append_logs(term, last_id, committed_log_id).await) });
            }
            let results = futures::future::join_all(futs).await;

            let mut acked = 1usize; // self
            let mut saw_higher_term = false;
            for (addr, r) in results {
                match r {
                    Ok(resp) if resp.current_term > term => {
                        self.on_host_observed_higher_term(resp.current_term);
                        saw_higher_term = true;
                    }
                    Ok(resp) if voters.contains(&addr) && resp.last_matched_log_id >= last_id => acked += 1,
                    _ => {}
                }
            }

            if acked >= quorum {
                self.advance_commit(last_id, term).await;
                for tx in senders {
                    let _ = tx.send(Ok(()));
                }
                return;
            }

            if saw_higher_term {
                for tx in senders {
                    let _ = tx.send(Err(ErrorCode::UnknownAppendLog));
                }
                return;
            }

            tokio::time::sleep(self.config.replicate_retry_backoff).await;
        }
    }

    async fn advance_commit(self: &Arc<Self>, log_id: LogId, term: TermId) {
        let from = { self.state.lock().committed_log_id + 1 };
        if from > log_id {
            return;
        }
        let iter = match self.wal.iterator(from, log_id) {
            Ok(it) => it,
            Err(e) => {
                warn!(part = %self.id_str, error = %e, "failed to build commit iterator");
                return;
            }
        };
        let newly_committed: Vec<LogEntry> = iter.clone_entries();
        let (_outcome, committed_id, committed_term) = self.state_machine.commit(iter, true).await;
        let mut s = self.state.lock();
        if committed_id > s.committed_log_id {
            s.committed_log_id = committed_id;
            s.committed_log_term = committed_term;
            s.commit_in_this_term = true;
        }
        drop(s);
        for entry in &newly_committed {
            if entry.log_id <= committed_id {
                self.finalize_membership_commit(entry).await;
            }
        }
        let _ = term;
    }

    fn apply_preprocess(self: &Arc<Self>, entry: &LogEntry) {
        if entry.log_type == LogType::Command {
            self.apply_membership_preprocess(entry);
        }
    }

    /// Handle an incoming `AppendLogRequest` on the follower side.
    pub async fn handle_append_log_request(self: &Arc<Self>, req: AppendLogRequest) -> Result<AppendLogResponse> {
        let self_addr = self.self_addr.clone();
        let mut s = self.state.lock();
        s.last_msg_recv_time = Instant::now();

        if req.current_term < s.term {
            return Ok(reject(ErrorCode::TermOutOfDate, s.term, &self_addr));
        }
        if req.current_term > s.term {
            s.term = req.current_term;
            s.voted_for = None;
        }
        s.role = Role::Follower;
        s.leader_addr = crate::ids::HostAddr::new(&req.leader_addr, req.leader_port);
        let local_term = s.term;
        let local_last_log_id = s.last_log_id;
        drop(s);

        if self.status() == Status::WaitingSnapshot {
            return Ok(reject(ErrorCode::WaitingSnapshot, local_term, &self_addr));
        }

        // Consistency check: our log at `last_log_id_sent` must match the
        // leader's view (term equality at that index).
        if req.last_log_id_sent > 0 {
            if req.last_log_id_sent > local_last_log_id {
                return Ok(gap_response(local_term, self.committed_log_id(), local_last_log_id, &self_addr));
            }
            let have_term = self.wal.get_log_term(req.last_log_id_sent);
            if have_term != req.last_log_term_sent {
                return Ok(stale_response(local_term, self.committed_log_id(), &self_addr));
            }
        }

        if !req.log_str_list.is_empty() {
            let mut entries = Vec::with_capacity(req.log_str_list.len());
            let mut id = req.last_log_id_sent + 1;
            for WireLogEntry { cluster, log_str } in req.log_str_list {
                entries.push(LogEntry::new(id, req.log_term, cluster, log_str));
                id += 1;
            }
            let last_new_id = id - 1;

            if req.last_log_id_sent < local_last_log_id {
                // Leader is overwriting a conflicting suffix; roll back first.
                if req.last_log_id_sent < self.committed_log_id() {
                    return Ok(reject(ErrorCode::BadState, local_term, &self_addr));
                }
                self.wal.rollback_to_log(req.last_log_id_sent)?;
                self.state.lock().last_log_id = req.last_log_id_sent;
            }

            for e in &entries {
                self.apply_preprocess(e);
            }
            self.wal.append_batch(entries.into_iter())?;
            let mut s = self.state.lock();
            s.last_log_id = last_new_id;
            s.last_log_term = req.log_term;
        }

        let (matched_id, matched_term) = {
            let s = self.state.lock();
            (s.last_log_id, s.last_log_term)
        };

        if req.committed_log_id > self.committed_log_id() {
            let from = self.committed_log_id() + 1;
            let to = req.committed_log_id.min(matched_id);
            if to >= from {
                if let Ok(iter) = self.wal.iterator(from, to) {
                    let newly_committed: Vec<LogEntry> = iter.clone_entries();
                    let (_outcome, committed_id, committed_term) = self.state_machine.commit(iter, false).await;
                    let mut s = self.state.lock();
                    if committed_id > s.committed_log_id {
                        s.committed_log_id = committed_id;
                        s.committed_log_term = committed_term;
                    }
                    drop(s);
                    for entry in &newly_committed {
                        if entry.log_id <= committed_id {
                            self.finalize_membership_commit(entry).await;
                        }
                    }
                }
            }
        }

        Ok(AppendLogResponse {
            error_code: ErrorCode::Succeeded,
            current_term: local_term,
            leader_addr: self_addr.host,
            leader_port: self_addr.port,
            committed_log_id: self.committed_log_id(),
            last_matched_log_id: matched_id,
            last_matched_log_term: matched_term,
        })
    }

    pub async fn handle_heartbeat(self: &Arc<Self>, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let self_addr = self.self_addr.clone();
        let mut s = self.state.lock();
        s.last_msg_recv_time = Instant::now();
        if req.current_term < s.term {
            return Ok(HeartbeatResponse {
                error_code: ErrorCode::TermOutOfDate,
                current_term: s.term,
                leader_addr: self_addr.host,
                leader_port: self_addr.port,
                committed_log_id: s.committed_log_id,
                last_log_id: s.last_log_id,
                last_log_term: s.last_log_term,
            });
        }
        if req.current_term > s.term {
            s.term = req.current_term;
            s.voted_for = None;
        }
        s.role = Role::Follower;
        s.leader_addr = crate::ids::HostAddr::new(&req.leader_addr, req.leader_port);
        let resp = HeartbeatResponse {
            error_code: ErrorCode::Succeeded,
            current_term: s.term,
            leader_addr: self_addr.host,
            leader_port: self_addr.port,
            committed_log_id: s.committed_log_id,
            last_log_id: s.last_log_id,
            last_log_term: s.last_log_term,
        };
        debug!(part = %self.id_str, leader = %req.leader_addr, "heartbeat accepted");
        Ok(resp)
    }
}

fn reject(code: ErrorCode, term: TermId, self_addr: &crate::ids::HostAddr) -> AppendLogResponse {
    AppendLogResponse {
        error_code: code,
        current_term: term,
        leader_addr: self_addr.host.clone(),
        leader_port: self_addr.port,
        committed_log_id: 0,
        last_matched_log_id: 0,
        last_matched_log_term: 0,
    }
}

fn gap_response(term: TermId, committed: LogId, matched: LogId, self_addr: &crate::ids::HostAddr) -> AppendLogResponse {
    AppendLogResponse {
        error_code: ErrorCode::LogGap,
        current_term: term,
        leader_addr: self_addr.host.clone(),
        leader_port: self_addr.port,
        committed_log_id: committed,
        last_matched_log_id: matched,
        last_matched_log_term: 0,
    }
}

fn stale_response(term: TermId, committed: LogId, self_addr: &crate::ids::HostAddr) -> AppendLogResponse {
    AppendLogResponse {
        error_code: ErrorCode::LogStale,
        current_term: term,
        leader_addr: self_addr.host.clone(),
        leader_port: self_addr.port,
        committed_log_id: committed,
        last_matched_log_id: 0,
        last_matched_log_term: 0,
    }
}

fn code_to_error(code: ErrorCode) -> RaftError {
    match code {
        ErrorCode::LeaderChanged => RaftError::LeaderChanged(crate::ids::HostAddr::unknown()),
        ErrorCode::BufferOverflow => RaftError::BufferOverflow,
        ErrorCode::RetryExhausted => RaftError::RetryExhausted,
        ErrorCode::RaftStopped => RaftError::RaftStopped,
        ErrorCode::AtomicOpFailed => RaftError::AtomicOpFailed,
        ErrorCode::UnknownAppendLog => RaftError::UnknownAppendLog,
        other => RaftError::BadState(format!("{:?}", other)),
    }
}
