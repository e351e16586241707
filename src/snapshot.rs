//! Whole-state snapshot streaming: a batching, retrying `sendSnapshot`
//! operation that catches up a replica whose WAL prefix the leader has
//! already compacted away (see `DESIGN.md` for what was left out).

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::ids::{GraphSpaceId, HostAddr, LogId, PartitionId, TermId};
use crate::state_machine::StateMachine;
use crate::transport::{RaftTransport, SendSnapshotRequest};
use std::sync::Arc;
use tracing::{info, warn};

/// Batches are capped by this many bytes of row payload per `SendSnapshotRequest`.
pub const DEFAULT_BATCH_SIZE_BYTES: usize = 1024 * 1024;

/// A source of key/value rows to stream; implemented by whatever owns the
/// state machine's storage. Kept separate from `StateMachine` because
/// scanning for a snapshot source and committing an incoming one are
/// different capabilities a given node may or may not both need.
pub trait SnapshotSource: Send + Sync {
    /// Pull the next batch of raw rows starting after the last call,
    /// returning `(rows, done)`. `done=true` on the call that returns the
    /// final batch (which may be empty).
    fn next_batch(&self, max_bytes: usize) -> (Vec<Vec<u8>>, bool);
}

pub struct SnapshotManager {
    transport: Arc<dyn RaftTransport>,
    config: Arc<RaftConfig>,
}

impl SnapshotManager {
    pub fn new(transport: Arc<dyn RaftTransport>, config: Arc<RaftConfig>) -> Self {
        SnapshotManager { transport, config }
    }

    /// Stream `source`'s rows to `dst`, retrying each batch up to
    /// `snapshot_send_retry_times`. Returns the `(committed_log_id,
    /// committed_log_term)` the stream was anchored to.
    pub async fn send_snapshot(
        &self,
        space: GraphSpaceId,
        part: PartitionId,
        current_term: TermId,
        committed_log_id: LogId,
        committed_log_term: TermId,
        leader_addr: &HostAddr,
        dst: &HostAddr,
        source: &dyn SnapshotSource,
    ) -> Result<(LogId, TermId)> {
        let mut total_count: u64 = 0;
        let mut total_size: u64 = 0;
        loop {
            let (rows, done) = source.next_batch(DEFAULT_BATCH_SIZE_BYTES);
            let batch_count = rows.len() as u64;
            let batch_size: u64 = rows.iter().map(|r| r.len() as u64).sum();

            let req = SendSnapshotRequest {
                space,
                part,
                current_term,
                committed_log_id,
                committed_log_term,
                leader_addr: leader_addr.host.clone(),
                leader_port: leader_addr.port,
                rows,
                total_size: total_size + batch_size,
                total_count: total_count + batch_count,
                done,
            };

            let mut attempt: u32 = 0;
            loop {
                match self.transport.send_snapshot(dst, req.clone()).await {
                    Ok(resp) if resp.error_code == crate::error::ErrorCode::Succeeded => break,
                    Ok(resp) => {
                        return Err(RaftError::PersistSnapshotFailed(format!(
                            "peer rejected snapshot batch: {:?}",
                            resp.error_code
                        )));
                    }
                    Err(e) => {
                        attempt += 1;
                        if attempt >= self.config.snapshot_send_retry_times {
                            return Err(RaftError::PersistSnapshotFailed(e.to_string()));
                        }
                        warn!(dst = %dst, attempt, "snapshot batch failed, retrying");
                    }
                }
            }

            total_count += batch_count;
            total_size += batch_size;

            if done {
                info!(dst = %dst, total_count, total_size, "snapshot stream complete");
                return Ok((committed_log_id, committed_log_term));
            }
        }
    }
}

/// Receiver-side state for an in-progress snapshot install. Owned by the
/// `RaftPart` that is the target.
pub struct SnapshotReceiver {
    anchor: Option<(LogId, TermId)>,
    accepted_count: u64,
    accepted_size: u64,
}

impl SnapshotReceiver {
    pub fn new() -> Self {
        SnapshotReceiver { anchor: None, accepted_count: 0, accepted_size: 0 }
    }

    /// Process one incoming batch. `leader_term` must match the partition's
    /// current known leader's term (checked by the caller before this is
    /// invoked — only the recognized leader for `term` may send a snapshot).
    pub async fn process_batch(
        &mut self,
        req: &SendSnapshotRequest,
        state_machine: &dyn StateMachine,
    ) -> Result<()> {
        match self.anchor {
            None => {
                self.anchor = Some((req.committed_log_id, req.committed_log_term));
                self.accepted_count = 0;
                self.accepted_size = 0;
            }
            Some((id, term)) => {
                if id != req.committed_log_id || term != req.committed_log_term {
                    return Err(RaftError::BadState(
                        "snapshot batch anchor mismatch mid-stream".to_string(),
                    ));
                }
            }
        }

        let batch_count = req.rows.len() as u64;
        let batch_size: u64 = req.rows.iter().map(|r| r.len() as u64).sum();
        state_machine
            .commit_snapshot(req.rows.clone(), req.committed_log_id, req.committed_log_term, req.done)
            .await;
        self.accepted_count += batch_count;
        self.accepted_size += batch_size;

        if req.done {
            if self.accepted_count != req.total_count || self.accepted_size != req.total_size {
                return Err(RaftError::PersistSnapshotFailed(format!(
                    "snapshot totals mismatch: accepted ({}, {}) vs advertised ({}, {})",
                    self.accepted_count, self.accepted_size, req.total_count, req.total_size
                )));
            }
        }
        Ok(())
    }

    pub fn is_done_consistent(&self) -> Option<(LogId, TermId)> {
        self.anchor
    }
}

impl Default for SnapshotReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::state_machine::CommitOutcome;
    use crate::transport::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct VecSource {
        rows: Mutex<Vec<Vec<u8>>>,
    }

    impl SnapshotSource for VecSource {
        fn next_batch(&self, _max_bytes: usize) -> (Vec<Vec<u8>>, bool) {
            let mut rows = self.rows.lock().unwrap();
            let batch: Vec<Vec<u8>> = rows.drain(..).collect();
            (batch, true)
        }
    }

    struct FakeTransport;
    #[async_trait]
    impl RaftTransport for FakeTransport {
        async fn ask_for_vote(&self, _to: &HostAddr, req: AskForVoteRequest) -> Result<AskForVoteResponse> {
            Ok(AskForVoteResponse { error_code: ErrorCode::Succeeded, current_term: req.term })
        }
        async fn append_log(&self, _to: &HostAddr, req: AppendLogRequest) -> Result<AppendLogResponse> {
            Ok(AppendLogResponse {
                error_code: ErrorCode::Succeeded,
                current_term: req.current_term,
                leader_addr: req.leader_addr,
                leader_port: req.leader_port,
                committed_log_id: req.committed_log_id,
                last_matched_log_id: req.last_log_id,
                last_matched_log_term: req.log_term,
            })
        }
        async fn heartbeat(&self, _to: &HostAddr, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse {
                error_code: ErrorCode::Succeeded,
                current_term: req.current_term,
                leader_addr: req.leader_addr,
                leader_port: req.leader_port,
                committed_log_id: req.committed_log_id,
                last_log_id: req.last_log_id,
                last_log_term: 1,
            })
        }
        async fn send_snapshot(&self, _to: &HostAddr, req: SendSnapshotRequest) -> Result<SendSnapshotResponse> {
            Ok(SendSnapshotResponse { error_code: ErrorCode::Succeeded, current_term: req.current_term })
        }
    }

    #[tokio::test]
    async fn streams_until_done() {
        let transport: Arc<dyn RaftTransport> = Arc::new(FakeTransport);
        let mgr = SnapshotManager::new(transport, Arc::new(RaftConfig::default()));
        let source = VecSource { rows: Mutex::new(vec![b"a".to_vec(), b"b".to_vec()]) };
        let (id, term) = mgr
            .send_snapshot(0, 0, 1, 10, 1, &HostAddr::new("leader", 1), &HostAddr::new("peer", 2), &source)
            .await
            .unwrap();
        assert_eq!(id, 10);
        assert_eq!(term, 1);
    }

    struct CountingStateMachine {
        count: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl StateMachine for CountingStateMachine {
        async fn commit(&self, _iter: crate::wal::iter::LogIter, _wait: bool) -> (CommitOutcome, LogId, TermId) {
            (CommitOutcome::Succeeded, 0, 0)
        }
        async fn commit_snapshot(&self, rows: Vec<Vec<u8>>, _id: LogId, _term: TermId, _done: bool) -> (CommitOutcome, u64, u64) {
            self.count.fetch_add(rows.len() as u64, std::sync::atomic::Ordering::SeqCst);
            (CommitOutcome::Succeeded, 0, 0)
        }
        async fn last_committed_log_id(&self) -> (LogId, TermId) {
            (0, 0)
        }
        async fn cleanup(&self) -> CommitOutcome {
            CommitOutcome::Succeeded
        }
        async fn on_leader_ready(&self, _term: TermId) {}
        async fn on_elected(&self, _term: TermId) {}
        async fn on_lost_leadership(&self, _term: TermId) {}
        async fn on_discover_new_leader(&self, _addr: HostAddr) {}
    }

    #[tokio::test]
    async fn receiver_rejects_anchor_mismatch() {
        let sm = CountingStateMachine { count: std::sync::atomic::AtomicU64::new(0) };
        let mut recv = SnapshotReceiver::new();
        let req1 = SendSnapshotRequest {
            space: 0,
            part: 0,
            current_term: 1,
            committed_log_id: 10,
            committed_log_term: 1,
            leader_addr: "l".into(),
            leader_port: 1,
            rows: vec![b"a".to_vec()],
            total_size: 1,
            total_count: 2,
            done: false,
        };
        recv.process_batch(&req1, &sm).await.unwrap();

        let mut req2 = req1.clone();
        req2.committed_log_id = 11;
        req2.done = true;
        let err = recv.process_batch(&req2, &sm).await;
        assert!(err.is_err());
    }
}
