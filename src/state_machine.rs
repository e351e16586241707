//! The opaque state-machine capability the core commits into. The
//! key-value engine and its atomic batch writes live outside this crate;
//! only the trait boundary lives here.

use crate::ids::{LogId, TermId};
use crate::wal::iter::LogIter;
use async_trait::async_trait;

/// Outcome of a commit-style call into the state machine, alongside the
/// raft bookkeeping fields it needs back (last log id/term actually applied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Succeeded,
    WriteStalled,
    Failed,
}

/// Consumed by `RaftPart` to apply committed entries and to learn about
/// role transitions. Implementors own durability and indexing for the
/// application's actual data; this crate only calls through the boundary.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply every entry yielded by `iter` in order. `wait` is `true` on the
    /// leader (the caller may stall until durable) and `false` on a
    /// follower. Returns the outcome plus the last `(LogId, TermId)` applied.
    async fn commit(&self, iter: LogIter, wait: bool) -> (CommitOutcome, LogId, TermId);

    /// Apply one batch of a snapshot stream. Returns the outcome plus the
    /// running `(count, size)` this implementor has now accumulated so the
    /// caller can verify totals on `done`.
    async fn commit_snapshot(
        &self,
        rows: Vec<Vec<u8>>,
        committed_log_id: LogId,
        committed_log_term: TermId,
        done: bool,
    ) -> (CommitOutcome, u64, u64);

    /// Highest `(LogId, TermId)` this state machine has durably applied.
    async fn last_committed_log_id(&self) -> (LogId, TermId);

    /// Called on partition shutdown to release any state-machine resources.
    async fn cleanup(&self) -> CommitOutcome;

    /// Called exactly once per term, the first time a commit succeeds under
    /// a freshly elected leader.
    async fn on_leader_ready(&self, term: TermId);

    /// Called when this replica wins an election, before any commit.
    async fn on_elected(&self, term: TermId);

    /// Called when this replica steps down from LEADER.
    async fn on_lost_leadership(&self, term: TermId);

    /// Called when this replica learns of a new leader address.
    async fn on_discover_new_leader(&self, addr: crate::ids::HostAddr);
}
