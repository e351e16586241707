//! Construction-time tunables for the replication state machine, the
//! per-peer pipeline, and the I/O layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every tunable named by the replication state machine, the per-peer
/// pipeline, and the I/O layer. Built once at partition construction and
/// shared via `Arc<RaftConfig>`; the one runtime-tunable knob
/// (`heartbeat_interval`, adjustable under a test harness) lives behind
/// `parking_lot::RwLock` rather than true global mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Randomized election timeout range: `[heartbeat_interval, heartbeat_interval + 1500ms]`
    /// kept as explicit bounds so callers can override them.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,

    /// Interval between leader heartbeats and the base period of the status poller.
    pub heartbeat_interval: Duration,

    /// Cap on pending client entries per partition before `E_BUFFER_OVERFLOW`.
    pub max_batch_size: usize,

    /// Cap on entries packed into a single AppendEntries RPC.
    pub max_appendlog_batch_size: usize,

    /// Cap on coalesced-but-undelivered requests per `Host` before `E_TOO_MANY_REQUESTS`.
    pub max_outstanding_requests: usize,

    /// Per-RPC timeout; on expiry the promise fails with `E_RPC_EXCEPTION`.
    pub raft_rpc_timeout_ms: u64,

    /// How long a follower waits in WAITING_SNAPSHOT before reverting to RUNNING.
    pub raft_snapshot_timeout: Duration,

    /// Retries per snapshot batch before giving up.
    pub snapshot_send_retry_times: u32,

    /// Backoff between replication rounds that fail to reach quorum
    /// (transient: a slow/partitioned follower, not a leadership change).
    pub replicate_retry_backoff: Duration,

    pub wal_policy: WalPolicy,

    /// Size of the I/O executor pool servicing RPC futures.
    pub io_executor_threads: usize,

    /// Size of the worker executor pool (election tasks, delayed callbacks, apply loop).
    pub worker_executor_threads: usize,

    /// Opt-in hardening: persist `(term, votedFor)` to a sidecar file before
    /// replying to a vote request. Off by default (term/vote state is tracked
    /// in memory only).
    pub persist_votes: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_millis(1000);
        RaftConfig {
            election_timeout_min: heartbeat_interval,
            election_timeout_max: heartbeat_interval + Duration::from_millis(1500),
            heartbeat_interval,
            max_batch_size: 1000,
            max_appendlog_batch_size: 256,
            max_outstanding_requests: 1000,
            raft_rpc_timeout_ms: 500,
            raft_snapshot_timeout: Duration::from_secs(60),
            snapshot_send_retry_times: 3,
            replicate_retry_backoff: Duration::from_millis(50),
            wal_policy: WalPolicy::default(),
            io_executor_threads: default_io_executor_threads(),
            worker_executor_threads: default_worker_executor_threads(),
            persist_votes: false,
        }
    }
}

/// Defaults to a small pool (4 workers), capped so a many-core host
/// doesn't oversubscribe the RPC executor.
fn default_io_executor_threads() -> usize {
    num_cpus::get().min(4).max(1)
}

/// Defaults to a small pool (4 workers) for election tasks, delayed
/// callbacks, and the apply loop.
fn default_worker_executor_threads() -> usize {
    num_cpus::get().min(4).max(1)
}

impl RaftConfig {
    /// Randomized election timeout in `[election_timeout_min, election_timeout_max]`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let ms = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    /// Status-poll period: `heartbeat_interval / 3 + rand(500ms)`.
    pub fn status_poll_interval(&self) -> Duration {
        use rand::Rng;
        let base = self.heartbeat_interval / 3;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=500));
        base + jitter
    }
}

/// WAL file rotation and in-memory buffer tunables, plus a `ttl`
/// retention hint used by `clean_wal`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WalPolicy {
    /// File rotation threshold in bytes.
    pub file_size: u64,

    /// Per-buffer capacity in bytes before it freezes.
    pub buffer_size: usize,

    /// Maximum number of buffers (Active + Frozen + Flushed) held at once;
    /// exceeding this blocks the appender.
    pub num_buffers: usize,

    /// Advisory retention hint: `clean_wal` only deletes files whose `mtime`
    /// is older than `ttl` *and* whose range is below the requested log id.
    pub ttl: Duration,
}

impl Default for WalPolicy {
    fn default() -> Self {
        WalPolicy {
            file_size: 128 * 1024 * 1024,
            buffer_size: 8 * 1024 * 1024,
            num_buffers: 4,
            ttl: Duration::from_secs(86_400),
        }
    }
}
