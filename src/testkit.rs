//! In-process harness wiring several `RaftPart`s together with an
//! in-memory transport and an in-memory state machine, for driving
//! multi-replica scenarios without a real network or disk layout beyond a
//! scratch WAL directory per node.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::ids::{GraphSpaceId, HostAddr, LogId, PartitionId, TermId};
use crate::part::{RaftPart, Role, Status};
use crate::snapshot::SnapshotSource;
use crate::state_machine::{CommitOutcome, StateMachine};
use crate::transport::*;
use crate::wal::flusher::Flusher;
use crate::wal::record::LogType;
use crate::wal::Wal;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SPACE: GraphSpaceId = 0;
pub const PART: PartitionId = 0;

/// Transport that dispatches straight into the target node's handler
/// methods instead of going over a socket. Every node in a `TestCluster`
/// shares one registry so any node can reach any other by address, and one
/// `partitioned` set so a severed node is unreachable in both directions
/// (neither its outbound calls nor inbound calls to it succeed), the way an
/// actual crashed or network-partitioned process would be.
pub struct InMemoryTransport {
    self_addr: HostAddr,
    registry: Arc<DashMap<HostAddr, Arc<RaftPart>>>,
    partitioned: Arc<DashMap<HostAddr, ()>>,
}

impl InMemoryTransport {
    fn target(&self, to: &HostAddr) -> Result<Arc<RaftPart>> {
        if self.partitioned.contains_key(&self.self_addr) || self.partitioned.contains_key(to) {
            return Err(RaftError::RpcException(format!("{to} unreachable")));
        }
        self.registry
            .get(to)
            .map(|r| r.value().clone())
            .ok_or_else(|| RaftError::RpcException(format!("no such node: {to}")))
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn ask_for_vote(&self, to: &HostAddr, req: AskForVoteRequest) -> Result<AskForVoteResponse> {
        self.target(to)?.handle_vote_request(req).await
    }

    async fn append_log(&self, to: &HostAddr, req: AppendLogRequest) -> Result<AppendLogResponse> {
        self.target(to)?.handle_append_log_request(req).await
    }

    async fn heartbeat(&self, to: &HostAddr, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.target(to)?.handle_heartbeat(req).await
    }

    async fn send_snapshot(&self, to: &HostAddr, req: SendSnapshotRequest) -> Result<SendSnapshotResponse> {
        self.target(to)?.handle_send_snapshot_request(req).await
    }
}

/// A state machine that just remembers every committed `Normal` payload in
/// order, plus the committed position, so scenario tests can assert on
/// both. Also serves as the `SnapshotSource` for its own node: it streams
/// back whatever it has committed so far.
pub struct InMemoryStateMachine {
    rows: Mutex<Vec<Vec<u8>>>,
    committed_log_id: Mutex<LogId>,
    committed_log_term: Mutex<TermId>,
    commit_calls: AtomicU64,
    snapshot_cursor: Mutex<usize>,
}

impl InMemoryStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryStateMachine {
            rows: Mutex::new(Vec::new()),
            committed_log_id: Mutex::new(0),
            committed_log_term: Mutex::new(0),
            commit_calls: AtomicU64::new(0),
            snapshot_cursor: Mutex::new(0),
        })
    }

    pub fn rows(&self) -> Vec<Vec<u8>> {
        self.rows.lock().clone()
    }

    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateMachine for InMemoryStateMachine {
    async fn commit(&self, mut iter: crate::wal::iter::LogIter, _wait: bool) -> (CommitOutcome, LogId, TermId) {
        let (mut id, mut term) = (*self.committed_log_id.lock(), *self.committed_log_term.lock());
        while iter.valid() {
            if let Some(entry) = iter.entry() {
                if entry.log_type == LogType::Normal {
                    self.rows.lock().push(entry.payload.clone());
                }
                id = entry.log_id;
                term = entry.term;
            }
            iter.next();
        }
        *self.committed_log_id.lock() = id;
        *self.committed_log_term.lock() = term;
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        (CommitOutcome::Succeeded, id, term)
    }

    async fn commit_snapshot(&self, rows: Vec<Vec<u8>>, id: LogId, term: TermId, done: bool) -> (CommitOutcome, u64, u64) {
        let count = rows.len() as u64;
        let size: u64 = rows.iter().map(|r| r.len() as u64).sum();
        self.rows.lock().extend(rows);
        if done {
            *self.committed_log_id.lock() = id;
            *self.committed_log_term.lock() = term;
        }
        (CommitOutcome::Succeeded, count, size)
    }

    async fn last_committed_log_id(&self) -> (LogId, TermId) {
        (*self.committed_log_id.lock(), *self.committed_log_term.lock())
    }

    async fn cleanup(&self) -> CommitOutcome {
        CommitOutcome::Succeeded
    }

    async fn on_leader_ready(&self, _term: TermId) {}
    async fn on_elected(&self, _term: TermId) {}
    async fn on_lost_leadership(&self, _term: TermId) {}
    async fn on_discover_new_leader(&self, _addr: HostAddr) {}
}

impl SnapshotSource for InMemoryStateMachine {
    fn next_batch(&self, max_bytes: usize) -> (Vec<Vec<u8>>, bool) {
        let rows = self.rows.lock();
        let mut cursor = self.snapshot_cursor.lock();
        let mut batch = Vec::new();
        let mut size = 0usize;
        while *cursor < rows.len() && size < max_bytes {
            let row = &rows[*cursor];
            size += row.len();
            batch.push(row.clone());
            *cursor += 1;
        }
        let done = *cursor >= rows.len();
        (batch, done)
    }
}

/// A short-timer `RaftConfig` suitable for exercising elections and
/// heartbeats inside a test's real-time budget.
pub fn fast_config() -> Arc<RaftConfig> {
    Arc::new(RaftConfig {
        election_timeout_min: Duration::from_millis(60),
        election_timeout_max: Duration::from_millis(120),
        heartbeat_interval: Duration::from_millis(30),
        raft_snapshot_timeout: Duration::from_millis(200),
        ..RaftConfig::default()
    })
}

pub struct TestCluster {
    pub nodes: Vec<Arc<RaftPart>>,
    pub state_machines: Vec<Arc<InMemoryStateMachine>>,
    partitioned: Arc<DashMap<HostAddr, ()>>,
    _dirs: Vec<TempDir>,
    _flusher_guard: Arc<crate::wal::flusher::FlusherGuard>,
}

impl TestCluster {
    pub fn addr(i: usize) -> HostAddr {
        HostAddr::new("127.0.0.1", 10_000 + i as u16)
    }

    /// Build `n` nodes, all voters of each other, sharing one flush thread
    /// and one in-memory transport registry.
    pub fn new(n: usize) -> Self {
        Self::with_config(n, fast_config())
    }

    pub fn with_config(n: usize, config: Arc<RaftConfig>) -> Self {
        let registry: Arc<DashMap<HostAddr, Arc<RaftPart>>> = Arc::new(DashMap::new());
        let partitioned: Arc<DashMap<HostAddr, ()>> = Arc::new(DashMap::new());
        let (flusher, guard) = Flusher::spawn();
        let mut nodes = Vec::with_capacity(n);
        let mut state_machines = Vec::with_capacity(n);
        let mut dirs = Vec::with_capacity(n);

        let all_addrs: Vec<HostAddr> = (0..n).map(Self::addr).collect();

        for i in 0..n {
            let dir = TempDir::new().unwrap();
            let wal = Wal::open(
                dir.path(),
                config.wal_policy,
                flusher.clone(),
                format!("node{i}"),
                Arc::new(|_entry: &crate::wal::record::LogEntry| {}),
            )
            .unwrap();

            let peers: HashSet<HostAddr> =
                all_addrs.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, a)| a.clone()).collect();

            let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport {
                self_addr: Self::addr(i),
                registry: registry.clone(),
                partitioned: partitioned.clone(),
            });
            let sm = InMemoryStateMachine::new();

            let part = RaftPart::new(
                SPACE,
                PART,
                Self::addr(i),
                peers,
                HashSet::new(),
                config.clone(),
                wal,
                transport,
                sm.clone(),
                sm.clone(),
            );
            registry.insert(Self::addr(i), part.clone());
            nodes.push(part);
            state_machines.push(sm);
            dirs.push(dir);
        }

        for node in &nodes {
            node.start();
        }

        TestCluster { nodes, state_machines, partitioned, _dirs: dirs, _flusher_guard: Arc::new(guard) }
    }

    pub fn node(&self, i: usize) -> Arc<RaftPart> {
        self.nodes[i].clone()
    }

    pub fn state_machine(&self, i: usize) -> Arc<InMemoryStateMachine> {
        self.state_machines[i].clone()
    }

    /// Block a node's RPCs in both directions, simulating a crashed or
    /// network-partitioned replica without tearing down its own tasks.
    pub fn sever(&self, i: usize) {
        self.partitioned.insert(Self::addr(i), ());
    }

    pub fn rejoin(&self, i: usize) {
        self.partitioned.remove(&Self::addr(i));
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }

    pub fn leader(&self) -> Option<Arc<RaftPart>> {
        self.nodes.iter().find(|n| n.role() == Role::Leader).cloned()
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<Arc<RaftPart>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(l) = self.leader() {
                return Some(l);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_until(&self, timeout: Duration, mut cond: impl FnMut(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cond(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_commit(&self, id: LogId, timeout: Duration) -> bool {
        self.wait_until(timeout, |c| c.nodes.iter().all(|n| n.committed_log_id() >= id)).await
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.nodes.iter().map(|n| n.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RaftError;
    use crate::ids::DEFAULT_CLUSTER_ID;

    #[tokio::test]
    async fn single_node_commit() {
        let cluster = TestCluster::new(1);
        let leader = cluster.wait_for_leader(Duration::from_secs(2)).await.expect("no leader elected");

        leader.append_async(DEFAULT_CLUSTER_ID, b"hello".to_vec()).await.unwrap();

        assert_eq!(leader.committed_log_id(), 1);
        assert_eq!(cluster.state_machine(0).rows(), vec![b"hello".to_vec()]);
        assert_eq!(cluster.state_machine(0).commit_calls(), 1);

        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn three_node_happy_path() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader(Duration::from_secs(2)).await.expect("no leader elected");

        for payload in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            leader.append_async(DEFAULT_CLUSTER_ID, payload).await.unwrap();
        }

        assert!(cluster.wait_for_commit(3, Duration::from_secs(2)).await);
        for i in 0..3 {
            assert_eq!(cluster.state_machine(i).rows(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        }

        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn leader_crash_and_recovery() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader(Duration::from_secs(2)).await.expect("no leader elected");
        let leader_idx = cluster.nodes.iter().position(|n| Arc::ptr_eq(n, &leader)).unwrap();

        for i in 0..5 {
            leader.append_async(DEFAULT_CLUSTER_ID, format!("e{}", i + 1).into_bytes()).await.unwrap();
        }
        assert!(cluster.wait_for_commit(5, Duration::from_secs(2)).await);

        cluster.sever(leader_idx);

        let new_leader = cluster
            .wait_until(Duration::from_secs(3), |c| {
                c.nodes
                    .iter()
                    .enumerate()
                    .any(|(i, n)| i != leader_idx && n.role() == Role::Leader)
            })
            .await;
        assert!(new_leader, "no new leader elected after the old leader was severed");
        let new_leader = cluster
            .nodes
            .iter()
            .enumerate()
            .find(|(i, n)| *i != leader_idx && n.role() == Role::Leader)
            .map(|(_, n)| n.clone())
            .unwrap();

        new_leader.append_async(DEFAULT_CLUSTER_ID, b"e6".to_vec()).await.unwrap();

        cluster.rejoin(leader_idx);
        assert!(cluster.wait_for_commit(6, Duration::from_secs(3)).await);

        for i in 0..3 {
            assert!(cluster.node(i).committed_log_id() >= 6);
        }

        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn follower_lag_triggers_snapshot() {
        let config = Arc::new(RaftConfig {
            wal_policy: crate::config::WalPolicy {
                file_size: 512,
                buffer_size: 64,
                num_buffers: 4,
                ttl: Duration::from_millis(1),
                ..crate::config::WalPolicy::default()
            },
            ..(*fast_config()).clone()
        });
        let cluster = TestCluster::with_config(3, config);
        let leader = cluster.wait_for_leader(Duration::from_secs(2)).await.expect("no leader elected");
        let leader_idx = cluster.nodes.iter().position(|n| Arc::ptr_eq(n, &leader)).unwrap();
        let lagging_idx = (leader_idx + 1) % 3;

        cluster.sever(lagging_idx);

        for i in 0..50 {
            leader.append_async(DEFAULT_CLUSTER_ID, format!("row{i}").into_bytes()).await.unwrap();
        }
        assert!(
            cluster
                .wait_until(Duration::from_secs(3), |c| c.leader().map(|l| l.committed_log_id()).unwrap_or(0) >= 50)
                .await
        );

        // Compact the leader's own WAL: the lagging follower will come back
        // far enough behind `firstLogId` that it must be caught up by a
        // snapshot stream rather than ordinary AppendEntries replication.
        let committed = leader.committed_log_id();
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.wal.clean_wal(committed).unwrap();

        cluster.rejoin(lagging_idx);

        assert!(cluster.wait_for_commit(50, Duration::from_secs(5)).await);
        assert_eq!(cluster.state_machine(lagging_idx).rows().len(), 50);

        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn at_most_one_leader_per_term_across_repeated_elections() {
        let cluster = TestCluster::new(3);
        assert!(cluster.wait_for_leader(Duration::from_secs(2)).await.is_some());

        // Force a handful of re-elections by repeatedly severing whoever is
        // currently leading, then check the single-leader-per-term
        // invariant holds at every observation point.
        for _ in 0..3 {
            let Some(leader) = cluster.leader() else { continue };
            let leader_idx = cluster.nodes.iter().position(|n| Arc::ptr_eq(n, &leader)).unwrap();
            let term_before = leader.term();
            cluster.sever(leader_idx);

            cluster
                .wait_until(Duration::from_secs(3), |c| {
                    c.nodes.iter().enumerate().any(|(i, n)| i != leader_idx && n.role() == Role::Leader && n.term() > term_before)
                })
                .await;

            let mut by_term: std::collections::HashMap<TermId, usize> = std::collections::HashMap::new();
            for n in &cluster.nodes {
                if n.role() == Role::Leader {
                    *by_term.entry(n.term()).or_insert(0) += 1;
                }
            }
            for (_, count) in by_term {
                assert_eq!(count, 1, "more than one leader observed for the same term");
            }

            cluster.rejoin(leader_idx);
            cluster
                .wait_until(Duration::from_secs(2), |c| {
                    c.nodes.iter().filter(|n| n.role() == Role::Leader).count() <= 1
                })
                .await;
        }

        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn atomic_op_rejection_does_not_gap_subsequent_normals() {
        let cluster = TestCluster::new(1);
        let leader = cluster.wait_for_leader(Duration::from_secs(2)).await.expect("no leader elected");

        // Spawn the failing ATOMIC_OP alongside ten NORMAL proposals so they
        // can land in the same replication round, the way a burst of
        // concurrent client calls would.
        let atomic = tokio::spawn({
            let leader = leader.clone();
            async move { leader.atomic_op_async(DEFAULT_CLUSTER_ID, || None).await }
        });
        let mut normal_handles = Vec::with_capacity(10);
        for i in 0..10 {
            let leader = leader.clone();
            normal_handles.push(tokio::spawn(async move {
                leader.append_async(DEFAULT_CLUSTER_ID, format!("n{i}").into_bytes()).await
            }));
        }

        let atomic_result = atomic.await.unwrap();
        assert!(matches!(atomic_result, Err(RaftError::AtomicOpFailed)));

        for h in normal_handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(leader.committed_log_id(), 10);
        assert_eq!(cluster.state_machine(0).rows().len(), 10);

        cluster.stop_all().await;
    }
}
