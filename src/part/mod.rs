//! `RaftPart`: the replication state machine for one partition. A struct
//! wrapping `Mutex`-guarded role/term/vote/log bookkeeping plus spawned
//! tokio tasks for the timers.

pub mod election;
pub mod membership;
pub mod replication;

use crate::config::RaftConfig;
use crate::error::{ErrorCode, Result};
use crate::host::Host;
use crate::ids::{GraphSpaceId, HostAddr, LogId, PartitionId, TermId};
use crate::snapshot::{SnapshotManager, SnapshotReceiver, SnapshotSource};
use crate::state_machine::StateMachine;
use crate::transport::{RaftTransport, SendSnapshotRequest, SendSnapshotResponse};
use crate::wal::Wal;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// The lifecycle state of one partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Starting,
    Running,
    Stopped,
    WaitingSnapshot,
}

/// A replica's role in the replication state machine. `Learner` is an
/// entry role only: it never transitions to another role and no other
/// role ever transitions to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
    Learner,
}

/// The exclusive-lock-guarded replica state.
/// Held only briefly; never across an RPC call or blocking I/O.
pub(crate) struct PartState {
    pub status: Status,
    pub role: Role,
    pub term: TermId,
    pub voted_term: TermId,
    pub voted_for: Option<HostAddr>,
    pub last_log_id: LogId,
    pub last_log_term: TermId,
    pub committed_log_id: LogId,
    pub committed_log_term: TermId,
    pub leader_addr: HostAddr,
    pub peers: HashSet<HostAddr>,
    pub learners: HashSet<HostAddr>,
    pub last_msg_recv_time: Instant,
    pub last_msg_accepted_time: Instant,
    pub last_msg_accepted_cost_ms: u64,
    pub commit_in_this_term: bool,
    /// Set once an election win is still pending a quorum of formal-vote grants.
    pub votes_received: HashSet<HostAddr>,
    /// Pre-vote grants accumulated for the in-flight pre-vote round.
    pub pre_votes_received: HashSet<HostAddr>,
}

impl PartState {
    /// `floor(voting_members / 2) + 1`, including self.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

pub struct RaftPart {
    pub space: GraphSpaceId,
    pub part: PartitionId,
    pub(crate) self_addr: HostAddr,
    pub(crate) id_str: String,
    pub(crate) config: Arc<RaftConfig>,
    pub(crate) wal: Wal,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) snapshot_mgr: SnapshotManager,
    pub(crate) snapshot_source: Arc<dyn SnapshotSource>,
    pub(crate) state: Mutex<PartState>,
    pub(crate) hosts: DashMap<HostAddr, Arc<Host>>,
    pub(crate) pending: Mutex<replication::PendingBatch>,
    pub(crate) replicating: AtomicBool,
    pub(crate) stopped: AtomicBool,
    pub(crate) apply_notify: Notify,
    pub(crate) snapshot_receiver: AsyncMutex<SnapshotReceiver>,
}

impl RaftPart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        space: GraphSpaceId,
        part: PartitionId,
        self_addr: HostAddr,
        peers: HashSet<HostAddr>,
        learners: HashSet<HostAddr>,
        config: Arc<RaftConfig>,
        wal: Wal,
        transport: Arc<dyn RaftTransport>,
        state_machine: Arc<dyn StateMachine>,
        snapshot_source: Arc<dyn SnapshotSource>,
    ) -> Arc<Self> {
        let id_str = format!("[Port: {}][Space: {}][Part: {}]", self_addr.port, space, part);
        let snapshot_mgr = SnapshotManager::new(transport.clone(), config.clone());
        let last_log_id = wal.last_log_id();
        let last_log_term = wal.last_log_term();

        let part = Arc::new(RaftPart {
            space,
            part,
            self_addr,
            id_str,
            config,
            wal,
            transport,
            state_machine,
            snapshot_mgr,
            snapshot_source,
            state: Mutex::new(PartState {
                status: Status::Starting,
                role: Role::Follower,
                term: 0,
                voted_term: 0,
                voted_for: None,
                last_log_id,
                last_log_term,
                committed_log_id: 0,
                committed_log_term: 0,
                leader_addr: HostAddr::unknown(),
                peers,
                learners,
                last_msg_recv_time: Instant::now(),
                last_msg_accepted_time: Instant::now(),
                last_msg_accepted_cost_ms: 0,
                commit_in_this_term: false,
                votes_received: HashSet::new(),
                pre_votes_received: HashSet::new(),
            }),
            hosts: DashMap::new(),
            pending: Mutex::new(replication::PendingBatch::new()),
            replicating: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            apply_notify: Notify::new(),
            snapshot_receiver: AsyncMutex::new(SnapshotReceiver::new()),
        });

        part.replay_membership_commands();
        part.rebuild_hosts();
        part.state.lock().status = Status::Running;
        part
    }

    fn rebuild_hosts(self: &Arc<Self>) {
        let (peers, learners) = {
            let s = self.state.lock();
            (s.peers.clone(), s.learners.clone())
        };
        self.hosts.clear();
        for addr in peers.into_iter().chain(learners.into_iter()) {
            let host = self.make_host(addr.clone());
            self.hosts.insert(addr, host);
        }
    }

    fn make_host(self: &Arc<Self>, addr: HostAddr) -> Arc<Host> {
        let this_higher_term = self.clone();
        let this_snapshot = self.clone();
        Host::new(
            addr,
            self.self_addr.clone(),
            self.space,
            self.part,
            self.transport.clone(),
            self.wal.clone(),
            self.config.clone(),
            Arc::new(move |term| this_higher_term.on_host_observed_higher_term(term)),
            Arc::new(move |addr| this_snapshot.on_host_needs_snapshot(addr)),
        )
    }

    fn on_host_observed_higher_term(self: &Arc<Self>, term: TermId) {
        let mut s = self.state.lock();
        if term > s.term {
            let was_leader = s.role == Role::Leader;
            s.term = term;
            s.role = Role::Follower;
            s.leader_addr = HostAddr::unknown();
            drop(s);
            if was_leader {
                let sm = self.state_machine.clone();
                tokio::spawn(async move { sm.on_lost_leadership(term).await });
            }
        }
    }

    fn on_host_needs_snapshot(self: &Arc<Self>, addr: HostAddr) {
        info!(part = %self.id_str, peer = %addr, "peer needs a snapshot");
        let this = self.clone();
        tokio::spawn(async move { this.drive_snapshot(addr).await });
    }

    async fn drive_snapshot(self: Arc<Self>, addr: HostAddr) {
        let Some(host) = self.hosts.get(&addr).map(|r| r.value().clone()) else {
            return;
        };
        let (term, committed_log_id, committed_log_term) = {
            let s = self.state.lock();
            (s.term, s.committed_log_id, s.committed_log_term)
        };
        let result = self
            .snapshot_mgr
            .send_snapshot(
                self.space,
                self.part,
                term,
                committed_log_id,
                committed_log_term,
                &self.self_addr,
                &addr,
                self.snapshot_source.as_ref(),
            )
            .await;
        match result {
            Ok((id, t)) => host.mark_snapshot_done(id, t),
            Err(e) => {
                warn!(part = %self.id_str, peer = %addr, error = %e, "snapshot stream failed, will retry");
            }
        }
    }

    pub fn id_str(&self) -> &str {
        &self.id_str
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn term(&self) -> TermId {
        self.state.lock().term
    }

    pub fn committed_log_id(&self) -> LogId {
        self.state.lock().committed_log_id
    }

    pub fn leader_addr(&self) -> HostAddr {
        self.state.lock().leader_addr.clone()
    }

    /// A leader's read lease is valid until
    /// `last_msg_accepted_time + heartbeat_interval - last_msg_accepted_cost_ms`.
    pub fn lease_valid(&self) -> bool {
        let s = self.state.lock();
        if s.role != Role::Leader {
            return false;
        }
        let window = self
            .config
            .heartbeat_interval
            .saturating_sub(Duration::from_millis(s.last_msg_accepted_cost_ms));
        s.last_msg_accepted_time.elapsed() < window
    }

    /// Explicit `stop()`: synchronous-friendly — marks STOPPED under the
    /// state lock, then stops every `Host` and waits for their in-flight
    /// RPCs to drain.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        {
            let mut s = self.state.lock();
            s.status = Status::Stopped;
        }
        let hosts: Vec<Arc<Host>> = self.hosts.iter().map(|r| r.value().clone()).collect();
        for h in &hosts {
            h.stop();
        }
        for h in &hosts {
            h.wait_for_stop().await;
        }
        self.state_machine.cleanup().await;
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Launches the status poller (`heartbeat_interval/3 + rand(500ms)`).
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.is_stopped() {
                    return;
                }
                let interval = this.config.status_poll_interval();
                tokio::time::sleep(interval).await;
                if this.is_stopped() {
                    return;
                }
                this.status_polling().await;
            }
        });
    }

    /// A repeating delayed task: if leader, send heartbeats; if follower
    /// past election timeout, begin pre-vote; if waiting-for-snapshot timed
    /// out, drop back to running.
    async fn status_polling(self: &Arc<Self>) {
        let (role, status, elapsed) = {
            let s = self.state.lock();
            (s.role, s.status, s.last_msg_recv_time.elapsed())
        };

        match (role, status) {
            (_, Status::WaitingSnapshot) => {
                if elapsed >= self.config.raft_snapshot_timeout {
                    let mut s = self.state.lock();
                    s.status = Status::Running;
                }
            }
            (Role::Leader, Status::Running) => {
                self.send_heartbeats().await;
            }
            (Role::Follower, Status::Running) | (Role::Candidate, Status::Running) => {
                if elapsed >= self.config.heartbeat_interval {
                    let _ = self.try_start_election().await;
                }
            }
            _ => {}
        }
    }

    /// Receiver side of whole-state snapshot install: accepts batches only
    /// from the recognized leader for `req.current_term`, resets the local
    /// WAL and enters `WaitingSnapshot` on the first batch, hands rows off
    /// to the state machine, and on the last batch installs the verified
    /// totals as the new committed/last log position.
    pub async fn handle_send_snapshot_request(
        self: &Arc<Self>,
        req: SendSnapshotRequest,
    ) -> Result<SendSnapshotResponse> {
        let leader = HostAddr::new(&req.leader_addr, req.leader_port);
        {
            let s = self.state.lock();
            if req.current_term < s.term {
                return Ok(SendSnapshotResponse { error_code: ErrorCode::TermOutOfDate, current_term: s.term });
            }
            if s.role != Role::Learner
                && s.leader_addr != HostAddr::unknown()
                && s.leader_addr != leader
                && req.current_term == s.term
            {
                return Ok(SendSnapshotResponse { error_code: ErrorCode::TermOutOfDate, current_term: s.term });
            }
        }

        let is_first_batch = self.snapshot_receiver.lock().await.is_done_consistent().is_none();
        if is_first_batch {
            if let Err(e) = self.wal.reset() {
                warn!(part = %self.id_str, error = %e, "failed to reset WAL for incoming snapshot");
                return Err(e);
            }
            let mut s = self.state.lock();
            s.status = Status::WaitingSnapshot;
            s.term = req.current_term;
            s.leader_addr = leader.clone();
            s.last_msg_recv_time = Instant::now();
            info!(part = %self.id_str, peer = %leader, "snapshot install started");
        }

        self.process_snapshot_batch(&req).await?;

        if req.done {
            let mut s = self.state.lock();
            s.committed_log_id = req.committed_log_id;
            s.committed_log_term = req.committed_log_term;
            s.last_log_id = req.committed_log_id;
            s.last_log_term = req.committed_log_term;
            s.term = req.committed_log_term.max(s.term);
            s.status = Status::Running;
            drop(s);
            *self.snapshot_receiver.lock().await = SnapshotReceiver::new();
            info!(part = %self.id_str, id = req.committed_log_id, "snapshot install complete");
        }

        Ok(SendSnapshotResponse { error_code: ErrorCode::Succeeded, current_term: self.state.lock().term })
    }

    async fn process_snapshot_batch(self: &Arc<Self>, req: &SendSnapshotRequest) -> Result<()> {
        let mut recv = self.snapshot_receiver.lock().await;
        recv.process_batch(req, self.state_machine.as_ref()).await
    }

    pub(crate) fn hosts_snapshot(&self) -> Vec<Arc<Host>> {
        self.hosts.iter().map(|r| r.value().clone()).collect()
    }

    pub(crate) fn voter_hosts_snapshot(&self) -> Vec<Arc<Host>> {
        let peers = self.state.lock().peers.clone();
        self.hosts
            .iter()
            .filter(|r| peers.contains(r.key()))
            .map(|r| r.value().clone())
            .collect()
    }
}

/// A one-shot waiter used by callers that need to block on an async
/// operation performed on the worker executor.
pub(crate) fn oneshot_pair<T>() -> (oneshot::Sender<T>, oneshot::Receiver<T>) {
    oneshot::channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::error::ErrorCode;
    use crate::snapshot::SnapshotSource;
    use crate::state_machine::CommitOutcome;
    use crate::transport::*;
    use crate::wal::flusher::Flusher;
    use crate::wal::Wal;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct NoopTransport;
    #[async_trait]
    impl RaftTransport for NoopTransport {
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
                last_log_term: 0,
            })
        }
        async fn send_snapshot(&self, _to: &HostAddr, req: SendSnapshotRequest) -> Result<SendSnapshotResponse> {
            Ok(SendSnapshotResponse { error_code: ErrorCode::Succeeded, current_term: req.current_term })
        }
    }

    struct CountingStateMachine {
        committed_rows: std::sync::atomic::AtomicU64,
    }

    impl CountingStateMachine {
        fn new() -> Self {
            CountingStateMachine { committed_rows: std::sync::atomic::AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl crate::state_machine::StateMachine for CountingStateMachine {
        async fn commit(&self, mut iter: crate::wal::iter::LogIter, _wait: bool) -> (CommitOutcome, LogId, TermId) {
            let mut id = 0;
            let mut term = 0;
            while iter.valid() {
                id = iter.log_id().unwrap_or(id);
                term = iter.log_term().unwrap_or(term);
                iter.next();
            }
            (CommitOutcome::Succeeded, id, term)
        }
        async fn commit_snapshot(&self, rows: Vec<Vec<u8>>, _id: LogId, _term: TermId, _done: bool) -> (CommitOutcome, u64, u64) {
            self.committed_rows.fetch_add(rows.len() as u64, std::sync::atomic::Ordering::SeqCst);
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

    struct EmptySource;
    impl SnapshotSource for EmptySource {
        fn next_batch(&self, _max_bytes: usize) -> (Vec<Vec<u8>>, bool) {
            (Vec::new(), true)
        }
    }

    fn make_part(dir: &std::path::Path, sm: Arc<CountingStateMachine>) -> Arc<RaftPart> {
        let (flusher, _guard) = Flusher::spawn();
        let wal = Wal::open(
            dir,
            crate::config::WalPolicy::default(),
            flusher,
            "test".into(),
            Arc::new(|_entry: &crate::wal::record::LogEntry| {}),
        )
        .unwrap();
        RaftPart::new(
            0,
            0,
            HostAddr::new("127.0.0.1", 1),
            HashSet::new(),
            HashSet::new(),
            Arc::new(RaftConfig::default()),
            wal,
            Arc::new(NoopTransport),
            sm,
            Arc::new(EmptySource),
        )
    }

    #[tokio::test]
    async fn snapshot_install_from_unknown_leader_is_accepted_once_adopted() {
        let dir = tempdir().unwrap();
        let sm = Arc::new(CountingStateMachine::new());
        let part = make_part(dir.path(), sm.clone());

        let req = SendSnapshotRequest {
            space: 0,
            part: 0,
            current_term: 5,
            committed_log_id: 100,
            committed_log_term: 5,
            leader_addr: "10.0.0.1".into(),
            leader_port: 9,
            rows: vec![b"row1".to_vec(), b"row2".to_vec()],
            total_size: 8,
            total_count: 2,
            done: true,
        };
        let resp = part.handle_send_snapshot_request(req).await.unwrap();
        assert_eq!(resp.error_code, ErrorCode::Succeeded);
        assert_eq!(part.committed_log_id(), 100);
        assert_eq!(part.term(), 5);
        assert_eq!(part.status(), Status::Running);
        assert_eq!(sm.committed_rows.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn snapshot_install_rejects_stale_term() {
        let dir = tempdir().unwrap();
        let sm = Arc::new(CountingStateMachine::new());
        let part = make_part(dir.path(), sm);
        part.state.lock().term = 10;

        let req = SendSnapshotRequest {
            space: 0,
            part: 0,
            current_term: 3,
            committed_log_id: 1,
            committed_log_term: 1,
            leader_addr: "10.0.0.1".into(),
            leader_port: 9,
            rows: vec![],
            total_size: 0,
            total_count: 0,
            done: true,
        };
        let resp = part.handle_send_snapshot_request(req).await.unwrap();
        assert_eq!(resp.error_code, ErrorCode::TermOutOfDate);
        assert_eq!(part.status(), Status::Running);
    }

    #[tokio::test]
    async fn snapshot_install_spans_multiple_batches() {
        let dir = tempdir().unwrap();
        let sm = Arc::new(CountingStateMachine::new());
        let part = make_part(dir.path(), sm.clone());

        let first = SendSnapshotRequest {
            space: 0,
            part: 0,
            current_term: 2,
            committed_log_id: 50,
            committed_log_term: 2,
            leader_addr: "10.0.0.1".into(),
            leader_port: 9,
            rows: vec![b"a".to_vec()],
            total_size: 2,
            total_count: 2,
            done: false,
        };
        let resp = part.handle_send_snapshot_request(first).await.unwrap();
        assert_eq!(resp.error_code, ErrorCode::Succeeded);
        assert_eq!(part.status(), Status::WaitingSnapshot);

        let second = SendSnapshotRequest {
            space: 0,
            part: 0,
            current_term: 2,
            committed_log_id: 50,
            committed_log_term: 2,
            leader_addr: "10.0.0.1".into(),
            leader_port: 9,
            rows: vec![b"b".to_vec()],
            total_size: 2,
            total_count: 2,
            done: true,
        };
        let resp = part.handle_send_snapshot_request(second).await.unwrap();
        assert_eq!(resp.error_code, ErrorCode::Succeeded);
        assert_eq!(part.status(), Status::Running);
        assert_eq!(part.committed_log_id(), 50);
        assert_eq!(sm.committed_rows.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
