//! Per-peer replication pipeline: single-in-flight AppendEntries per
//! follower, request coalescing, and snapshot-fallback detection,
//! expressed as a single async task per round. `Host` never owns its
//! parent partition directly — it calls back through narrow closures
//! (`on_higher_term`, `on_need_snapshot`) instead, avoiding a reference
//! cycle between the per-peer pipeline and the owning replica.

use crate::config::RaftConfig;
use crate::error::{ErrorCode, RaftError, Result};
use crate::ids::{GraphSpaceId, HostAddr, LogId, PartitionId, TermId};
use crate::transport::{
    AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse, HeartbeatRequest,
    HeartbeatResponse, RaftTransport, WireLogEntry,
};
use crate::wal::Wal;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// A result cloned out to every coalesced waiter on a pipeline round.
/// Errors are reduced to the wire `ErrorCode` (`Copy`) rather than the full
/// `RaftError` so the broadcast doesn't need to clone an `io::Error`.
pub type SharedAppendResult = std::result::Result<AppendLogResponse, ErrorCode>;

struct HostState {
    stopped: bool,
    waiting_for_snapshot: bool,
    request_in_flight: bool,
    log_id_to_send: LogId,
    log_term_to_send: TermId,
    committed_log_id_to_send: LogId,
    last_log_id_sent: LogId,
    last_log_term_sent: TermId,
    follower_committed_log_id: LogId,
    /// `(term, logId, committedLogId)`; `None` means no coalesced request pending.
    pending_coalesced: Option<(TermId, LogId, LogId)>,
    waiters: Vec<oneshot::Sender<SharedAppendResult>>,
}

impl HostState {
    fn new() -> Self {
        HostState {
            stopped: false,
            waiting_for_snapshot: false,
            request_in_flight: false,
            log_id_to_send: 0,
            log_term_to_send: 0,
            committed_log_id_to_send: 0,
            last_log_id_sent: 0,
            last_log_term_sent: 0,
            follower_committed_log_id: 0,
            pending_coalesced: None,
            waiters: Vec::new(),
        }
    }
}

/// The per-peer pipeline object owned by the local `RaftPart` that sends
/// AppendEntries/Heartbeat/Vote to one remote replica.
pub struct Host {
    pub addr: HostAddr,
    id_str: String,
    space: GraphSpaceId,
    part: PartitionId,
    self_addr: HostAddr,
    transport: Arc<dyn RaftTransport>,
    wal: Wal,
    config: Arc<RaftConfig>,
    state: Mutex<HostState>,
    stopped_notify: Notify,
    on_higher_term: Arc<dyn Fn(TermId) + Send + Sync>,
    on_need_snapshot: Arc<dyn Fn(HostAddr) + Send + Sync>,
}

impl Host {
    pub fn new(
        addr: HostAddr,
        self_addr: HostAddr,
        space: GraphSpaceId,
        part: PartitionId,
        transport: Arc<dyn RaftTransport>,
        wal: Wal,
        config: Arc<RaftConfig>,
        on_higher_term: Arc<dyn Fn(TermId) + Send + Sync>,
        on_need_snapshot: Arc<dyn Fn(HostAddr) + Send + Sync>,
    ) -> Arc<Self> {
        let id_str = format!("[Host: {}][Space: {}][Part: {}]", addr, space, part);
        Arc::new(Host {
            addr,
            id_str,
            space,
            part,
            self_addr,
            transport,
            wal,
            config,
            state: Mutex::new(HostState::new()),
            stopped_notify: Notify::new(),
            on_higher_term,
            on_need_snapshot,
        })
    }

    /// Zero all pipeline pointers (election win, or catching a follower up
    /// from scratch).
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.log_id_to_send = 0;
        s.log_term_to_send = 0;
        s.committed_log_id_to_send = 0;
        s.last_log_id_sent = 0;
        s.last_log_term_sent = 0;
        s.follower_committed_log_id = 0;
        s.waiting_for_snapshot = false;
        s.pending_coalesced = None;
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    /// Blocks (async) until the in-flight RPC, if any, has completed or failed.
    pub async fn wait_for_stop(&self) {
        loop {
            if !self.state.lock().request_in_flight {
                return;
            }
            self.stopped_notify.notified().await;
        }
    }

    pub fn is_waiting_for_snapshot(&self) -> bool {
        self.state.lock().waiting_for_snapshot
    }

    pub fn mark_snapshot_done(&self, last_log_id: LogId, last_log_term: TermId) {
        let mut s = self.state.lock();
        s.waiting_for_snapshot = false;
        s.last_log_id_sent = last_log_id;
        s.last_log_term_sent = last_log_term;
        s.follower_committed_log_id = last_log_id;
    }

    pub async fn ask_for_vote(&self, req: AskForVoteRequest) -> Result<AskForVoteResponse> {
        if self.state.lock().stopped {
            return Err(RaftError::HostStopped);
        }
        self.transport.ask_for_vote(&self.addr, req).await
    }

    pub async fn send_heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        if self.state.lock().stopped {
            return Err(RaftError::HostStopped);
        }
        self.transport.heartbeat(&self.addr, req).await
    }

    /// Drive the follower up to `log_id` within `term`.
    pub async fn append_logs(
        self: &Arc<Self>,
        term: TermId,
        log_id: LogId,
        committed_log_id: LogId,
    ) -> Result<AppendLogResponse> {
        let rx = {
            let mut s = self.state.lock();
            if s.stopped {
                return Err(RaftError::HostStopped);
            }
            if s.waiting_for_snapshot {
                return Err(RaftError::WaitingSnapshot);
            }
            if s.request_in_flight {
                if s.waiters.len() >= self.config.max_outstanding_requests {
                    return Err(RaftError::TooManyRequests);
                }
                s.pending_coalesced = Some((term, log_id, committed_log_id));
                let (tx, rx) = oneshot::channel();
                s.waiters.push(tx);
                Some(rx)
            } else {
                s.request_in_flight = true;
                s.log_id_to_send = log_id;
                s.log_term_to_send = term;
                s.committed_log_id_to_send = committed_log_id;
                None
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(code)) => Err(RaftError::RpcException(format!("{:?}", code))),
                Err(_) => Err(RaftError::HostStopped),
            };
        }

        self.run_pipeline(term, log_id, committed_log_id).await
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        term: TermId,
        log_id: LogId,
        committed_log_id: LogId,
    ) -> Result<AppendLogResponse> {
        let result = loop {
            let (prev_log_id, prev_log_term, last_sent) = {
                let s = self.state.lock();
                (s.last_log_id_sent, s.last_log_term_sent, s.last_log_id_sent)
            };

            if last_sent >= log_id {
                // Already caught up (e.g. a coalesced round landed after success).
                break Ok(AppendLogResponse {
                    error_code: ErrorCode::Succeeded,
                    current_term: term,
                    leader_addr: self.self_addr.host.clone(),
                    leader_port: self.self_addr.port,
                    committed_log_id,
                    last_matched_log_id: prev_log_id,
                    last_matched_log_term: prev_log_term,
                });
            }

            let from = prev_log_id + 1;
            if self.wal.first_log_id() > from && self.wal.first_log_id() > 1 {
                self.enter_snapshot_mode();
                break Err(RaftError::WaitingSnapshot);
            }

            let to = (from + self.config.max_appendlog_batch_size as LogId - 1).min(log_id);
            let iter = self.wal.iterator(from, to)?;
            let mut entries = Vec::new();
            let mut batch_term = None;
            for entry in iter {
                match batch_term {
                    None => batch_term = Some(entry.term),
                    Some(t) if t != entry.term => break,
                    _ => {}
                }
                entries.push(WireLogEntry { cluster: entry.cluster, log_str: entry.payload });
            }

            let req = AppendLogRequest {
                space: self.space,
                part: self.part,
                leader_addr: self.self_addr.host.clone(),
                leader_port: self.self_addr.port,
                current_term: term,
                last_log_id: log_id,
                committed_log_id,
                last_log_term_sent: prev_log_term,
                last_log_id_sent: prev_log_id,
                log_term: batch_term.unwrap_or(prev_log_term),
                log_str_list: entries,
            };

            let resp = match self.transport.append_log(&self.addr, req).await {
                Ok(resp) => resp,
                Err(e) => break Err(e),
            };

            match resp.error_code {
                ErrorCode::Succeeded | ErrorCode::LogGap | ErrorCode::LogStale => {
                    {
                        let mut s = self.state.lock();
                        s.last_log_id_sent = resp.last_matched_log_id;
                        s.last_log_term_sent = resp.last_matched_log_term;
                        s.follower_committed_log_id = resp.committed_log_id;
                    }
                    if resp.last_matched_log_id >= log_id {
                        break Ok(resp);
                    }
                    // still behind; loop for another batch
                    continue;
                }
                ErrorCode::TermOutOfDate if resp.current_term > term => {
                    (self.on_higher_term)(resp.current_term);
                    break Err(RaftError::UnknownAppendLog);
                }
                ErrorCode::RpcException => break Err(RaftError::RpcException("transport error".into())),
                other => {
                    warn!(host = %self.id_str, code = ?other, "append_log rejected");
                    break Err(RaftError::BadState(format!("{:?}", other)));
                }
            }
        };

        self.finish_round(&result);

        if let Some((t, l, c)) = self.state.lock().pending_coalesced.take() {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.append_logs(t, l, c).await;
            });
        }

        result
    }

    fn enter_snapshot_mode(&self) {
        let mut s = self.state.lock();
        if s.waiting_for_snapshot {
            return;
        }
        s.waiting_for_snapshot = true;
        debug!(host = %self.id_str, "WAL compacted past follower, entering snapshot mode");
        (self.on_need_snapshot)(self.addr.clone());
    }

    fn finish_round(&self, result: &Result<AppendLogResponse>) {
        let shared: SharedAppendResult = match result {
            Ok(r) => Ok(r.clone()),
            Err(e) => Err(e.to_error_code()),
        };
        let mut s = self.state.lock();
        s.request_in_flight = false;
        for w in s.waiters.drain(..) {
            let _ = w.send(shared.clone());
        }
        drop(s);
        self.stopped_notify.notify_waiters();
    }
}
