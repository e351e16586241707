//! Pre-vote and formal vote: a two-phase election state machine
//! (a pre-vote round gated behind `enable_pre_vote`, then a real
//! term-bumping vote round) that avoids disrupting a stable leader with a
//! partitioned replica's spuriously advanced term.

use super::{RaftPart, Role};
use crate::error::{ErrorCode, Result};
use crate::ids::TermId;
use crate::transport::{AskForVoteRequest, AskForVoteResponse};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

impl RaftPart {
    /// Entry point from the status poller: run pre-vote (if enabled) then,
    /// if a quorum of peers believe an election could succeed, start the
    /// real vote round.
    pub(crate) async fn try_start_election(self: &Arc<Self>) -> Result<()> {
        if self.config.enable_pre_vote {
            if !self.run_pre_vote_round().await? {
                return Ok(());
            }
        }
        self.run_vote_round().await
    }

    async fn run_pre_vote_round(self: &Arc<Self>) -> Result<bool> {
        let (next_term, last_log_id, last_log_term, self_addr) = {
            let s = self.state.lock();
            (s.term + 1, s.last_log_id, s.last_log_term, self.self_addr.clone())
        };

        let hosts = self.voter_hosts_snapshot();
        let quorum = { self.state.lock().quorum() };
        let mut granted = 1usize; // vote for self

        let mut futs = Vec::new();
        for host in &hosts {
            let req = AskForVoteRequest {
                space: self.space,
                part: self.part,
                candidate_addr: self_addr.host.clone(),
                candidate_port: self_addr.port,
                term: next_term,
                last_log_id,
                last_log_term,
                is_pre_vote: true,
            };
            let host = host.clone();
            futs.push(async move { host.ask_for_vote(req).await });
        }
        let results = futures::future::join_all(futs).await;
        for r in results {
            if let Ok(AskForVoteResponse { error_code: ErrorCode::Succeeded, .. }) = r {
                granted += 1;
            }
        }

        info!(part = %self.id_str, granted, quorum, "pre-vote round complete");
        Ok(granted >= quorum)
    }

    /// Start a formal vote round immediately, skipping pre-vote — used by
    /// a leadership-transfer target so it doesn't wait out a pre-vote round
    /// before contesting the seat.
    pub(crate) async fn run_vote_round_no_prevote(self: &Arc<Self>) -> Result<()> {
        self.run_vote_round().await
    }

    async fn run_vote_round(self: &Arc<Self>) -> Result<()> {
        let (next_term, last_log_id, last_log_term, self_addr) = {
            let mut s = self.state.lock();
            if s.role == Role::Leader {
                return Ok(());
            }
            s.role = Role::Candidate;
            s.term += 1;
            s.voted_term = s.term;
            s.voted_for = Some(self.self_addr.clone());
            s.votes_received.clear();
            s.votes_received.insert(self.self_addr.clone());
            (s.term, s.last_log_id, s.last_log_term, self.self_addr.clone())
        };

        let hosts = self.voter_hosts_snapshot();
        let quorum = { self.state.lock().quorum() };

        let mut futs = Vec::new();
        for host in &hosts {
            let req = AskForVoteRequest {
                space: self.space,
                part: self.part,
                candidate_addr: self_addr.host.clone(),
                candidate_port: self_addr.port,
                term: next_term,
                last_log_id,
                last_log_term,
                is_pre_vote: false,
            };
            let addr = host.addr.clone();
            let host = host.clone();
            futs.push(async move { (addr, host.ask_for_vote(req).await) });
        }
        let results = futures::future::join_all(futs).await;

        let mut granted = 1usize;
        let mut highest_foreign_term = next_term;
        for (addr, r) in results {
            match r {
                Ok(resp) if resp.error_code == ErrorCode::Succeeded => {
                    granted += 1;
                    self.state.lock().votes_received.insert(addr);
                }
                Ok(resp) => {
                    if resp.current_term > highest_foreign_term {
                        highest_foreign_term = resp.current_term;
                    }
                }
                Err(_) => {}
            }
        }

        let mut s = self.state.lock();
        if s.role != Role::Candidate || s.term != next_term {
            // Already stepped down or term moved on while votes were outstanding.
            return Ok(());
        }
        if highest_foreign_term > s.term {
            s.term = highest_foreign_term;
            s.role = Role::Follower;
            s.voted_for = None;
            return Ok(());
        }
        if granted >= quorum {
            drop(s);
            self.become_leader(next_term).await;
        }
        Ok(())
    }

    async fn become_leader(self: &Arc<Self>, term: TermId) {
        {
            let mut s = self.state.lock();
            if s.term != term {
                return;
            }
            s.role = Role::Leader;
            s.leader_addr = self.self_addr.clone();
            s.commit_in_this_term = false;
        }
        for host in self.hosts_snapshot() {
            host.reset();
        }
        info!(part = %self.id_str, term, "elected leader");
        self.state_machine.on_elected(term).await;

        // Immediately assert leadership with a no-op heartbeat round so
        // followers learn of the new term without waiting a full interval.
        self.send_heartbeats().await;
        self.state_machine.on_leader_ready(term).await;
    }

    /// Handle an incoming `AskForVoteRequest` (both pre-vote and formal
    /// rounds share the up-to-date-log check; only the formal round mutates
    /// persistent vote state).
    pub async fn handle_vote_request(self: &Arc<Self>, req: AskForVoteRequest) -> Result<AskForVoteResponse> {
        let mut s = self.state.lock();
        s.last_msg_recv_time = Instant::now();

        if req.term < s.term {
            return Ok(AskForVoteResponse { error_code: ErrorCode::TermOutOfDate, current_term: s.term });
        }

        // A learner never votes (R5), and a candidate outside our peer set
        // isn't a voting member we can grant to.
        if s.role == Role::Learner {
            return Ok(AskForVoteResponse { error_code: ErrorCode::BadState, current_term: s.term });
        }
        let candidate_addr = crate::ids::HostAddr::new(&req.candidate_addr, req.candidate_port);
        if !s.peers.contains(&candidate_addr) {
            return Ok(AskForVoteResponse { error_code: ErrorCode::InvalidPeer, current_term: s.term });
        }

        let candidate_up_to_date = req.last_log_term > s.last_log_term
            || (req.last_log_term == s.last_log_term && req.last_log_id >= s.last_log_id);
        if !candidate_up_to_date {
            return Ok(AskForVoteResponse { error_code: ErrorCode::TermOutOfDate, current_term: s.term });
        }

        if req.is_pre_vote {
            // Pre-vote never mutates persistent state.
            return Ok(AskForVoteResponse { error_code: ErrorCode::Succeeded, current_term: s.term });
        }

        if req.term == s.voted_term && s.voted_for.is_some()
            && s.voted_for.as_ref().map(|a| a.host != req.candidate_addr || a.port != req.candidate_port).unwrap_or(false)
        {
            return Ok(AskForVoteResponse { error_code: ErrorCode::TermOutOfDate, current_term: s.term });
        }

        s.term = req.term;
        s.voted_term = req.term;
        s.voted_for = Some(crate::ids::HostAddr::new(&req.candidate_addr, req.candidate_port));
        s.role = Role::Follower;
        Ok(AskForVoteResponse { error_code: ErrorCode::Succeeded, current_term: s.term })
    }

    pub(crate) async fn send_heartbeats(self: &Arc<Self>) {
        let (term, committed_log_id, last_log_id, self_addr) = {
            let s = self.state.lock();
            if s.role != Role::Leader {
                return;
            }
            (s.term, s.committed_log_id, s.last_log_id, self.self_addr.clone())
        };
        for host in self.hosts_snapshot() {
            let req = crate::transport::HeartbeatRequest {
                space: self.space,
                part: self.part,
                leader_addr: self_addr.host.clone(),
                leader_port: self_addr.port,
                current_term: term,
                committed_log_id,
                last_log_id,
            };
            let start = Instant::now();
            match host.send_heartbeat(req).await {
                Ok(resp) if resp.error_code == ErrorCode::Succeeded => {
                    let mut s = self.state.lock();
                    if s.role == Role::Leader && s.term == term {
                        s.last_msg_accepted_time = Instant::now();
                        s.last_msg_accepted_cost_ms = start.elapsed().as_millis() as u64;
                    }
                }
                Ok(resp) if resp.current_term > term => {
                    self.on_host_observed_higher_term(resp.current_term);
                }
                _ => {}
            }
        }
    }

    pub(crate) fn step_down(self: &Arc<Self>) {
        let mut s = self.state.lock();
        s.role = Role::Follower;
        s.leader_addr = crate::ids::HostAddr::unknown();
    }
}
