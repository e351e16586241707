//! Single-server membership change: configuration changes travel as a
//! regular log entry, one member at a time (no joint consensus).
//!
//! A `MembershipCommand` is carried as the payload of a `LogType::Command`
//! entry. `apply_membership_preprocess` decodes it and mutates the in-memory
//! peer/learner set immediately — both when the leader appends it and when a
//! follower (or a restarting replica replaying its WAL) sees it — so the
//! config that governs quorum for *this very entry's own replication* is
//! already in effect. `finalize_membership_commit` runs the leader-only
//! side effects that must wait for the change to actually commit
//! (self-removal, leadership transfer) so a later rollback can't strand the
//! partition in a state it never durably reached.

use super::{RaftPart, Role};
use crate::ids::HostAddr;
use crate::wal::record::LogEntry;
use bincode::{Decode, Encode};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub(crate) enum MembershipCommand {
    AddLearner(WireAddr),
    AddPeer(WireAddr),
    RemovePeer(WireAddr),
    TransferLeader(WireAddr),
}

/// `bincode::Encode`/`Decode` companion for [`HostAddr`] (which only derives
/// `serde`, used on the wire-message structs, not `bincode::Encode`).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub(crate) struct WireAddr {
    pub host: String,
    pub port: u16,
}

impl From<HostAddr> for WireAddr {
    fn from(a: HostAddr) -> Self {
        WireAddr { host: a.host, port: a.port }
    }
}

impl From<WireAddr> for HostAddr {
    fn from(a: WireAddr) -> Self {
        HostAddr::new(a.host, a.port)
    }
}

pub(crate) fn encode(cmd: &MembershipCommand) -> Vec<u8> {
    bincode::encode_to_vec(cmd, bincode::config::standard())
        .expect("MembershipCommand encoding is infallible")
}

/// Best-effort decode: most COMMAND payloads in a general deployment would
/// in fact all be membership commands (this core defines no other COMMAND
/// kind), but decoding defensively lets a future payload kind coexist
/// without corrupting replay.
pub(crate) fn decode(payload: &[u8]) -> Option<MembershipCommand> {
    bincode::decode_from_slice(payload, bincode::config::standard())
        .ok()
        .map(|(cmd, _)| cmd)
}

impl RaftPart {
    pub async fn add_learner_async(self: &Arc<Self>, addr: HostAddr) -> crate::error::Result<()> {
        self.send_command_async(crate::ids::DEFAULT_CLUSTER_ID, encode(&MembershipCommand::AddLearner(addr.into())))
            .await
    }

    pub async fn add_peer_async(self: &Arc<Self>, addr: HostAddr) -> crate::error::Result<()> {
        self.send_command_async(crate::ids::DEFAULT_CLUSTER_ID, encode(&MembershipCommand::AddPeer(addr.into())))
            .await
    }

    pub async fn remove_peer_async(self: &Arc<Self>, addr: HostAddr) -> crate::error::Result<()> {
        self.send_command_async(crate::ids::DEFAULT_CLUSTER_ID, encode(&MembershipCommand::RemovePeer(addr.into())))
            .await
    }

    /// Leadership transfer. Replicates like any other COMMAND; the actual
    /// step-down/election-kick happens once it commits
    /// (`finalize_membership_commit`).
    pub async fn transfer_leader_async(self: &Arc<Self>, target: HostAddr) -> crate::error::Result<()> {
        self.send_command_async(crate::ids::DEFAULT_CLUSTER_ID, encode(&MembershipCommand::TransferLeader(target.into())))
            .await
    }

    /// Called on every successful append (leader side) and on every WAL
    /// replay record. Mutates the peer/learner set in place; callers are
    /// responsible for rebuilding the `Host` map afterward (batched by the
    /// caller, not per-entry, during WAL replay).
    pub(crate) fn apply_membership_preprocess_decoded(&self, cmd: &MembershipCommand) -> bool {
        let mut s = self.state.lock();
        match cmd {
            MembershipCommand::AddLearner(addr) => {
                let addr: HostAddr = addr.clone().into();
                s.peers.remove(&addr);
                s.learners.insert(addr)
            }
            MembershipCommand::AddPeer(addr) => {
                let addr: HostAddr = addr.clone().into();
                s.learners.remove(&addr);
                s.peers.insert(addr)
            }
            MembershipCommand::RemovePeer(addr) => {
                let addr: HostAddr = addr.clone().into();
                let a = s.peers.remove(&addr);
                let b = s.learners.remove(&addr);
                a || b
            }
            MembershipCommand::TransferLeader(_) => false,
        }
    }

    /// Entry point used by the append path; decodes `entry.payload` and, if
    /// it is a membership command, applies it and rebuilds the `Host`
    /// pipeline map so quorum for subsequent replication already reflects
    /// the change.
    pub(crate) fn apply_membership_preprocess(self: &Arc<Self>, entry: &LogEntry) {
        let Some(cmd) = decode(&entry.payload) else { return };
        if self.apply_membership_preprocess_decoded(&cmd) {
            self.rebuild_hosts();
        }
    }

    /// Re-derive the peer/learner set from every COMMAND-shaped payload
    /// already on disk, run once at construction.
    pub(crate) fn replay_membership_commands(self: &Arc<Self>) {
        let last = self.wal.last_log_id();
        if last == 0 {
            return;
        }
        let Ok(iter) = self.wal.iterator(1, last) else { return };
        let mut changed = false;
        for entry in iter {
            if let Some(cmd) = decode(&entry.payload) {
                changed |= self.apply_membership_preprocess_decoded(&cmd);
            }
        }
        if changed {
            self.rebuild_hosts();
        }
    }

    /// Leader-only side effects that must wait for the COMMAND to actually
    /// commit, since an uncommitted entry can still be rolled back by a new
    /// leader.
    pub(crate) async fn finalize_membership_commit(self: &Arc<Self>, entry: &LogEntry) {
        let Some(cmd) = decode(&entry.payload) else { return };
        match cmd {
            MembershipCommand::RemovePeer(addr) => {
                let addr: HostAddr = addr.into();
                if addr == self.self_addr {
                    info!(part = %self.id_str, "self removed from peer set, stepping down");
                    self.step_down();
                }
            }
            MembershipCommand::TransferLeader(target) => {
                let target: HostAddr = target.into();
                let (role, is_target) = {
                    let s = self.state.lock();
                    (s.role, target == self.self_addr)
                };
                if is_target && role == Role::Follower {
                    info!(part = %self.id_str, "leadership transfer target, starting election immediately");
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ = this.run_vote_round_no_prevote().await;
                    });
                } else if role == Role::Leader && !is_target {
                    info!(part = %self.id_str, target = %target, "transferring leadership, stepping down");
                    self.step_down();
                }
            }
            // ADD_LEARNER / ADD_PEER's set mutation already landed at
            // preprocess time; no further action needed once committed.
            MembershipCommand::AddLearner(_) | MembershipCommand::AddPeer(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let cmd = MembershipCommand::AddPeer(WireAddr { host: "h".into(), port: 1 });
        let bytes = encode(&cmd);
        assert_eq!(decode(&bytes), Some(cmd));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode(b"not a membership command at all, much too long to be a header"), None);
    }
}
