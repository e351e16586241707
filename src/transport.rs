//! Wire message shapes and the external RPC transport collaborator.
//! `RaftTransport` is an `async_trait` the core calls against without
//! knowing or caring how bytes cross the wire — framing itself is handled
//! by the embedder.

use crate::error::ErrorCode;
use crate::ids::{ClusterId, GraphSpaceId, HostAddr, LogId, PartitionId, TermId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single log entry as carried on the wire inside an `AppendLogRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLogEntry {
    pub cluster: ClusterId,
    pub log_str: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForVoteRequest {
    pub space: GraphSpaceId,
    pub part: PartitionId,
    pub candidate_addr: String,
    pub candidate_port: u16,
    pub term: TermId,
    pub last_log_id: LogId,
    pub last_log_term: TermId,
    pub is_pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForVoteResponse {
    pub error_code: ErrorCode,
    pub current_term: TermId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogRequest {
    pub space: GraphSpaceId,
    pub part: PartitionId,
    pub leader_addr: String,
    pub leader_port: u16,
    pub current_term: TermId,
    pub last_log_id: LogId,
    pub committed_log_id: LogId,
    pub last_log_term_sent: TermId,
    pub last_log_id_sent: LogId,
    pub log_term: TermId,
    pub log_str_list: Vec<WireLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogResponse {
    pub error_code: ErrorCode,
    pub current_term: TermId,
    pub leader_addr: String,
    pub leader_port: u16,
    pub committed_log_id: LogId,
    pub last_matched_log_id: LogId,
    pub last_matched_log_term: TermId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub space: GraphSpaceId,
    pub part: PartitionId,
    pub leader_addr: String,
    pub leader_port: u16,
    pub current_term: TermId,
    pub last_log_id: LogId,
    pub committed_log_id: LogId,
    pub last_log_term_sent: TermId,
    pub last_log_id_sent: LogId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub error_code: ErrorCode,
    pub current_term: TermId,
    pub leader_addr: String,
    pub leader_port: u16,
    pub committed_log_id: LogId,
    pub last_log_id: LogId,
    pub last_log_term: TermId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSnapshotRequest {
    pub space: GraphSpaceId,
    pub part: PartitionId,
    pub current_term: TermId,
    pub committed_log_id: LogId,
    pub committed_log_term: TermId,
    pub leader_addr: String,
    pub leader_port: u16,
    pub rows: Vec<Vec<u8>>,
    pub total_size: u64,
    pub total_count: u64,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSnapshotResponse {
    pub error_code: ErrorCode,
    pub current_term: TermId,
}

/// The narrow interface the core calls against to reach one remote
/// replica. Framing, connection pooling and retries below the RPC-timeout
/// level belong to the implementor, not to this crate.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn ask_for_vote(
        &self,
        to: &HostAddr,
        req: AskForVoteRequest,
    ) -> crate::error::Result<AskForVoteResponse>;

    async fn append_log(
        &self,
        to: &HostAddr,
        req: AppendLogRequest,
    ) -> crate::error::Result<AppendLogResponse>;

    async fn heartbeat(
        &self,
        to: &HostAddr,
        req: HeartbeatRequest,
    ) -> crate::error::Result<HeartbeatResponse>;

    async fn send_snapshot(
        &self,
        to: &HostAddr,
        req: SendSnapshotRequest,
    ) -> crate::error::Result<SendSnapshotResponse>;
}
