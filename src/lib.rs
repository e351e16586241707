//! Raft consensus core for a replicated partition.
//!
//! Three subsystems, built bottom-up: the file-based [`wal`] (append-only
//! log with buffering, a dedicated flusher thread, and random-access
//! iteration), the per-peer [`host`] replication pipeline, and [`part`]'s
//! `RaftPart` — the replication state machine tying roles, terms, votes,
//! the append pipeline, and membership changes together. [`snapshot`]
//! catches up a replica whose WAL prefix the leader has already compacted
//! away. The RPC transport and the application's own durable state are
//! external collaborators reached through the [`transport::RaftTransport`]
//! and [`state_machine::StateMachine`] traits.

pub mod config;
pub mod error;
pub mod host;
pub mod ids;
pub mod part;
pub mod service;
pub mod snapshot;
pub mod state_machine;
#[cfg(test)]
pub(crate) mod testkit;
pub mod transport;
pub mod wal;

pub use config::{RaftConfig, WalPolicy};
pub use error::{ErrorCode, RaftError, Result};
pub use host::Host;
pub use ids::{ClusterId, GraphSpaceId, HostAddr, LogId, PartitionId, TermId, DEFAULT_CLUSTER_ID, INVALID_TERM};
pub use part::{RaftPart, Role, Status};
pub use service::RaftService;
pub use snapshot::{SnapshotManager, SnapshotReceiver, SnapshotSource};
pub use state_machine::{CommitOutcome, StateMachine};
pub use transport::RaftTransport;
pub use wal::record::{LogEntry, LogType};
pub use wal::Wal;
