//! Identifier types shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Strictly increasing per partition, starting at 1. 0 means "no log".
pub type LogId = i64;

/// Strictly non-decreasing per replica across its lifetime. 0 is the initial term.
pub type TermId = i64;

/// Tags the origin cluster of a log entry. Within a single cluster, a fixed positive default.
pub type ClusterId = i64;

/// Scopes the partition; unused by the protocol except for routing messages
/// between partitions that share a transport.
pub type GraphSpaceId = i32;
pub type PartitionId = i32;

/// A term value meaning "no term recorded for this log id".
pub const INVALID_TERM: TermId = -1;

/// The default cluster id used when cross-cluster replication is not in play.
pub const DEFAULT_CLUSTER_ID: ClusterId = 0;

/// A host address: `(host, port)`. `("", 0)` is the canonical unknown/null address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostAddr { host: host.into(), port }
    }

    /// The canonical "unknown/null" address.
    pub fn unknown() -> Self {
        HostAddr { host: String::new(), port: 0 }
    }

    pub fn is_unknown(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

impl Default for HostAddr {
    fn default() -> Self {
        HostAddr::unknown()
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
