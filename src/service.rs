//! `(space, part) -> RaftPart` registry, using short,
//! never-held-across-I/O critical sections.

use crate::error::{RaftError, Result};
use crate::ids::{GraphSpaceId, PartitionId};
use crate::part::RaftPart;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes inbound RPCs to the right partition and lets an embedder add or
/// remove partitions as the cluster's assignment changes. Holds no state
/// beyond the map itself; the lock is taken only to look up or mutate an
/// entry, never across an RPC or disk write.
#[derive(Default)]
pub struct RaftService {
    parts: RwLock<HashMap<(GraphSpaceId, PartitionId), Arc<RaftPart>>>,
}

impl RaftService {
    pub fn new() -> Self {
        RaftService { parts: RwLock::new(HashMap::new()) }
    }

    /// Register a partition, starting its background tasks. Replaces any
    /// existing entry for the same `(space, part)`.
    pub fn add_part(&self, part: Arc<RaftPart>) {
        part.start();
        self.parts.write().insert((part.space, part.part), part);
    }

    /// Remove and stop a partition, if present.
    pub async fn remove_part(&self, space: GraphSpaceId, part: PartitionId) {
        let removed = self.parts.write().remove(&(space, part));
        if let Some(p) = removed {
            p.stop().await;
        }
    }

    pub fn get_part(&self, space: GraphSpaceId, part: PartitionId) -> Result<Arc<RaftPart>> {
        self.parts.read().get(&(space, part)).cloned().ok_or(RaftError::UnknownPart)
    }

    pub fn all_parts(&self) -> Vec<Arc<RaftPart>> {
        self.parts.read().values().cloned().collect()
    }

    /// Stop every registered partition, draining in-flight RPCs on each.
    pub async fn stop_all(&self) {
        let parts: Vec<Arc<RaftPart>> = self.parts.read().values().cloned().collect();
        for p in &parts {
            p.stop().await;
        }
        self.parts.write().clear();
    }
}
