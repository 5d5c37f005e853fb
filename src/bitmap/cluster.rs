//! Per-node cluster bookkeeping (§3.1 supplement, §5): `avail_bitmap` and
//! the reclaim vector the cluster lock's CR/PW grants drive. Gated behind
//! `nodes > 1` exactly as the Open Question in spec.md §9 instructs --
//! single-node callers never touch this module.
use std::sync::Mutex;

use crate::host::LockMode;

/// A node's last-known availability, as tracked by its `CR` lock grant.
/// `avail_bitmap[i] == -1` in the original source becomes `Unknown` here
/// instead of a sentinel integer (§9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAvail {
    Unknown,
    Available,
    Unavailable,
}

/// State of an in-progress reclaim (a `bast` downgrade request demanding a
/// node give back its `PW`/`EX` grant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimState {
    Idle,
    Requested { demanded: DemandedMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandedMode {
    ProtectedWrite,
    Exclusive,
}

impl From<LockMode> for DemandedMode {
    fn from(mode: LockMode) -> Self {
        match mode {
            LockMode::ProtectedWrite => DemandedMode::ProtectedWrite,
            LockMode::Exclusive => DemandedMode::Exclusive,
            LockMode::Concurrent => DemandedMode::ProtectedWrite,
        }
    }
}

/// Guarded by `avail_mutex` / `reclaim_mutex` in the spec (§5). Only
/// populated (`Vec::resize`d past zero) when the superblock reports
/// `nodes > 1`; for the common single-node case both vectors stay empty and
/// every method below is a cheap no-op.
pub struct ClusterNodes {
    avail: Mutex<Vec<NodeAvail>>,
    reclaim: Mutex<Vec<ReclaimState>>,
}

impl ClusterNodes {
    pub fn new(nodes: u32) -> Self {
        let n = if nodes > 1 { nodes as usize } else { 0 };
        Self {
            avail: Mutex::new(vec![NodeAvail::Unknown; n]),
            reclaim: Mutex::new(vec![ReclaimState::Idle; n]),
        }
    }

    pub fn node_count(&self) -> usize {
        self.avail.lock().unwrap().len()
    }

    /// Delivered from a `ClusterLock`'s `ast` callback for a `CR` grant on
    /// node `id`.
    pub fn mark_available(&self, id: usize) {
        if let Some(slot) = self.avail.lock().unwrap().get_mut(id) {
            *slot = NodeAvail::Available;
        }
    }

    pub fn mark_unavailable(&self, id: usize) {
        if let Some(slot) = self.avail.lock().unwrap().get_mut(id) {
            *slot = NodeAvail::Unavailable;
        }
    }

    pub fn availability(&self, id: usize) -> NodeAvail {
        self.avail
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(NodeAvail::Unknown)
    }

    /// Count of nodes known to be available; the per-node `events[]` slots
    /// `update_sb` stamps are limited to this set (§3.1).
    pub fn available_count(&self) -> usize {
        self.avail
            .lock()
            .unwrap()
            .iter()
            .filter(|a| **a == NodeAvail::Available)
            .count()
    }

    /// Delivered from a `ClusterLock`'s `bast` callback: node `id` is being
    /// asked to downgrade/release so another node can acquire `demanded`.
    pub fn request_reclaim(&self, id: usize, demanded: LockMode) {
        if let Some(slot) = self.reclaim.lock().unwrap().get_mut(id) {
            *slot = ReclaimState::Requested {
                demanded: demanded.into(),
            };
        }
    }

    pub fn clear_reclaim(&self, id: usize) {
        if let Some(slot) = self.reclaim.lock().unwrap().get_mut(id) {
            *slot = ReclaimState::Idle;
        }
    }

    pub fn reclaim_state(&self, id: usize) -> ReclaimState {
        self.reclaim
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(ReclaimState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_configuration_is_inert() {
        let nodes = ClusterNodes::new(1);
        assert_eq!(nodes.node_count(), 0);
        assert_eq!(nodes.availability(0), NodeAvail::Unknown);
    }

    #[test]
    fn multi_node_tracks_availability_independently() {
        let nodes = ClusterNodes::new(3);
        assert_eq!(nodes.node_count(), 3);
        nodes.mark_available(0);
        nodes.mark_available(2);
        nodes.mark_unavailable(1);
        assert_eq!(nodes.availability(0), NodeAvail::Available);
        assert_eq!(nodes.availability(1), NodeAvail::Unavailable);
        assert_eq!(nodes.availability(2), NodeAvail::Available);
        assert_eq!(nodes.available_count(), 2);
    }

    #[test]
    fn reclaim_request_and_clear_round_trip() {
        let nodes = ClusterNodes::new(2);
        assert_eq!(nodes.reclaim_state(0), ReclaimState::Idle);
        nodes.request_reclaim(0, LockMode::Exclusive);
        assert_eq!(
            nodes.reclaim_state(0),
            ReclaimState::Requested {
                demanded: DemandedMode::Exclusive
            }
        );
        nodes.clear_reclaim(0);
        assert_eq!(nodes.reclaim_state(0), ReclaimState::Idle);
    }
}
