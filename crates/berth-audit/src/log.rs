//! The per-owner bounded activity ring.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use berth_core::OwnerId;
use tokio::sync::broadcast;
use tracing::trace;

use crate::entry::ActivityEntry;

/// Default entries retained per owner.
pub const DEFAULT_RING_CAPACITY: usize = 500;

/// Broadcast channel capacity for appended entries.
const BROADCAST_CAPACITY: usize = 256;

/// Append-only activity log with bounded per-owner retention.
///
/// Cheaply cloneable; all clones share the same rings and broadcast
/// channel. The lock is only held for synchronous push/snapshot sections.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    rings: Arc<RwLock<HashMap<OwnerId, VecDeque<ActivityEntry>>>>,
    capacity: usize,
    sender: broadcast::Sender<ActivityEntry>,
}

impl ActivityLog {
    /// Create a log with the default per-owner capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    /// Create a log retaining at most `capacity` entries per owner.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            rings: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            sender,
        }
    }

    /// Append an entry, evicting the oldest when the owner's ring is full,
    /// and broadcast it to subscribers.
    pub fn append(&self, entry: ActivityEntry) {
        if let Ok(mut rings) = self.rings.write() {
            let ring = rings.entry(entry.owner_id).or_default();
            if ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        trace!(owner = %entry.owner_id, kind = ?entry.kind, "activity appended");
        // No subscribers is fine.
        let _ = self.sender.send(entry);
    }

    /// The owner's most recent entries, newest first, up to `limit`.
    #[must_use]
    pub fn recent(&self, owner_id: OwnerId, limit: usize) -> Vec<ActivityEntry> {
        self.rings
            .read()
            .map(|rings| {
                rings
                    .get(&owner_id)
                    .map(|ring| ring.iter().rev().take(limit).cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Subscribe to appended entries (all owners; the router filters).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEntry> {
        self.sender.subscribe()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ActivityKind;
    use berth_proto::ReportStatus;

    fn entry(owner: OwnerId, n: usize) -> ActivityEntry {
        ActivityEntry::new(
            owner,
            None,
            ActivityKind::Deploy,
            ReportStatus::Info,
            serde_json::json!({ "n": n }),
        )
    }

    #[test]
    fn ring_is_bounded_and_newest_first() {
        let log = ActivityLog::with_capacity(3);
        let owner = OwnerId::new();
        for n in 0..5 {
            log.append(entry(owner, n));
        }

        let recent = log.recent(owner, 10);
        assert_eq!(recent.len(), 3);
        let ns: Vec<u64> = recent
            .iter()
            .map(|e| e.details["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![4, 3, 2]);
    }

    #[test]
    fn owners_are_isolated() {
        let log = ActivityLog::new();
        let a = OwnerId::new();
        let b = OwnerId::new();
        log.append(entry(a, 1));

        assert_eq!(log.recent(a, 10).len(), 1);
        assert!(log.recent(b, 10).is_empty());
    }

    #[tokio::test]
    async fn appends_are_broadcast() {
        let log = ActivityLog::new();
        let mut rx = log.subscribe();
        let owner = OwnerId::new();
        log.append(entry(owner, 7));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.owner_id, owner);
        assert_eq!(got.details["n"], 7);
    }
}
