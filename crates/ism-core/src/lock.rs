//! Per-index lease locks
//!
//! A lock document names the node driving an index and when its lease runs
//! out. Every change to it is version-checked, so two nodes racing for the
//! same index cannot both win.

use chrono::{DateTime, Utc};
use ism_store::{
    DocKind, DocumentStore, LockDocument, Store, StoreResult, Version, WriteCondition,
};
use ism_util::{NodeId, checked_add};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A held lease; pass it back to renew or release
#[derive(Debug, Clone, PartialEq)]
pub struct LockLease {
    pub index: String,
    pub expires_at: DateTime<Utc>,
    version: Version,
}

/// Acquires, renews and releases lease locks on behalf of one node
pub struct LockService {
    store: Arc<dyn Store>,
    node_id: NodeId,
    duration: Duration,
}

impl LockService {
    pub fn new(store: Arc<dyn Store>, node_id: NodeId, duration: Duration) -> Self {
        Self {
            store,
            node_id,
            duration,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Take the lease on `index`: create it when absent, or take it over once
    /// expired. Returns `None` while any lease is live, this node's included,
    /// or when another node wins a race for it.
    pub fn acquire(&self, index: &str, now: DateTime<Utc>) -> StoreResult<Option<LockLease>> {
        let condition = match self.store.get_lock(index)? {
            None => WriteCondition::Create,
            Some(existing) if existing.value.is_expired(now) => WriteCondition::Match(existing.version),
            Some(existing) => {
                debug!(
                    index = %index,
                    holder = %existing.value.holder,
                    expires_at = %existing.value.expires_at,
                    "Lock held"
                );
                return Ok(None);
            }
        };

        self.write(index, now, now, condition)
    }

    /// Extend a held lease. Returns `false` when the lease was lost.
    pub fn renew(&self, lease: &mut LockLease, now: DateTime<Utc>) -> StoreResult<bool> {
        let acquired_at = match self.store.get_lock(&lease.index)? {
            Some(current) if current.version == lease.version => current.value.acquired_at,
            _ => return Ok(false),
        };

        match self.write(&lease.index, acquired_at, now, WriteCondition::Match(lease.version))? {
            Some(renewed) => {
                *lease = renewed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Give up a lease. A lease that was already taken over is left alone.
    pub fn release(&self, lease: &LockLease) -> StoreResult<()> {
        match self
            .store
            .delete_document(DocKind::Lock, &lease.index, Some(lease.version))
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(index = %lease.index, "Lock was taken over before release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write(
        &self,
        index: &str,
        acquired_at: DateTime<Utc>,
        now: DateTime<Utc>,
        condition: WriteCondition,
    ) -> StoreResult<Option<LockLease>> {
        let expires_at = checked_add(now, self.duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let lock = LockDocument::new(index, self.node_id.clone(), acquired_at, expires_at);

        match self.store.put_lock(&lock, condition) {
            Ok(version) => Ok(Some(LockLease {
                index: index.to_string(),
                expires_at,
                version,
            })),
            Err(e) if e.is_conflict() => {
                debug!(index = %index, node = %self.node_id, "Lost race for lock");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
