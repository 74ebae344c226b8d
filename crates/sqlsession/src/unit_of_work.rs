//! Unit of work: pending inserts, dirty candidates, and removals.
//!
//! The unit of work records *what* changed in program order; the flush
//! coordinator decides the SQL. Entities removed here are fenced off:
//! any further save or delete against them fails fast, client-side,
//! before any statement is issued.

use std::collections::HashSet;

use sqlsession_core::{Error, Result, Value};

use crate::change_tracker::ChangeTracker;
use crate::identity_map::EntityKey;

/// A scheduled DELETE, captured at registration time so the statement
/// can still be built after the entity leaves the identity map.
#[derive(Debug, Clone)]
pub struct PendingDelete {
    pub key: EntityKey,
    pub table: &'static str,
    pub pk_column: &'static str,
    pub version_column: &'static str,
    pub pk: Value,
    pub version: i64,
}

/// Counts of pending work, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingCounts {
    pub new: usize,
    pub dirty: usize,
    pub removed: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.removed
    }
}

/// Tracks pending changes for one transaction.
#[derive(Default)]
pub struct UnitOfWork {
    insertions: Vec<EntityKey>,
    removals: Vec<PendingDelete>,
    removed_keys: HashSet<EntityKey>,
    tracker: ChangeTracker,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity for INSERT at the next flush.
    pub fn register_new(&mut self, key: EntityKey, table: &'static str) -> Result<()> {
        self.guard_not_removed(&key, table, "save")?;
        if self.insertions.contains(&key) {
            return Err(Error::invalid_state(format!(
                "entity already queued for insert: [{table}]"
            )));
        }
        self.insertions.push(key);
        Ok(())
    }

    /// Record a dirty candidate. Dirtiness itself is decided at flush
    /// by snapshot comparison; this only validates entity state.
    pub fn register_dirty(&mut self, key: EntityKey, table: &'static str) -> Result<()> {
        self.guard_not_removed(&key, table, "save")
    }

    /// Schedule a DELETE. The entity is fenced off from further
    /// operations in this unit of work.
    #[tracing::instrument(level = "trace", skip(self, pending), fields(table = pending.table))]
    pub fn register_removed(&mut self, pending: PendingDelete) -> Result<()> {
        let key = pending.key.clone();
        self.guard_not_removed(&key, pending.table, "delete")?;
        self.removed_keys.insert(key.clone());
        // save-then-delete before any flush: nothing was ever
        // persisted, so drop the queued INSERT and skip the DELETE.
        if let Some(pos) = self.insertions.iter().position(|k| *k == key) {
            self.insertions.remove(pos);
            self.tracker.forget(&key);
            return Ok(());
        }
        self.removals.push(pending);
        Ok(())
    }

    pub fn is_removed(&self, key: &EntityKey) -> bool {
        self.removed_keys.contains(key)
    }

    pub fn is_queued_for_insert(&self, key: &EntityKey) -> bool {
        self.insertions.contains(key)
    }

    /// Fail fast when the target was already removed in this unit of
    /// work. The identity is reported as `<null>` because a removed
    /// entity no longer has a persistent identity here.
    pub fn guard_not_removed(
        &self,
        key: &EntityKey,
        table: &'static str,
        operation: &str,
    ) -> Result<()> {
        if self.is_removed(key) {
            return Err(Error::invalid_state(format!(
                "removed entity passed to {operation}: [{table}#<null>]"
            )));
        }
        Ok(())
    }

    pub fn insertions(&self) -> &[EntityKey] {
        &self.insertions
    }

    pub fn removals(&self) -> &[PendingDelete] {
        &self.removals
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    /// Clear the insert/delete queues after a successful flush,
    /// keeping snapshots and the removed-key fence (the fence lasts
    /// until the transaction ends).
    pub fn clear_flushed(&mut self) {
        self.insertions.clear();
        self.removals.clear();
    }

    /// Drop all bookkeeping for the given keys (bulk cache
    /// invalidation).
    pub fn evict_keys(&mut self, keys: &[EntityKey]) {
        self.insertions.retain(|k| !keys.contains(k));
        self.removals.retain(|p| !keys.contains(&p.key));
        for key in keys {
            self.tracker.forget(key);
        }
    }

    /// Tear down everything at transaction end.
    pub fn clear(&mut self) {
        self.insertions.clear();
        self.removals.clear();
        self.removed_keys.clear();
        self.tracker.clear();
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.insertions.is_empty() || !self.removals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestTask;
    use sqlsession_core::Entity;

    fn pending(id: i64) -> PendingDelete {
        PendingDelete {
            key: EntityKey::of::<TestTask>(&Value::BigInt(id)),
            table: TestTask::TABLE,
            pk_column: TestTask::PRIMARY_KEY,
            version_column: TestTask::VERSION_COLUMN,
            pk: Value::BigInt(id),
            version: 0,
        }
    }

    #[test]
    fn double_delete_fails_fast() {
        let mut uow = UnitOfWork::new();
        uow.register_removed(pending(1)).unwrap();
        let err = uow.register_removed(pending(1)).unwrap_err();
        let Error::InvalidState(inner) = &err else {
            panic!("expected invalid state, got {err:?}");
        };
        assert_eq!(inner.message, "removed entity passed to delete: [task#<null>]");
        // Only one DELETE is scheduled.
        assert_eq!(uow.removals().len(), 1);
    }

    #[test]
    fn save_after_delete_fails_fast() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::of::<TestTask>(&Value::BigInt(1));
        uow.register_removed(pending(1)).unwrap();
        let err = uow.register_dirty(key.clone(), TestTask::TABLE).unwrap_err();
        assert!(err.to_string().contains("removed entity passed to save"));
        assert!(uow.register_new(key, TestTask::TABLE).is_err());
    }

    #[test]
    fn delete_of_unflushed_insert_cancels_both() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::of::<TestTask>(&Value::BigInt(7));
        uow.register_new(key.clone(), TestTask::TABLE).unwrap();
        uow.register_removed(pending(7)).unwrap();
        assert!(uow.insertions().is_empty());
        assert!(uow.removals().is_empty());
        assert!(uow.is_removed(&key));
    }

    #[test]
    fn removed_fence_survives_flush() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::of::<TestTask>(&Value::BigInt(3));
        uow.register_removed(pending(3)).unwrap();
        uow.clear_flushed();
        assert!(uow.is_removed(&key));
        assert!(uow.register_dirty(key, TestTask::TABLE).is_err());
    }

    #[test]
    fn clear_resets_everything() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::of::<TestTask>(&Value::BigInt(3));
        uow.register_removed(pending(3)).unwrap();
        uow.clear();
        assert!(!uow.is_removed(&key));
        assert!(!uow.has_pending_writes());
    }
}
