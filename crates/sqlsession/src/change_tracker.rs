//! Snapshot-based dirty checking.
//!
//! A snapshot is taken when an entity enters the session (load or
//! insert) and compared field-by-field at flush. An entity with no
//! snapshot is conservatively treated as dirty so detached instances
//! saved into the session still get written.

use std::collections::HashMap;
use std::time::Instant;

use sqlsession_core::{Result, Value};

use crate::identity_map::EntityKey;

/// Serialized image of an entity's column/value pairs.
#[derive(Debug, Clone)]
pub struct Snapshot {
    data: Vec<u8>,
    taken_at: Instant,
}

impl Snapshot {
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

fn encode(row: &[(&'static str, Value)]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

/// Tracks load-time snapshots for every managed entity.
#[derive(Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityKey, Snapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the snapshot for a key.
    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn snapshot(&mut self, key: EntityKey, row: &[(&'static str, Value)]) -> Result<()> {
        let data = encode(row)?;
        self.snapshots.insert(
            key,
            Snapshot {
                data,
                taken_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn has_snapshot(&self, key: &EntityKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Whether the current row differs from the snapshot. No snapshot
    /// means dirty.
    pub fn is_dirty(&self, key: &EntityKey, current: &[(&'static str, Value)]) -> bool {
        match self.snapshots.get(key) {
            Some(snapshot) => match encode(current) {
                Ok(data) => data != snapshot.data,
                Err(_) => true,
            },
            None => true,
        }
    }

    /// Column names whose values differ from the snapshot, in row
    /// order. With no snapshot, every column is reported changed.
    pub fn changed_fields(
        &self,
        key: &EntityKey,
        current: &[(&'static str, Value)],
    ) -> Vec<&'static str> {
        let Some(snapshot) = self.snapshots.get(key) else {
            return current.iter().map(|(c, _)| *c).collect();
        };
        let Ok(old) = serde_json::from_slice::<Vec<(String, serde_json::Value)>>(&snapshot.data)
        else {
            return current.iter().map(|(c, _)| *c).collect();
        };
        let mut changed = Vec::new();
        for (column, value) in current {
            let old_value = old.iter().find(|(c, _)| c == column).map(|(_, v)| v);
            let new_value = serde_json::to_value(value).ok();
            match (old_value, new_value) {
                (Some(o), Some(n)) if *o == n => {}
                _ => changed.push(*column),
            }
        }
        changed
    }

    /// Drop the snapshot for a key (entity left the session).
    pub fn forget(&mut self, key: &EntityKey) {
        self.snapshots.remove(key);
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestTask;
    use sqlsession_core::Entity;

    fn key(id: i64) -> EntityKey {
        EntityKey::of::<TestTask>(&Value::BigInt(id))
    }

    #[test]
    fn clean_after_snapshot() {
        let mut tracker = ChangeTracker::new();
        let task = TestTask::with_id(1, "title");
        tracker.snapshot(key(1), &task.to_row()).unwrap();
        assert!(!tracker.is_dirty(&key(1), &task.to_row()));
        assert!(tracker.changed_fields(&key(1), &task.to_row()).is_empty());
    }

    #[test]
    fn mutation_is_detected_per_field() {
        let mut tracker = ChangeTracker::new();
        let mut task = TestTask::with_id(1, "title");
        tracker.snapshot(key(1), &task.to_row()).unwrap();
        task.finished = true;
        assert!(tracker.is_dirty(&key(1), &task.to_row()));
        assert_eq!(tracker.changed_fields(&key(1), &task.to_row()), vec!["finished"]);
    }

    #[test]
    fn no_snapshot_means_dirty() {
        let tracker = ChangeTracker::new();
        let task = TestTask::with_id(1, "title");
        assert!(tracker.is_dirty(&key(1), &task.to_row()));
        let changed = tracker.changed_fields(&key(1), &task.to_row());
        assert_eq!(changed.len(), task.to_row().len());
    }

    #[test]
    fn refresh_resets_baseline() {
        let mut tracker = ChangeTracker::new();
        let mut task = TestTask::with_id(1, "title");
        tracker.snapshot(key(1), &task.to_row()).unwrap();
        task.title = "renamed".to_string();
        assert!(tracker.is_dirty(&key(1), &task.to_row()));
        tracker.snapshot(key(1), &task.to_row()).unwrap();
        assert!(!tracker.is_dirty(&key(1), &task.to_row()));
    }

    #[test]
    fn forget_drops_snapshot() {
        let mut tracker = ChangeTracker::new();
        let task = TestTask::with_id(1, "title");
        tracker.snapshot(key(1), &task.to_row()).unwrap();
        tracker.forget(&key(1));
        assert!(tracker.is_empty());
        assert!(tracker.is_dirty(&key(1), &task.to_row()));
    }
}
