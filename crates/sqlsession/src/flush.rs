//! Flush coordination: pending changes to ordered, version-checked SQL.
//!
//! Statement order is INSERT, then UPDATE, then DELETE, so new rows
//! exist before anything references them and removals cannot shadow a
//! pending write. Every UPDATE and DELETE carries
//! `WHERE <pk> = ? AND <version> = ?`; zero rows affected means the
//! stored version moved under us and the flush aborts with an
//! optimistic-lock failure before any later statement runs.

use asupersync::{Cx, Outcome};
use sqlsession_core::{Connection, Dialect, Error, QueryErrorKind, Result, Value};

use crate::change_tracker::ChangeTracker;
use crate::identity_map::{EntityKey, IdentityMap};
use crate::unit_of_work::UnitOfWork;

/// Version-check metadata for one statement.
#[derive(Debug, Clone)]
pub(crate) struct VersionCheck {
    pub table: &'static str,
    pub pk: Value,
    pub expected: i64,
}

/// One rendered statement in the plan.
#[derive(Debug, Clone)]
pub(crate) struct PlannedStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Present on version-checked statements; zero rows affected is a
    /// conflict on this entity.
    pub check: Option<VersionCheck>,
    /// In-memory version to apply to this key once the whole plan
    /// succeeds.
    pub bump: Option<(EntityKey, i64)>,
}

/// An ordered, rendered flush.
#[derive(Default)]
pub(crate) struct FlushPlan {
    pub inserts: Vec<PlannedStatement>,
    pub updates: Vec<PlannedStatement>,
    pub deletes: Vec<PlannedStatement>,
    /// Keys to re-snapshot after success (inserted and updated).
    pub snapshot_keys: Vec<EntityKey>,
    /// Keys whose entities left storage; evicted by the session.
    pub delete_keys: Vec<EntityKey>,
}

impl FlushPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub(crate) fn statement_count(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Render the plan from the current session state.
    pub(crate) fn build(dialect: Dialect, map: &IdentityMap, uow: &UnitOfWork) -> Result<Self> {
        let mut plan = FlushPlan::default();
        let tracker = uow.tracker();

        for key in uow.insertions() {
            let Some(tracked) = map.tracked(key) else {
                return Err(Error::invalid_state(
                    "entity queued for insert is no longer managed".to_string(),
                ));
            };
            let row = tracked.current_row();
            let columns: Vec<String> = row.iter().map(|(c, _)| format!("\"{c}\"")).collect();
            let placeholders: Vec<String> =
                (1..=row.len()).map(|i| dialect.placeholder(i)).collect();
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                tracked.table(),
                columns.join(", "),
                placeholders.join(", ")
            );
            plan.inserts.push(PlannedStatement {
                sql,
                params: row.into_iter().map(|(_, v)| v).collect(),
                check: None,
                bump: None,
            });
            plan.snapshot_keys.push(key.clone());
        }

        // Dirty scan over everything managed, skipping rows that are
        // being inserted or removed in this same flush. Sorted for
        // deterministic statement order.
        let mut candidates: Vec<(EntityKey, &dyn crate::identity_map::Tracked)> = map
            .iter_tracked()
            .filter(|&(key, _)| !uow.is_queued_for_insert(key) && !uow.is_removed(key))
            .map(|(key, tracked)| (key.clone(), tracked))
            .collect();
        candidates.sort_by_key(|(_, tracked)| (tracked.table(), tracked.primary_key().display()));

        for (key, tracked) in candidates {
            let row = tracked.current_row();
            if !tracker.is_dirty(&key, &row) {
                continue;
            }
            let pk_column = tracked.pk_column();
            let version_column = tracked.version_column();
            let changed_columns = tracker.changed_fields(&key, &row);
            let changed: Vec<(&'static str, Value)> = row
                .iter()
                .filter(|(c, _)| {
                    *c != pk_column && *c != version_column && changed_columns.contains(c)
                })
                .cloned()
                .collect();
            if changed.is_empty() {
                continue;
            }
            let version = tracked.version();
            let mut sets: Vec<String> = Vec::with_capacity(changed.len() + 1);
            let mut params: Vec<Value> = Vec::with_capacity(changed.len() + 3);
            for (i, (column, value)) in changed.iter().enumerate() {
                sets.push(format!("\"{}\" = {}", column, dialect.placeholder(i + 1)));
                params.push(value.clone());
            }
            let n = changed.len();
            sets.push(format!("\"{}\" = {}", version_column, dialect.placeholder(n + 1)));
            params.push(Value::BigInt(version + 1));
            let sql = format!(
                "UPDATE \"{}\" SET {} WHERE \"{}\" = {} AND \"{}\" = {}",
                tracked.table(),
                sets.join(", "),
                pk_column,
                dialect.placeholder(n + 2),
                version_column,
                dialect.placeholder(n + 3),
            );
            let pk = tracked.primary_key();
            params.push(pk.clone());
            params.push(Value::BigInt(version));
            plan.updates.push(PlannedStatement {
                sql,
                params,
                check: Some(VersionCheck {
                    table: tracked.table(),
                    pk,
                    expected: version,
                }),
                bump: Some((key.clone(), version + 1)),
            });
            plan.snapshot_keys.push(key);
        }

        for pending in uow.removals() {
            // Prefer the live version: the entity may have been
            // updated earlier in this transaction.
            let version = map
                .tracked(&pending.key)
                .map_or(pending.version, |t| t.version());
            let sql = format!(
                "DELETE FROM \"{}\" WHERE \"{}\" = {} AND \"{}\" = {}",
                pending.table,
                pending.pk_column,
                dialect.placeholder(1),
                pending.version_column,
                dialect.placeholder(2),
            );
            plan.deletes.push(PlannedStatement {
                sql,
                params: vec![pending.pk.clone(), Value::BigInt(version)],
                check: Some(VersionCheck {
                    table: pending.table,
                    pk: pending.pk.clone(),
                    expected: version,
                }),
                bump: None,
            });
            plan.delete_keys.push(pending.key.clone());
        }

        Ok(plan)
    }

    /// Run the plan. No in-memory state changes until every statement
    /// has succeeded; a conflict aborts before later statements run.
    pub(crate) async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        map: &IdentityMap,
        tracker: &mut ChangeTracker,
    ) -> Outcome<(), Error> {
        tracing::debug!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "executing flush plan"
        );
        for statement in self
            .inserts
            .iter()
            .chain(self.updates.iter())
            .chain(self.deletes.iter())
        {
            let affected = match conn.execute(cx, &statement.sql, &statement.params).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(promote_constraint(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Some(check) = &statement.check {
                if affected == 0 {
                    tracing::warn!(
                        table = check.table,
                        expected = check.expected,
                        "version check failed, aborting flush"
                    );
                    return Outcome::Err(Error::optimistic_lock(
                        check.table,
                        check.pk.clone(),
                        check.expected,
                    ));
                }
            }
        }

        for statement in &self.updates {
            if let Some((key, new_version)) = &statement.bump {
                if let Some(tracked) = map.tracked(key) {
                    tracked.set_version(*new_version);
                }
            }
        }
        for key in &self.snapshot_keys {
            if let Some(tracked) = map.tracked(key) {
                if let Err(e) = tracker.snapshot(key.clone(), &tracked.current_row()) {
                    return Outcome::Err(e);
                }
            }
        }
        for key in &self.delete_keys {
            tracker.forget(key);
        }
        Outcome::Ok(())
    }
}

/// Constraint failures reported by the driver surface as their own
/// error variant so callers do not have to inspect query kinds.
fn promote_constraint(err: Error) -> Error {
    match err {
        Error::Query(q) if q.kind == QueryErrorKind::Constraint => {
            Error::constraint(q.message, None)
        }
        other => other,
    }
}
