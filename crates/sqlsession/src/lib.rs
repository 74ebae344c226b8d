//! Transactional entity sessions.
//!
//! A [`Session`] owns one database connection for the duration of a
//! transaction and layers four cooperating pieces on top of it:
//!
//! - an identity map guaranteeing one in-memory instance per entity id
//! - a unit of work tracking pending inserts, dirty candidates, and
//!   removals, with snapshot-based dirty checking
//! - a flush coordinator emitting ordered, version-checked SQL
//! - a lock manager resolving lock modes to locking clauses or
//!   deferred version checks
//!
//! Plus a bulk gateway for set-based writes that bypass all of the
//! above. Commit and rollback both tear the session's per-transaction
//! state down unconditionally.
//!
//! ```ignore
//! let mut session = Session::new(conn);
//! session.begin(&cx).await?;
//! let task = session.save(Task::new("write the docs"))?;
//! task.write().unwrap().finished = true;
//! session.commit(&cx).await?; // flushes the UPDATE, bumps version
//! ```

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use sqlsession_core::{
    Connection, Entity, Error, KeyGenerator, QueryErrorKind, Result, SequentialKeys, Value,
    validate_mapping,
};

pub mod bulk;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod lock;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod test_support;

pub use bulk::{BulkDelete, BulkUpdate};
pub use change_tracker::ChangeTracker;
pub use identity_map::{EntityKey, EntityRef, IdentityMap};
pub use lock::{LockMode, LockTimeout};
pub use unit_of_work::{PendingCounts, PendingDelete, UnitOfWork};

use flush::FlushPlan;
use lock::{DeferredAction, DeferredLock, ValidationPoint, lock_clause};

/// Session lifecycle events observable via callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    BeforeFlush,
    AfterFlush,
    BeforeCommit,
    AfterCommit,
    AfterRollback,
}

type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

#[derive(Default)]
struct SessionEventCallbacks {
    before_flush: Option<SessionEventFn>,
    after_flush: Option<SessionEventFn>,
    before_commit: Option<SessionEventFn>,
    after_commit: Option<SessionEventFn>,
    after_rollback: Option<SessionEventFn>,
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callback = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        match callback {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

/// Session behavior knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flush pending changes automatically at commit. On by default;
    /// turning it off makes commit apply only explicitly flushed work.
    pub auto_flush_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush_on_commit: true,
        }
    }
}

/// A transactional entity session over one connection.
///
/// The session is single-threaded request/response: it never runs
/// statements concurrently and relies on the database for lock
/// arbitration across transactions. Its identity map and unit of work
/// are never shared between transactions.
pub struct Session<C: Connection> {
    connection: C,
    config: SessionConfig,
    key_generator: Box<dyn KeyGenerator>,
    identity_map: IdentityMap,
    uow: UnitOfWork,
    deferred_locks: Vec<DeferredLock>,
    events: SessionEventCallbacks,
    in_transaction: bool,
    /// Entity types whose static mapping has passed validation.
    /// Outlives transactions: metadata is fixed per type.
    validated_mappings: HashSet<TypeId>,
}

impl<C: Connection> Session<C> {
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        Self {
            connection,
            config,
            key_generator: Box::new(SequentialKeys::default()),
            identity_map: IdentityMap::new(),
            uow: UnitOfWork::new(),
            deferred_locks: Vec::new(),
            events: SessionEventCallbacks::default(),
            in_transaction: false,
            validated_mappings: HashSet::new(),
        }
    }

    /// Replace the key generator used for entities saved without a
    /// primary key.
    pub fn with_key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        self.key_generator = Box::new(generator);
        self
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_flush = Some(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_flush = Some(Box::new(f));
    }

    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_commit = Some(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_commit = Some(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_rollback = Some(Box::new(f));
    }

    // ---------------------------------------------------------------
    // Transaction lifecycle
    // ---------------------------------------------------------------

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Err(Error::Transaction(
                "transaction already in progress".to_string(),
            ));
        }
        match self.connection.execute(cx, "BEGIN", &[]).await {
            Outcome::Ok(_) => {
                self.in_transaction = true;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the transaction: flush pending changes (unless
    /// configured otherwise), discharge deferred lock obligations,
    /// then COMMIT and tear down all per-transaction state.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Err(Error::Transaction("no transaction in progress".to_string()));
        }
        if self.config.auto_flush_on_commit {
            match self.flush(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        match self.run_deferred_locks(cx, ValidationPoint::Commit).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.events.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }
        match self.connection.execute(cx, "COMMIT", &[]).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.teardown();
        if let Err(e) = self.events.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the transaction, discarding all pending unit-of-work
    /// state. Per-transaction state is torn down even if the ROLLBACK
    /// statement itself fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Err(Error::Transaction("no transaction in progress".to_string()));
        }
        let result = self.connection.execute(cx, "ROLLBACK", &[]).await;
        self.teardown();
        if let Err(e) = self.events.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        match result {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn teardown(&mut self) {
        self.identity_map.clear();
        self.uow.clear();
        self.deferred_locks.clear();
        self.in_transaction = false;
    }

    // ---------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------

    /// Find an entity by primary key.
    ///
    /// An identity-map hit returns the cached instance without
    /// touching storage. A missing row returns `None`, never an
    /// error. An entity removed in this unit of work is gone: `None`.
    pub async fn get<E: Entity>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        self.get_with_lock(cx, pk, LockMode::None, LockTimeout::Wait)
            .await
    }

    /// Find an entity by primary key under a lock mode.
    ///
    /// Pessimistic modes always issue the locking SELECT, even on an
    /// identity-map hit, because the row lock is the point; the cached
    /// instance still wins for identity. Optimistic modes register
    /// their deferred version check or bump against the loaded entity.
    #[tracing::instrument(level = "debug", skip_all, fields(table = E::TABLE, mode = mode.as_str()))]
    pub async fn get_with_lock<E: Entity>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        if let Err(e) = self.ensure_mapping_validated::<E>() {
            return Outcome::Err(e);
        }
        let pk_value = pk.into();
        let key = EntityKey::of::<E>(&pk_value);
        if self.uow.is_removed(&key) {
            return Outcome::Ok(None);
        }

        let cached = self.identity_map.get::<E>(&key);
        let entity_ref: EntityRef<E>;
        if let (Some(existing), false) = (&cached, mode.is_pessimistic()) {
            entity_ref = Arc::clone(existing);
        } else {
            let dialect = self.connection.dialect();
            let mut sql = format!(
                "{} WHERE \"{}\" = {}",
                select_sql::<E>(),
                E::PRIMARY_KEY,
                dialect.placeholder(1)
            );
            match lock_clause(dialect, mode, timeout) {
                Ok(clause) => sql.push_str(clause),
                Err(e) => return Outcome::Err(e),
            }
            let row = match self
                .connection
                .query_one(cx, &sql, &[pk_value.clone()])
                .await
            {
                Outcome::Ok(row) => row,
                Outcome::Err(e) => {
                    return Outcome::Err(map_lock_error::<E>(e, pk_value));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let Some(row) = row else {
                return Outcome::Ok(None);
            };
            if let Some(existing) = cached {
                // Identity invariant: the managed instance wins over
                // the freshly read row.
                entity_ref = existing;
            } else {
                let entity = match E::from_row(&row) {
                    Ok(entity) => entity,
                    Err(e) => return Outcome::Err(e),
                };
                if let Err(e) = self.uow.tracker_mut().snapshot(key.clone(), &entity.to_row()) {
                    return Outcome::Err(e);
                }
                entity_ref = self.identity_map.insert(key.clone(), entity);
            }
        }

        let version = read_guard(&entity_ref).version();
        if mode == LockMode::PessimisticForceIncrement {
            match self
                .force_increment(cx, E::TABLE, E::PRIMARY_KEY, E::VERSION_COLUMN, key, &pk_value, version)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else if let Some(lock) = DeferredLock::for_mode(
            mode,
            key,
            E::TABLE,
            E::PRIMARY_KEY,
            E::VERSION_COLUMN,
            pk_value,
            version,
        ) {
            self.register_deferred(lock);
        }

        Outcome::Ok(Some(entity_ref))
    }

    /// Load every row of the entity's table, populating the identity
    /// map. Rows already managed keep their managed instance.
    pub async fn find_all<E: Entity>(&mut self, cx: &Cx) -> Outcome<Vec<EntityRef<E>>, Error> {
        if let Err(e) = self.ensure_mapping_validated::<E>() {
            return Outcome::Err(e);
        }
        let sql = select_sql::<E>();
        let rows = match self.connection.query(cx, &sql, &[]).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let entity = match E::from_row(row) {
                Ok(entity) => entity,
                Err(e) => return Outcome::Err(e),
            };
            let key = EntityKey::for_entity(&entity);
            if self.uow.is_removed(&key) {
                continue;
            }
            if let Some(existing) = self.identity_map.get::<E>(&key) {
                out.push(existing);
                continue;
            }
            if let Err(e) = self.uow.tracker_mut().snapshot(key.clone(), &entity.to_row()) {
                return Outcome::Err(e);
            }
            out.push(self.identity_map.insert(key, entity));
        }
        Outcome::Ok(out)
    }

    /// Count all rows of the entity's table.
    pub async fn count<E: Entity>(&mut self, cx: &Cx) -> Outcome<i64, Error> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", E::TABLE);
        let row = match self.connection.query_one(cx, &sql, &[]).await {
            Outcome::Ok(row) => row,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match row {
            Some(row) => match row.get_as::<i64>(0) {
                Ok(count) => Outcome::Ok(count),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(0),
        }
    }

    /// Whether a row with this key exists (in the session or storage).
    pub async fn exists<E: Entity>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<bool, Error> {
        let pk_value = pk.into();
        let key = EntityKey::of::<E>(&pk_value);
        if self.uow.is_removed(&key) {
            return Outcome::Ok(false);
        }
        if self.identity_map.contains(&key) {
            return Outcome::Ok(true);
        }
        let dialect = self.connection.dialect();
        let sql = format!(
            "SELECT \"{}\" FROM \"{}\" WHERE \"{}\" = {}",
            E::PRIMARY_KEY,
            E::TABLE,
            E::PRIMARY_KEY,
            dialect.placeholder(1)
        );
        match self.connection.query_one(cx, &sql, &[pk_value]).await {
            Outcome::Ok(row) => Outcome::Ok(row.is_some()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ---------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------

    /// Save an entity: queue an INSERT for a new one (assigning its
    /// primary key), or manage an existing one as a dirty candidate.
    ///
    /// Returns the managed handle. Saving an entity removed in this
    /// unit of work fails with an invalid-state error without touching
    /// the database.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(table = E::TABLE))]
    pub fn save<E: Entity>(&mut self, mut entity: E) -> Result<EntityRef<E>> {
        self.ensure_mapping_validated::<E>()?;
        if entity.is_new() {
            entity.set_primary_key(self.key_generator.next_key());
            entity.set_version(0);
            let key = EntityKey::for_entity(&entity);
            self.uow.register_new(key.clone(), E::TABLE)?;
            return Ok(self.identity_map.insert(key, entity));
        }
        let key = EntityKey::for_entity(&entity);
        self.uow.register_dirty(key.clone(), E::TABLE)?;
        if let Some(existing) = self.identity_map.get::<E>(&key) {
            // Write through the managed instance so identity holds.
            *write_guard(&existing) = entity;
            Ok(existing)
        } else {
            // Detached instance with a pre-assigned key: no snapshot
            // exists, so it is conservatively dirty at flush.
            Ok(self.identity_map.insert(key, entity))
        }
    }

    /// Save and immediately flush, surfacing write failures here
    /// instead of at commit.
    pub async fn save_and_flush<E: Entity>(
        &mut self,
        cx: &Cx,
        entity: E,
    ) -> Outcome<EntityRef<E>, Error> {
        let entity_ref = match self.save(entity) {
            Ok(r) => r,
            Err(e) => return Outcome::Err(e),
        };
        match self.flush(cx).await {
            Outcome::Ok(()) => Outcome::Ok(entity_ref),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Schedule an entity for deletion at the next flush.
    ///
    /// The entity is immediately fenced off: a second delete or a save
    /// in the same unit of work fails fast, client-side. Deleting an
    /// entity whose INSERT is still pending cancels both.
    pub fn delete<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        let (pk, version) = {
            let guard = read_guard(entity);
            (guard.primary_key(), guard.version())
        };
        if pk.is_null() {
            return Err(Error::invalid_state(format!(
                "entity passed to delete has no identity: [{}#<null>]",
                E::TABLE
            )));
        }
        let key = EntityKey::of::<E>(&pk);
        self.uow.register_removed(PendingDelete {
            key: key.clone(),
            table: E::TABLE,
            pk_column: E::PRIMARY_KEY,
            version_column: E::VERSION_COLUMN,
            pk,
            version,
        })?;
        // A cancelled insert leaves nothing to flush; unmanage it now.
        if !self.uow.removals().iter().any(|p| p.key == key) {
            self.identity_map.remove(&key);
        }
        self.deferred_locks.retain(|l| l.key != key);
        Ok(())
    }

    /// Delete by primary key, loading first. Fails with a not-found
    /// error when no row exists.
    pub async fn delete_by_pk<E: Entity>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<(), Error> {
        let pk_value = pk.into();
        let found = match self.get::<E>(cx, pk_value.clone()).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(entity_ref) = found else {
            return Outcome::Err(Error::not_found(E::TABLE, pk_value));
        };
        match self.delete(&entity_ref) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Flush pending changes: INSERTs, then UPDATEs, then DELETEs,
    /// every UPDATE/DELETE version-checked. Afterwards, flushed
    /// entities' in-memory versions match storage and their snapshots
    /// are refreshed. On failure nothing in memory changes and the
    /// pending queues stay intact.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.events.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        let plan = match FlushPlan::build(self.connection.dialect(), &self.identity_map, &self.uow)
        {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if !plan.is_empty() {
            tracing::debug!(statements = plan.statement_count(), "flushing session");
            match plan
                .execute(cx, &self.connection, &self.identity_map, self.uow.tracker_mut())
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            for key in &plan.delete_keys {
                self.identity_map.remove(key);
            }
            self.uow.clear_flushed();
        }
        match self.run_deferred_locks(cx, ValidationPoint::Flush).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Err(e) = self.events.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    // ---------------------------------------------------------------
    // Bulk gateway
    // ---------------------------------------------------------------

    /// Run a set-based UPDATE, bypassing the identity map and change
    /// tracker. Returns the affected-row count. Loaded instances keep
    /// their stale in-memory state.
    pub async fn bulk_update<E: Entity>(
        &mut self,
        cx: &Cx,
        update: &BulkUpdate<E>,
    ) -> Outcome<u64, Error> {
        if let Err(e) = self.ensure_mapping_validated::<E>() {
            return Outcome::Err(e);
        }
        let (sql, params) = match update.render(self.connection.dialect()) {
            Ok(rendered) => rendered,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(table = E::TABLE, "bulk update");
        match self.connection.execute(cx, &sql, &params).await {
            Outcome::Ok(count) => Outcome::Ok(count),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// [`Session::bulk_update`] plus cache invalidation: every managed
    /// instance of `E` is evicted so subsequent finds reload from
    /// storage.
    pub async fn bulk_update_and_clear<E: Entity>(
        &mut self,
        cx: &Cx,
        update: &BulkUpdate<E>,
    ) -> Outcome<u64, Error> {
        let count = match self.bulk_update(cx, update).await {
            Outcome::Ok(count) => count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.invalidate_type::<E>();
        Outcome::Ok(count)
    }

    /// Run a set-based DELETE, bypassing the identity map and change
    /// tracker.
    pub async fn bulk_delete<E: Entity>(
        &mut self,
        cx: &Cx,
        delete: &BulkDelete<E>,
    ) -> Outcome<u64, Error> {
        if let Err(e) = self.ensure_mapping_validated::<E>() {
            return Outcome::Err(e);
        }
        let (sql, params) = match delete.render(self.connection.dialect()) {
            Ok(rendered) => rendered,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(table = E::TABLE, "bulk delete");
        match self.connection.execute(cx, &sql, &params).await {
            Outcome::Ok(count) => Outcome::Ok(count),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// [`Session::bulk_delete`] plus cache invalidation for `E`.
    pub async fn bulk_delete_and_clear<E: Entity>(
        &mut self,
        cx: &Cx,
        delete: &BulkDelete<E>,
    ) -> Outcome<u64, Error> {
        let count = match self.bulk_delete(cx, delete).await {
            Outcome::Ok(count) => count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.invalidate_type::<E>();
        Outcome::Ok(count)
    }

    fn invalidate_type<E: Entity>(&mut self) {
        let keys = self.identity_map.remove_type::<E>();
        tracing::debug!(table = E::TABLE, evicted = keys.len(), "cache invalidated");
        self.uow.evict_keys(&keys);
        self.deferred_locks.retain(|l| !keys.contains(&l.key));
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Whether the session currently manages an instance with this key.
    pub fn contains<E: Entity>(&self, pk: &Value) -> bool {
        let key = EntityKey::of::<E>(pk);
        self.identity_map.contains(&key) && !self.uow.is_removed(&key)
    }

    /// Whether this key was removed in the current unit of work.
    pub fn is_removed<E: Entity>(&self, pk: &Value) -> bool {
        self.uow.is_removed(&EntityKey::of::<E>(pk))
    }

    /// Counts of pending inserts, dirty entities, and removals.
    pub fn pending_counts(&self) -> PendingCounts {
        let dirty = self
            .identity_map
            .iter_tracked()
            .filter(|&(key, tracked)| {
                !self.uow.is_queued_for_insert(key)
                    && !self.uow.is_removed(key)
                    && self.uow.tracker().is_dirty(key, &tracked.current_row())
            })
            .count();
        PendingCounts {
            new: self.uow.insertions().len(),
            dirty,
            removed: self.uow.removals().len(),
        }
    }

    /// Validate an entity type's static mapping on first touch, once
    /// per session. Malformed metadata is rejected before any SQL is
    /// generated from it.
    fn ensure_mapping_validated<E: Entity>(&mut self) -> Result<()> {
        if self.validated_mappings.contains(&TypeId::of::<E>()) {
            return Ok(());
        }
        validate_mapping::<E>()?;
        self.validated_mappings.insert(TypeId::of::<E>());
        Ok(())
    }

    // ---------------------------------------------------------------
    // Deferred lock obligations
    // ---------------------------------------------------------------

    fn register_deferred(&mut self, lock: DeferredLock) {
        // Re-requesting the same obligation replaces the old one.
        self.deferred_locks
            .retain(|l| !(l.key == lock.key && l.action == lock.action));
        self.deferred_locks.push(lock);
    }

    async fn run_deferred_locks(
        &mut self,
        cx: &Cx,
        point: ValidationPoint,
    ) -> Outcome<(), Error> {
        let due: Vec<DeferredLock> = self
            .deferred_locks
            .iter()
            .filter(|l| l.due_at(point))
            .cloned()
            .collect();
        for lock in due {
            let version = self
                .identity_map
                .tracked(&lock.key)
                .map_or(lock.version_at_registration, |t| t.version());
            match lock.action {
                DeferredAction::VerifyVersion => {
                    let dialect = self.connection.dialect();
                    let sql = format!(
                        "SELECT \"{}\" FROM \"{}\" WHERE \"{}\" = {}",
                        lock.version_column,
                        lock.table,
                        lock.pk_column,
                        dialect.placeholder(1)
                    );
                    let row = match self.connection.query_one(cx, &sql, &[lock.pk.clone()]).await {
                        Outcome::Ok(row) => row,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    let stored = match &row {
                        Some(row) => match row.get_named::<i64>(lock.version_column) {
                            Ok(stored) => Some(stored),
                            Err(e) => return Outcome::Err(e),
                        },
                        None => None,
                    };
                    if stored != Some(version) {
                        tracing::warn!(
                            table = lock.table,
                            expected = version,
                            "deferred version validation failed"
                        );
                        return Outcome::Err(Error::optimistic_lock(
                            lock.table,
                            lock.pk.clone(),
                            version,
                        ));
                    }
                }
                DeferredAction::ForceIncrement => {
                    match self
                        .force_increment(
                            cx,
                            lock.table,
                            lock.pk_column,
                            lock.version_column,
                            lock.key,
                            &lock.pk,
                            version,
                        )
                        .await
                    {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
            }
        }
        // Force increments are one-shot; validations stay armed until
        // the transaction ends.
        self.deferred_locks
            .retain(|l| !(l.due_at(point) && l.action == DeferredAction::ForceIncrement));
        Outcome::Ok(())
    }

    /// Version-checked `UPDATE t SET version = v+1 WHERE pk AND
    /// version = v`. Zero rows affected is an optimistic conflict.
    async fn force_increment(
        &mut self,
        cx: &Cx,
        table: &'static str,
        pk_column: &'static str,
        version_column: &'static str,
        key: EntityKey,
        pk: &Value,
        version: i64,
    ) -> Outcome<(), Error> {
        let dialect = self.connection.dialect();
        let sql = format!(
            "UPDATE \"{}\" SET \"{}\" = {} WHERE \"{}\" = {} AND \"{}\" = {}",
            table,
            version_column,
            dialect.placeholder(1),
            pk_column,
            dialect.placeholder(2),
            version_column,
            dialect.placeholder(3),
        );
        let params = vec![
            Value::BigInt(version + 1),
            pk.clone(),
            Value::BigInt(version),
        ];
        let affected = match self.connection.execute(cx, &sql, &params).await {
            Outcome::Ok(affected) => affected,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if affected == 0 {
            return Outcome::Err(Error::optimistic_lock(table, pk.clone(), version));
        }
        if let Some(tracked) = self.identity_map.tracked(&key) {
            tracked.set_version(version + 1);
            let row = tracked.current_row();
            if let Err(e) = self.uow.tracker_mut().snapshot(key, &row) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }
}

/// `SELECT <all mapped columns> FROM <table>` for an entity type.
fn select_sql<E: Entity>() -> String {
    let columns: Vec<String> = E::fields()
        .iter()
        .map(|f| format!("\"{}\"", f.column))
        .collect();
    format!("SELECT {} FROM \"{}\"", columns.join(", "), E::TABLE)
}

/// Lock-timeout failures on a locking SELECT surface as pessimistic
/// lock errors carrying the entity identity.
fn map_lock_error<E: Entity>(err: Error, pk: Value) -> Error {
    match err {
        Error::Query(q) if q.kind == QueryErrorKind::LockTimeout => {
            Error::pessimistic_lock(E::TABLE, pk)
        }
        other => other,
    }
}

fn read_guard<E>(entity: &EntityRef<E>) -> std::sync::RwLockReadGuard<'_, E> {
    match entity.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_guard<E>(entity: &EntityRef<E>) -> std::sync::RwLockWriteGuard<'_, E> {
    match entity.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
