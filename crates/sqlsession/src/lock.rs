//! Lock modes and their resolution.
//!
//! Pessimistic modes resolve to a locking clause on the load SELECT.
//! Optimistic modes register deferred work: a version re-validation at
//! flush or commit, or an unconditional version bump at flush. The
//! dialect decides the exact SQL; engines without shared locks
//! escalate shared requests to exclusive.

use sqlsession_core::{Dialect, Error, Result, Value};

use crate::identity_map::EntityKey;

/// Lock mode requested when loading a single entity by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Plain read, no lock, no version check.
    #[default]
    None,
    /// Exclusive row lock, blocking.
    PessimisticWrite,
    /// Shared row lock, blocking. Escalates to exclusive on engines
    /// without shared locks.
    PessimisticRead,
    /// Exclusive row lock plus an immediate version bump.
    PessimisticForceIncrement,
    /// No row lock; version bumped unconditionally at flush.
    Write,
    /// No row lock; version re-validated at commit.
    Read,
    /// No row lock; version re-validated at flush and commit.
    Optimistic,
    /// No row lock; version bumped unconditionally at flush.
    OptimisticForceIncrement,
}

impl LockMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::PessimisticForceIncrement => "PESSIMISTIC_FORCE_INCREMENT",
            LockMode::Write => "WRITE",
            LockMode::Read => "READ",
            LockMode::Optimistic => "OPTIMISTIC",
            LockMode::OptimisticForceIncrement => "OPTIMISTIC_FORCE_INCREMENT",
        }
    }

    /// Whether this mode takes a database row lock at load time.
    pub const fn is_pessimistic(&self) -> bool {
        matches!(
            self,
            LockMode::PessimisticWrite
                | LockMode::PessimisticRead
                | LockMode::PessimisticForceIncrement
        )
    }

    /// Whether this mode bumps the version without a field change.
    pub const fn is_force_increment(&self) -> bool {
        matches!(
            self,
            LockMode::PessimisticForceIncrement
                | LockMode::Write
                | LockMode::OptimisticForceIncrement
        )
    }
}

/// How long to wait for a pessimistic lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    /// Block until the engine grants the lock.
    #[default]
    Wait,
    /// Fail immediately if the row is already locked (timeout 0).
    NoWait,
}

/// The locking clause for a load under the given mode, or `""` for
/// non-pessimistic modes.
///
/// A zero timeout on an engine that cannot fail lock acquisition
/// immediately is a capability error, not a silent downgrade.
pub(crate) fn lock_clause(
    dialect: Dialect,
    mode: LockMode,
    timeout: LockTimeout,
) -> Result<&'static str> {
    let nowait = matches!(timeout, LockTimeout::NoWait);
    if nowait && mode.is_pessimistic() && !dialect.supports_nowait() {
        return Err(Error::invalid_state(format!(
            "lock timeout 0 is not supported on {dialect:?}"
        )));
    }
    Ok(match mode {
        LockMode::PessimisticWrite | LockMode::PessimisticForceIncrement => {
            dialect.exclusive_lock_clause(nowait)
        }
        LockMode::PessimisticRead => {
            if dialect.supports_shared_locks() {
                dialect.shared_lock_clause(nowait)
            } else {
                dialect.exclusive_lock_clause(nowait)
            }
        }
        _ => "",
    })
}

/// When a deferred lock action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValidationPoint {
    /// At every flush (and therefore also at commit).
    Flush,
    /// Only at commit.
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredAction {
    /// Re-read the stored version and reject on mismatch.
    VerifyVersion,
    /// Version-checked `UPDATE ... SET version = version'` bump.
    ForceIncrement,
}

/// A lock obligation registered at load time and discharged later.
#[derive(Debug, Clone)]
pub(crate) struct DeferredLock {
    pub key: EntityKey,
    pub table: &'static str,
    pub pk_column: &'static str,
    pub version_column: &'static str,
    pub pk: Value,
    /// Version observed when the lock was requested; used when the
    /// entity has already left the identity map.
    pub version_at_registration: i64,
    pub action: DeferredAction,
    pub point: ValidationPoint,
}

impl DeferredLock {
    /// The deferred obligation for a mode, if it has one.
    pub(crate) fn for_mode(
        mode: LockMode,
        key: EntityKey,
        table: &'static str,
        pk_column: &'static str,
        version_column: &'static str,
        pk: Value,
        version: i64,
    ) -> Option<Self> {
        let (action, point) = match mode {
            LockMode::Write | LockMode::OptimisticForceIncrement => {
                (DeferredAction::ForceIncrement, ValidationPoint::Flush)
            }
            LockMode::Read => (DeferredAction::VerifyVersion, ValidationPoint::Commit),
            LockMode::Optimistic => (DeferredAction::VerifyVersion, ValidationPoint::Flush),
            _ => return None,
        };
        Some(Self {
            key,
            table,
            pk_column,
            version_column,
            pk,
            version_at_registration: version,
            action,
            point,
        })
    }

    /// Whether this obligation is due at the given point. Commit runs
    /// everything still outstanding.
    pub(crate) fn due_at(&self, point: ValidationPoint) -> bool {
        match point {
            ValidationPoint::Commit => true,
            ValidationPoint::Flush => self.point == ValidationPoint::Flush,
        }
    }
}
