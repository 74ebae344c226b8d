//! Per-transaction identity map.
//!
//! Guarantees one in-memory instance per (entity type, primary key)
//! within a transaction: repeat loads of the same key return the same
//! `Arc`, so mutations through any handle are visible to the flush
//! coordinator. The map never outlives its transaction; commit and
//! rollback both tear it down.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use sqlsession_core::{Entity, Value};

/// Shared handle to a session-managed entity.
///
/// Two loads of the same key in one transaction return clones of the
/// same `Arc`; `Arc::ptr_eq` holds between them.
pub type EntityRef<E> = Arc<RwLock<E>>;

/// Identity of one managed entity: concrete type plus primary key.
///
/// The key value itself is kept and compared on equality; the
/// precomputed hash only buckets. Two distinct primary keys never
/// alias, even on a hash collision.
#[derive(Debug, Clone)]
pub struct EntityKey {
    type_id: TypeId,
    pk_hash: u64,
    pk: Value,
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
            && self.pk_hash == other.pk_hash
            && pk_eq(&self.pk, &other.pk)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.pk_hash.hash(state);
    }
}

/// Key equality with integer widths normalized, matching [`hash_key`].
fn pk_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::BigInt(y)) => i64::from(*x) == *y,
        (Value::BigInt(x), Value::Int(y)) => *x == i64::from(*y),
        _ => a == b,
    }
}

impl EntityKey {
    /// Key for an entity type and primary key value.
    pub fn of<E: Entity>(pk: &Value) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            pk_hash: hash_key(pk),
            pk: pk.clone(),
        }
    }

    /// The primary key value this key was built from.
    pub fn primary_key(&self) -> &Value {
        &self.pk
    }

    /// Key for a concrete entity instance.
    pub fn for_entity<E: Entity>(entity: &E) -> Self {
        Self::of::<E>(&entity.primary_key())
    }

    /// Whether this key belongs to entity type `E`.
    pub fn is_type<E: Entity>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }
}

/// Hash a primary key value with a per-variant tag so values of
/// different types never collide structurally. Integer variants are
/// normalized to i64 first: a key read back from the driver as
/// `BigInt` must match the same key stored as `Int`.
pub(crate) fn hash_key(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    match value {
        Value::Null => 0u8.hash(&mut hasher),
        Value::Bool(v) => {
            1u8.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        Value::Int(v) => {
            2u8.hash(&mut hasher);
            i64::from(*v).hash(&mut hasher);
        }
        Value::BigInt(v) => {
            2u8.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        Value::Double(v) => {
            3u8.hash(&mut hasher);
            v.to_bits().hash(&mut hasher);
        }
        Value::Text(s) => {
            4u8.hash(&mut hasher);
            s.hash(&mut hasher);
        }
        Value::Bytes(b) => {
            5u8.hash(&mut hasher);
            b.hash(&mut hasher);
        }
        Value::Date(d) => {
            6u8.hash(&mut hasher);
            d.hash(&mut hasher);
        }
        Value::Timestamp(t) => {
            7u8.hash(&mut hasher);
            t.hash(&mut hasher);
        }
        Value::Uuid(u) => {
            8u8.hash(&mut hasher);
            u.hash(&mut hasher);
        }
        Value::Json(j) => {
            9u8.hash(&mut hasher);
            j.to_string().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Type-erased view of a managed entity, used by the flush coordinator
/// and lock manager so they can walk the map without knowing concrete
/// entity types.
pub(crate) trait Tracked: Send + Sync {
    fn table(&self) -> &'static str;
    fn pk_column(&self) -> &'static str;
    fn version_column(&self) -> &'static str;
    /// Current column/value pairs, read through the entity's lock.
    fn current_row(&self) -> Vec<(&'static str, Value)>;
    fn primary_key(&self) -> Value;
    fn version(&self) -> i64;
    fn set_version(&self, version: i64);
    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct EntityHandle<E: Entity> {
    inner: EntityRef<E>,
}

impl<E: Entity> EntityHandle<E> {
    fn new(entity: E) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    fn from_ref(inner: EntityRef<E>) -> Self {
        Self { inner }
    }

    pub(crate) fn entity_ref(&self) -> EntityRef<E> {
        Arc::clone(&self.inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, E> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, E> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<E: Entity> Tracked for EntityHandle<E> {
    fn table(&self) -> &'static str {
        E::TABLE
    }

    fn pk_column(&self) -> &'static str {
        E::PRIMARY_KEY
    }

    fn version_column(&self) -> &'static str {
        E::VERSION_COLUMN
    }

    fn current_row(&self) -> Vec<(&'static str, Value)> {
        self.read().to_row()
    }

    fn primary_key(&self) -> Value {
        self.read().primary_key()
    }

    fn version(&self) -> i64 {
        self.read().version()
    }

    fn set_version(&self, version: i64) {
        self.write().set_version(version);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The identity map itself: `EntityKey` to type-erased handle.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, Box<dyn Tracked>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity, returning the shared handle. An existing
    /// entry for the key is replaced.
    pub fn insert<E: Entity>(&mut self, key: EntityKey, entity: E) -> EntityRef<E> {
        let handle = EntityHandle::new(entity);
        let entity_ref = handle.entity_ref();
        self.entries.insert(key, Box::new(handle));
        entity_ref
    }

    /// Insert an existing handle under the key.
    pub fn insert_ref<E: Entity>(&mut self, key: EntityKey, entity_ref: EntityRef<E>) {
        self.entries.insert(key, Box::new(EntityHandle::from_ref(entity_ref)));
    }

    /// Look up the managed instance for a key.
    pub fn get<E: Entity>(&self, key: &EntityKey) -> Option<EntityRef<E>> {
        self.entries
            .get(key)
            .and_then(|tracked| tracked.as_any().downcast_ref::<EntityHandle<E>>())
            .map(EntityHandle::entity_ref)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict every entry of entity type `E`, returning the evicted
    /// keys. Used by the bulk gateway's cache-invalidating variant.
    pub fn remove_type<E: Entity>(&mut self) -> Vec<EntityKey> {
        let keys: Vec<EntityKey> = self
            .entries
            .keys()
            .filter(|k| k.is_type::<E>())
            .cloned()
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn tracked(&self, key: &EntityKey) -> Option<&dyn Tracked> {
        self.entries.get(key).map(Box::as_ref)
    }

    pub(crate) fn iter_tracked(&self) -> impl Iterator<Item = (&EntityKey, &dyn Tracked)> {
        self.entries.iter().map(|(k, v)| (k, v.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestTask;

    #[test]
    fn same_key_returns_same_instance() {
        let mut map = IdentityMap::new();
        let task = TestTask::with_id(1, "a");
        let key = EntityKey::for_entity(&task);
        let first = map.insert(key.clone(), task);
        let second = map.get::<TestTask>(&key).expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinct_types_do_not_collide() {
        use crate::test_support::TestMember;
        let mut map = IdentityMap::new();
        let task = TestTask::with_id(1, "a");
        map.insert(EntityKey::for_entity(&task), task);
        let member_key = EntityKey::of::<TestMember>(&Value::BigInt(1));
        assert!(!map.contains(&member_key));
        assert!(map.get::<TestMember>(&member_key).is_none());
    }

    #[test]
    fn integer_widths_normalize() {
        assert_eq!(
            EntityKey::of::<TestTask>(&Value::Int(5)),
            EntityKey::of::<TestTask>(&Value::BigInt(5))
        );
    }

    #[test]
    fn colliding_hashes_do_not_alias_distinct_keys() {
        // Same bucket, different primary key: never equal.
        let a = EntityKey::of::<TestTask>(&Value::BigInt(1));
        let forged = EntityKey {
            type_id: a.type_id,
            pk_hash: a.pk_hash,
            pk: Value::BigInt(2),
        };
        assert_ne!(a, forged);
        assert_eq!(a.primary_key(), &Value::BigInt(1));

        let mut map = IdentityMap::new();
        map.insert(a, TestTask::with_id(1, "a"));
        assert!(!map.contains(&forged));
        assert!(map.get::<TestTask>(&forged).is_none());
    }

    #[test]
    fn remove_type_evicts_only_that_type() {
        use crate::test_support::TestMember;
        let mut map = IdentityMap::new();
        map.insert(EntityKey::of::<TestTask>(&Value::BigInt(1)), TestTask::with_id(1, "a"));
        map.insert(EntityKey::of::<TestTask>(&Value::BigInt(2)), TestTask::with_id(2, "b"));
        map.insert(
            EntityKey::of::<TestMember>(&Value::BigInt(1)),
            TestMember::with_id(1, "login"),
        );
        let evicted = map.remove_type::<TestTask>();
        assert_eq!(evicted.len(), 2);
        assert_eq!(map.len(), 1);
        assert!(map.contains(&EntityKey::of::<TestMember>(&Value::BigInt(1))));
    }

    #[test]
    fn tracked_view_reads_through_lock() {
        let mut map = IdentityMap::new();
        let key = EntityKey::of::<TestTask>(&Value::BigInt(9));
        let handle = map.insert(key.clone(), TestTask::with_id(9, "before"));
        handle.write().unwrap().title = "after".to_string();
        let tracked = map.tracked(&key).expect("tracked");
        let row = tracked.current_row();
        let title = row.iter().find(|(c, _)| *c == "title").map(|(_, v)| v.clone());
        assert_eq!(title, Some(Value::Text("after".into())));
        assert_eq!(tracked.table(), "task");
    }
}
