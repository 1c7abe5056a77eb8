//! StateStore: redb-backed object store for rungrid.
//!
//! Every object kind lives in its own table keyed by `{namespace}/{name}`
//! with JSON values. Writes use optimistic concurrency on
//! `resource_version`; deletes of objects carrying finalizers only set the
//! deletion timestamp until the last finalizer is removed. Each committed
//! change is published to subscribers as a [`WatchEvent`].

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::meta::{LabelSelector, Object, ObjectKind, WatchAction, WatchEvent};
use crate::tables::table_for;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How many times [`StateStore::modify`] re-reads after a conflict.
const MODIFY_ATTEMPTS: usize = 8;

const WATCH_CAPACITY: usize = 256;

const ALL_KINDS: [ObjectKind; 5] = [
    ObjectKind::ScaleTarget,
    ObjectKind::HorizontalAutoscaler,
    ObjectKind::Owner,
    ObjectKind::Agent,
    ObjectKind::Credential,
];

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for kind in ALL_KINDS {
            txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Receive a [`WatchEvent`] for every committed change.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn publish(&self, kind: ObjectKind, key: String, action: WatchAction) {
        // No receivers is fine; loops fall back to their periodic resync.
        let _ = self.events.send(WatchEvent { kind, key, action });
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get an object by namespace and name.
    pub fn get<T: Object>(&self, namespace: &str, name: &str) -> StateResult<Option<T>> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_for(T::KIND)).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let obj: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// List objects of one kind, optionally restricted to a namespace, that
    /// match the selector. Results are ordered oldest first, then by name.
    pub fn list<T: Object>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_for(T::KIND)).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let obj: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let meta = obj.meta();
            if namespace.is_some_and(|ns| ns != meta.namespace) {
                continue;
            }
            if selector.matches(&meta.labels) {
                results.push(obj);
            }
        }
        results.sort_by(|a, b| {
            let (a, b) = (a.meta(), b.meta());
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert a new object. Fails with `AlreadyExists` if the key is taken.
    ///
    /// The stored copy starts at resource version 1 and generation 1; the
    /// creation timestamp is set unless the caller provided one.
    pub fn create<T: Object>(&self, mut obj: T) -> StateResult<T> {
        let key = obj.meta().key();
        {
            let meta = obj.meta_mut();
            meta.resource_version = 1;
            meta.generation = 1;
            meta.deletion_timestamp = None;
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = Some(Utc::now());
            }
        }
        let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_for(T::KIND)).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = T::KIND.as_str(), %key, "object created");
        self.publish(T::KIND, key, WatchAction::Added);
        Ok(obj)
    }

    /// Replace an object. The caller's `resource_version` must match the
    /// stored one, otherwise `Conflict` is returned.
    ///
    /// The generation is bumped when anything outside `meta` and `status`
    /// changed. A deleting object whose last finalizer was removed is
    /// dropped from the store; `Ok(None)` signals that.
    pub fn update<T: Object>(&self, mut obj: T) -> StateResult<Option<T>> {
        let key = obj.meta().key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let action;
        let result;
        {
            let mut table = txn.open_table(table_for(T::KIND)).map_err(map_err!(Table))?;
            let stored: Vec<u8> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_vec(),
                None => return Err(StateError::NotFound(key)),
            };
            let current: T = serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?;
            let found = current.meta().resource_version;
            let expected = obj.meta().resource_version;
            if found != expected {
                return Err(StateError::Conflict {
                    key,
                    expected,
                    found,
                });
            }

            let spec_changed = desired_state(&current)? != desired_state(&obj)?;
            {
                let cur = current.meta();
                let meta = obj.meta_mut();
                meta.resource_version = found + 1;
                meta.generation = cur.generation + u64::from(spec_changed);
                meta.creation_timestamp = cur.creation_timestamp;
                // Deletion cannot be cancelled by an update.
                if cur.deletion_timestamp.is_some() {
                    meta.deletion_timestamp = cur.deletion_timestamp;
                }
            }

            let meta = obj.meta();
            if meta.is_deleting() && meta.finalizers.is_empty() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                action = WatchAction::Deleted;
                result = None;
            } else {
                let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                action = WatchAction::Modified;
                result = Some(obj);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = T::KIND.as_str(), %key, ?action, "object updated");
        self.publish(T::KIND, key, action);
        Ok(result)
    }

    /// Request deletion. Objects without finalizers are removed at once;
    /// otherwise only the deletion timestamp is set. Returns false if the
    /// object did not exist.
    pub fn delete<T: Object>(&self, namespace: &str, name: &str) -> StateResult<bool> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let action;
        {
            let mut table = txn.open_table(table_for(T::KIND)).map_err(map_err!(Table))?;
            let stored: Vec<u8> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_vec(),
                None => return Ok(false),
            };
            let mut obj: T = serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?;
            if obj.meta().finalizers.is_empty() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                action = Some(WatchAction::Deleted);
            } else if obj.meta().is_deleting() {
                action = None;
            } else {
                let meta = obj.meta_mut();
                meta.deletion_timestamp = Some(Utc::now());
                meta.resource_version += 1;
                let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                action = Some(WatchAction::Modified);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(action) = action {
            debug!(kind = T::KIND.as_str(), %key, ?action, "object deletion requested");
            self.publish(T::KIND, key, action);
        }
        Ok(true)
    }

    /// Read-modify-write with conflict retry.
    ///
    /// `mutate` is re-applied to a fresh copy after each conflict. Returns
    /// `Ok(None)` when the object does not exist or was dropped by the write.
    pub fn modify<T, F>(&self, namespace: &str, name: &str, mut mutate: F) -> StateResult<Option<T>>
    where
        T: Object,
        F: FnMut(&mut T),
    {
        let mut last_err = None;
        for _ in 0..MODIFY_ATTEMPTS {
            let Some(mut obj) = self.get::<T>(namespace, name)? else {
                return Ok(None);
            };
            mutate(&mut obj);
            match self.update(obj) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_conflict() => {
                    warn!(kind = T::KIND.as_str(), namespace, name, "write conflict, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StateError::NotFound(format!("{namespace}/{name}"))))
    }
}

/// The object minus its metadata and status, used to decide whether the
/// generation moves.
fn desired_state<T: Object>(obj: &T) -> StateResult<Value> {
    let mut value = serde_json::to_value(obj).map_err(map_err!(Serialize))?;
    if let Value::Object(map) = &mut value {
        map.remove("meta");
        map.remove("status");
    }
    Ok(value)
}
