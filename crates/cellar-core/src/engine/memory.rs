//! In-memory storage engine
//!
//! A BTreeMap-based engine with IndexedDB transaction semantics, for tests
//! and native use. Nothing is persisted.
//!
//! - Read-write transactions stage writes in a private working copy and
//!   publish it atomically on commit; aborted work is never visible.
//! - Overlapping read-write scopes are granted in FIFO order through one
//!   async mutex per store, taken in name order on the first request.
//! - Read-only transactions read the latest committed state.
//! - A failed write request aborts its transaction, as in IndexedDB.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::IndexSpec;
use crate::engine::traits::{
    Connection, Cursor, CursorEntry, ObjectStore, StorageEngine, Transaction, TransactionMode,
    UpgradeFn, VersionChange,
};
use crate::error::{StorageErrorKind, StoreError, StoreResult};
use crate::key::{Direction, Key, KeyPath, KeyRange};

/// In-memory engine. Clones share the same set of databases.
///
/// ```rust
/// use cellar_core::engine::MemoryEngine;
///
/// // Reject commits that would leave more than 100 records in any store
/// let engine = MemoryEngine::with_quota(100);
/// engine.set_denied(false);
/// ```
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

#[derive(Default)]
struct EngineInner {
    databases: Mutex<HashMap<String, Arc<DatabaseCell>>>,
    denied: AtomicBool,
    quota: Option<usize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose commits fail with a quota error once a store would hold
    /// more than `max_records_per_store` records.
    pub fn with_quota(max_records_per_store: usize) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                quota: Some(max_records_per_store),
                ..EngineInner::default()
            }),
        }
    }

    /// Simulate the environment refusing storage access.
    pub fn set_denied(&self, denied: bool) {
        self.inner.denied.store(denied, Ordering::SeqCst);
    }

    /// Names of every database created through this engine.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.databases.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait(?Send)]
impl StorageEngine for MemoryEngine {
    type Connection = MemoryConnection;

    async fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeFn<MemoryTransaction>,
    ) -> StoreResult<MemoryConnection> {
        if self.inner.denied.load(Ordering::SeqCst) {
            return Err(StoreError::storage(
                StorageErrorKind::Denied,
                format!("access to database '{}' denied", name),
            ));
        }
        if version == 0 {
            return Err(StoreError::storage(
                StorageErrorKind::Version,
                "version must be at least 1",
            ));
        }

        let (db, created) = {
            let mut databases = self.inner.databases.lock();
            let created = !databases.contains_key(name);
            let db = databases
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DatabaseCell::new(name)))
                .clone();
            (db, created)
        };

        let current = db.state.read().version;
        if version < current {
            return Err(StoreError::storage(
                StorageErrorKind::Version,
                format!(
                    "requested version {} is less than current version {}",
                    version, current
                ),
            ));
        }

        if version > current {
            if db.has_open_connections() {
                return Err(StoreError::storage(
                    StorageErrorKind::Blocked,
                    format!(
                        "upgrade of '{}' to version {} blocked by open connections",
                        name, version
                    ),
                ));
            }
            if let Err(e) = db.upgrade(current, version, on_upgrade, self.inner.quota) {
                if created {
                    self.inner.databases.lock().remove(name);
                }
                return Err(e);
            }
        }

        let state = Arc::new(ConnectionState {
            closed: AtomicBool::new(false),
            version,
        });
        db.connections.lock().push(Arc::downgrade(&state));
        info!(database = name, version, "opened memory database");

        Ok(MemoryConnection {
            db,
            state,
            quota: self.inner.quota,
        })
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        let mut databases = self.inner.databases.lock();
        if let Some(db) = databases.get(name) {
            if db.has_open_connections() {
                return Err(StoreError::storage(
                    StorageErrorKind::Blocked,
                    format!("database '{}' still has open connections", name),
                ));
            }
        }
        databases.remove(name);
        Ok(())
    }
}

struct DatabaseCell {
    name: String,
    state: RwLock<DatabaseState>,
    write_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    connections: Mutex<Vec<Weak<ConnectionState>>>,
}

#[derive(Default)]
struct DatabaseState {
    version: u32,
    stores: BTreeMap<String, StoreData>,
}

impl DatabaseCell {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(DatabaseState::default()),
            write_locks: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    fn has_open_connections(&self) -> bool {
        let mut connections = self.connections.lock();
        connections.retain(|c| {
            c.upgrade()
                .map(|c| !c.closed.load(Ordering::SeqCst))
                .unwrap_or(false)
        });
        !connections.is_empty()
    }

    fn write_lock(&self, store: &str) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .lock()
            .entry(store.to_string())
            .or_default()
            .clone()
    }

    fn upgrade(
        self: &Arc<Self>,
        old_version: u32,
        new_version: u32,
        on_upgrade: UpgradeFn<MemoryTransaction>,
        quota: Option<usize>,
    ) -> StoreResult<()> {
        info!(
            database = %self.name,
            old_version, new_version, "upgrading memory database"
        );
        let txn = MemoryTransaction::version_change(self.clone(), quota);
        if let Err(e) = on_upgrade(VersionChange {
            old_version,
            new_version,
            transaction: &txn,
        }) {
            txn.abort();
            return Err(e);
        }
        txn.inner.finish(Some(new_version))
    }
}

struct ConnectionState {
    closed: AtomicBool,
    version: u32,
}

/// Connection to a memory database.
#[derive(Clone)]
pub struct MemoryConnection {
    db: Arc<DatabaseCell>,
    state: Arc<ConnectionState>,
    quota: Option<usize>,
}

impl Connection for MemoryConnection {
    type Transaction = MemoryTransaction;

    fn name(&self) -> String {
        self.db.name.clone()
    }

    fn version(&self) -> u32 {
        self.state.version
    }

    fn collection_names(&self) -> Vec<String> {
        self.db.state.read().stores.keys().cloned().collect()
    }

    fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> StoreResult<MemoryTransaction> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(StoreError::storage(
                StorageErrorKind::Closed,
                format!("connection to '{}' is closed", self.db.name),
            ));
        }
        if mode == TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(
                "versionchange transactions are only created by an upgrade",
            ));
        }
        if scope.is_empty() {
            return Err(StoreError::invalid_state("transaction scope is empty"));
        }

        let mut names: Vec<String> = scope.iter().map(|s| s.to_string()).collect();
        names.sort();
        names.dedup();
        {
            let state = self.db.state.read();
            if let Some(missing) = names.iter().find(|n| !state.stores.contains_key(*n)) {
                return Err(StoreError::NotFound(format!("object store '{}'", missing)));
            }
        }

        Ok(MemoryTransaction::new(self.db.clone(), mode, names, self.quota))
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        debug!(database = %self.db.name, "closed memory connection");
    }
}

enum Status {
    Active,
    Committed,
    /// `Some` when the engine aborted because a request failed
    Aborted(Option<StoreError>),
}

struct TxnState {
    status: Status,
    working: BTreeMap<String, StoreData>,
    /// Committed state of the scope as first seen by a readonly transaction
    snapshot: Option<BTreeMap<String, StoreData>>,
}

struct TxnInner {
    db: Arc<DatabaseCell>,
    mode: TransactionMode,
    scope: Vec<String>,
    quota: Option<usize>,
    state: Mutex<TxnState>,
    acquiring: AsyncMutex<()>,
    held: Mutex<Option<Vec<OwnedMutexGuard<()>>>>,
}

/// A transaction against a memory database.
#[derive(Clone)]
pub struct MemoryTransaction {
    inner: Arc<TxnInner>,
}

impl MemoryTransaction {
    fn new(
        db: Arc<DatabaseCell>,
        mode: TransactionMode,
        scope: Vec<String>,
        quota: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                db,
                mode,
                scope,
                quota,
                state: Mutex::new(TxnState {
                    status: Status::Active,
                    working: BTreeMap::new(),
                    snapshot: None,
                }),
                acquiring: AsyncMutex::new(()),
                held: Mutex::new(None),
            }),
        }
    }

    fn version_change(db: Arc<DatabaseCell>, quota: Option<usize>) -> Self {
        let working = db.state.read().stores.clone();
        let txn = Self::new(db, TransactionMode::VersionChange, Vec::new(), quota);
        txn.inner.state.lock().working = working;
        txn
    }
}

impl TxnInner {
    fn check_active(status: &Status) -> StoreResult<()> {
        match status {
            Status::Active => Ok(()),
            Status::Committed => Err(StoreError::invalid_state("transaction has finished")),
            Status::Aborted(_) => Err(StoreError::invalid_state("transaction was aborted")),
        }
    }

    fn in_scope(&self, state: &TxnState, store: &str) -> bool {
        match self.mode {
            TransactionMode::VersionChange => state.working.contains_key(store),
            _ => self.scope.iter().any(|s| s == store),
        }
    }

    /// Take the write locks of every store in scope, once per transaction.
    async fn ensure_locked(&self) -> StoreResult<()> {
        if self.mode != TransactionMode::ReadWrite {
            return Ok(());
        }
        let _acquiring = self.acquiring.lock().await;
        if self.held.lock().is_some() {
            return Ok(());
        }

        let mut guards = Vec::with_capacity(self.scope.len());
        for store in &self.scope {
            guards.push(self.db.write_lock(store).lock_owned().await);
        }

        Self::check_active(&self.state.lock().status)?;
        *self.held.lock() = Some(guards);
        Ok(())
    }

    fn release(&self) {
        self.held.lock().take();
    }

    fn read<R>(&self, store: &str, f: impl FnOnce(&StoreData) -> StoreResult<R>) -> StoreResult<R> {
        let mut state = self.state.lock();
        Self::check_active(&state.status)?;
        if let Some(data) = state.working.get(store) {
            return f(data);
        }
        if self.mode == TransactionMode::ReadOnly {
            let snapshot = state.snapshot.get_or_insert_with(|| self.snapshot());
            let data = snapshot
                .get(store)
                .ok_or_else(|| StoreError::NotFound(format!("object store '{}'", store)))?;
            return f(data);
        }
        let committed = self.db.state.read();
        let data = committed
            .stores
            .get(store)
            .ok_or_else(|| StoreError::NotFound(format!("object store '{}'", store)))?;
        f(data)
    }

    /// Copy every store in scope under one read lock, so a readonly
    /// transaction never observes a commit made while it runs.
    fn snapshot(&self) -> BTreeMap<String, StoreData> {
        let committed = self.db.state.read();
        self.scope
            .iter()
            .filter_map(|name| {
                committed
                    .stores
                    .get(name)
                    .map(|data| (name.clone(), data.clone()))
            })
            .collect()
    }

    fn write<R>(
        &self,
        store: &str,
        f: impl FnOnce(&mut StoreData) -> StoreResult<R>,
    ) -> StoreResult<R> {
        if !self.mode.is_writable() {
            return Err(StoreError::storage(
                StorageErrorKind::ReadOnly,
                format!("cannot write to '{}' in a readonly transaction", store),
            ));
        }

        let mut state = self.state.lock();
        Self::check_active(&state.status)?;
        if !state.working.contains_key(store) {
            let committed = self.db.state.read();
            let data = committed
                .stores
                .get(store)
                .ok_or_else(|| StoreError::NotFound(format!("object store '{}'", store)))?
                .clone();
            state.working.insert(store.to_string(), data);
        }

        let result = state
            .working
            .get_mut(store)
            .ok_or_else(|| StoreError::NotFound(format!("object store '{}'", store)))
            .and_then(f);

        if let Err(e) = &result {
            warn!(store, error = %e, "request failed, aborting transaction");
            state.status = Status::Aborted(Some(e.clone()));
            state.working.clear();
            drop(state);
            self.release();
        }
        result
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        if matches!(state.status, Status::Active) {
            state.status = Status::Aborted(None);
            state.working.clear();
            state.snapshot = None;
            debug!(database = %self.db.name, mode = %self.mode, "transaction aborted");
        }
        drop(state);
        self.release();
    }

    /// Publish the working copy. `version` is set for upgrades.
    fn finish(&self, version: Option<u32>) -> StoreResult<()> {
        let result = self.publish(version);
        self.release();
        result
    }

    fn publish(&self, version: Option<u32>) -> StoreResult<()> {
        let mut state = self.state.lock();
        match &state.status {
            Status::Active => {}
            Status::Committed => {
                return Err(StoreError::invalid_state("transaction already committed"))
            }
            Status::Aborted(Some(cause)) => return Err(cause.clone()),
            Status::Aborted(None) => return Err(StoreError::aborted("transaction was aborted")),
        }

        if let Some(limit) = self.quota {
            let over = state
                .working
                .iter()
                .find(|(_, data)| data.records.len() > limit)
                .map(|(name, data)| {
                    StoreError::storage(
                        StorageErrorKind::Quota,
                        format!(
                            "store '{}' would hold {} records, limit is {}",
                            name,
                            data.records.len(),
                            limit
                        ),
                    )
                });
            if let Some(err) = over {
                warn!(database = %self.db.name, error = %err, "commit rejected");
                state.status = Status::Aborted(Some(err.clone()));
                state.working.clear();
                return Err(err);
            }
        }

        state.snapshot = None;
        let working = std::mem::take(&mut state.working);
        let mut committed = self.db.state.write();
        for (name, data) in working {
            committed.stores.insert(name, data);
        }
        if let Some(version) = version {
            committed.version = version;
        }
        state.status = Status::Committed;
        debug!(database = %self.db.name, mode = %self.mode, "transaction committed");
        Ok(())
    }
}

#[async_trait(?Send)]
impl Transaction for MemoryTransaction {
    type Store = MemoryStore;

    fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    fn scope(&self) -> Vec<String> {
        match self.inner.mode {
            TransactionMode::VersionChange => {
                self.inner.state.lock().working.keys().cloned().collect()
            }
            _ => self.inner.scope.clone(),
        }
    }

    fn object_store(&self, name: &str) -> StoreResult<MemoryStore> {
        let state = self.inner.state.lock();
        TxnInner::check_active(&state.status)?;
        if !self.inner.in_scope(&state, name) {
            return Err(StoreError::NotFound(format!(
                "object store '{}' is not in this transaction's scope",
                name
            )));
        }
        Ok(MemoryStore {
            txn: self.clone(),
            name: name.to_string(),
        })
    }

    fn create_object_store(
        &self,
        name: &str,
        key_path: &KeyPath,
        auto_increment: bool,
    ) -> StoreResult<MemoryStore> {
        if self.inner.mode != TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(
                "object stores can only be created during a version change",
            ));
        }
        if auto_increment && matches!(key_path, KeyPath::Compound(_)) {
            return Err(StoreError::data(
                "auto increment requires a single key path",
            ));
        }

        let mut state = self.inner.state.lock();
        TxnInner::check_active(&state.status)?;
        if state.working.contains_key(name) {
            return Err(StoreError::Constraint(format!(
                "object store '{}' already exists",
                name
            )));
        }
        state.working.insert(
            name.to_string(),
            StoreData::new(name, key_path.clone(), auto_increment),
        );
        debug!(store = name, key_path = %key_path, "created object store");
        drop(state);

        Ok(MemoryStore {
            txn: self.clone(),
            name: name.to_string(),
        })
    }

    fn abort(&self) {
        self.inner.abort();
    }

    async fn commit(&self) -> StoreResult<()> {
        if self.inner.mode == TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(
                "versionchange transactions commit when the upgrade returns",
            ));
        }
        self.inner.finish(None)
    }
}

/// Largest key an auto-increment generator hands out (2^53).
const MAX_GENERATED_KEY: u64 = 1 << 53;

#[derive(Clone)]
struct StoreData {
    name: String,
    key_path: KeyPath,
    auto_increment: bool,
    next_key: u64,
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexSpec>,
}

impl StoreData {
    fn new(name: &str, key_path: KeyPath, auto_increment: bool) -> Self {
        Self {
            name: name.to_string(),
            key_path,
            auto_increment,
            next_key: 1,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    fn insert(&mut self, mut value: Value, overwrite: bool) -> StoreResult<Key> {
        let key = match self.key_path.extract(&value) {
            Some(key) => {
                if self.auto_increment {
                    if let Key::Number(n) = &key {
                        if *n >= self.next_key as f64 {
                            // past the cap the generator stays exhausted
                            self.next_key = if *n < MAX_GENERATED_KEY as f64 {
                                n.floor() as u64 + 1
                            } else {
                                MAX_GENERATED_KEY + 1
                            };
                        }
                    }
                }
                key
            }
            None if self.auto_increment => {
                if self.next_key > MAX_GENERATED_KEY {
                    return Err(StoreError::Constraint(format!(
                        "key generator of '{}' is exhausted",
                        self.name
                    )));
                }
                let key = Key::from(self.next_key);
                self.key_path.inject(&mut value, &key)?;
                self.next_key += 1;
                key
            }
            None => {
                return Err(StoreError::data(format!(
                    "record has no valid key at '{}'",
                    self.key_path
                )))
            }
        };

        if !overwrite && self.records.contains_key(&key) {
            return Err(StoreError::Constraint(format!(
                "key {} already exists in '{}'",
                key, self.name
            )));
        }
        self.check_unique(&key, &value)?;
        self.records.insert(key.clone(), value);
        Ok(key)
    }

    fn check_unique(&self, key: &Key, value: &Value) -> StoreResult<()> {
        for spec in self.indexes.values().filter(|s| s.unique) {
            let new_keys = index_keys(spec, value);
            if new_keys.is_empty() {
                continue;
            }
            let clash = self
                .records
                .iter()
                .filter(|(pk, _)| *pk != key)
                .any(|(_, other)| index_keys(spec, other).iter().any(|k| new_keys.contains(k)));
            if clash {
                return Err(StoreError::Constraint(format!(
                    "unique index '{}' on '{}' already contains this value",
                    spec.name, self.name
                )));
            }
        }
        Ok(())
    }

    fn add_index(&mut self, spec: &IndexSpec) -> StoreResult<()> {
        if self.indexes.contains_key(&spec.name) {
            return Err(StoreError::Constraint(format!(
                "index '{}' already exists on '{}'",
                spec.name, self.name
            )));
        }
        if spec.unique {
            let mut seen: Vec<Key> = Vec::new();
            for value in self.records.values() {
                for key in index_keys(spec, value) {
                    if seen.contains(&key) {
                        return Err(StoreError::Constraint(format!(
                            "existing records violate unique index '{}'",
                            spec.name
                        )));
                    }
                    seen.push(key);
                }
            }
        }
        self.indexes.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    /// (cursor key, primary key) pairs in traversal order.
    fn cursor_entries(
        &self,
        index: Option<&str>,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> StoreResult<VecDeque<(Key, Key)>> {
        let in_range = |k: &Key| range.map(|r| r.contains(k)).unwrap_or(true);

        let mut entries: Vec<(Key, Key)> = match index {
            None => self
                .records
                .keys()
                .filter(|k| in_range(k))
                .map(|k| (k.clone(), k.clone()))
                .collect(),
            Some(name) => {
                let spec = self.indexes.get(name).ok_or_else(|| {
                    StoreError::NotFound(format!("index '{}' on '{}'", name, self.name))
                })?;
                let mut entries: Vec<(Key, Key)> = self
                    .records
                    .iter()
                    .flat_map(|(pk, value)| {
                        index_keys(spec, value)
                            .into_iter()
                            .filter(|k| in_range(k))
                            .map(move |k| (k, pk.clone()))
                    })
                    .collect();
                entries.sort();
                entries
            }
        };

        // Unique traversal yields the lowest primary key of each index key in
        // both directions.
        if direction.is_unique() {
            entries.dedup_by(|later, earlier| later.0 == earlier.0);
        }
        if direction.is_reverse() {
            entries.reverse();
        }
        Ok(entries.into())
    }
}

fn index_keys(spec: &IndexSpec, value: &Value) -> Vec<Key> {
    if spec.multi_entry {
        spec.key_path.extract_multi(value)
    } else {
        spec.key_path.extract(value).into_iter().collect()
    }
}

/// A store seen through a [`MemoryTransaction`].
pub struct MemoryStore {
    txn: MemoryTransaction,
    name: String,
}

impl MemoryStore {
    fn inner(&self) -> &TxnInner {
        &self.txn.inner
    }

    fn require_version_change(&self, what: &str) -> StoreResult<()> {
        if self.inner().mode != TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(format!(
                "{} is only allowed during a version change, not in a {} transaction",
                what,
                self.inner().mode
            )));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl ObjectStore for MemoryStore {
    type Cursor = MemoryCursor;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn key_path(&self) -> StoreResult<KeyPath> {
        self.inner().read(&self.name, |s| Ok(s.key_path.clone()))
    }

    fn auto_increment(&self) -> StoreResult<bool> {
        self.inner().read(&self.name, |s| Ok(s.auto_increment))
    }

    fn index_names(&self) -> StoreResult<Vec<String>> {
        self.inner()
            .read(&self.name, |s| Ok(s.indexes.keys().cloned().collect()))
    }

    async fn add(&self, value: Value) -> StoreResult<Key> {
        self.inner().ensure_locked().await?;
        self.inner().write(&self.name, |s| s.insert(value, false))
    }

    async fn put(&self, value: Value) -> StoreResult<Key> {
        self.inner().ensure_locked().await?;
        self.inner().write(&self.name, |s| s.insert(value, true))
    }

    async fn get(&self, key: &Key) -> StoreResult<Option<Value>> {
        self.inner().ensure_locked().await?;
        self.inner()
            .read(&self.name, |s| Ok(s.records.get(key).cloned()))
    }

    async fn get_all(&self) -> StoreResult<Vec<Value>> {
        self.inner().ensure_locked().await?;
        self.inner()
            .read(&self.name, |s| Ok(s.records.values().cloned().collect()))
    }

    async fn get_all_keys(&self) -> StoreResult<Vec<Key>> {
        self.inner().ensure_locked().await?;
        self.inner()
            .read(&self.name, |s| Ok(s.records.keys().cloned().collect()))
    }

    async fn count(&self) -> StoreResult<usize> {
        self.inner().ensure_locked().await?;
        self.inner().read(&self.name, |s| Ok(s.records.len()))
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        self.inner().ensure_locked().await?;
        self.inner().write(&self.name, |s| {
            s.records.remove(key);
            Ok(())
        })
    }

    async fn clear(&self) -> StoreResult<()> {
        self.inner().ensure_locked().await?;
        self.inner().write(&self.name, |s| {
            s.records.clear();
            Ok(())
        })
    }

    async fn open_cursor(
        &self,
        index: Option<&str>,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> StoreResult<MemoryCursor> {
        self.inner().ensure_locked().await?;
        let entries = self
            .inner()
            .read(&self.name, |s| s.cursor_entries(index, range, direction))?;
        Ok(MemoryCursor {
            txn: self.txn.clone(),
            store: self.name.clone(),
            entries,
        })
    }

    fn create_index(&self, spec: &IndexSpec) -> StoreResult<()> {
        self.require_version_change("creating an index")?;
        self.inner().write(&self.name, |s| s.add_index(spec))?;
        debug!(store = %self.name, index = %spec.name, "created index");
        Ok(())
    }

    fn delete_index(&self, name: &str) -> StoreResult<()> {
        self.require_version_change("deleting an index")?;
        self.inner().write(&self.name, |s| {
            s.indexes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("index '{}' on '{}'", name, s.name)))
        })
    }
}

/// Cursor over a memory store. Positions are fixed when the cursor opens;
/// values are read as the cursor advances.
pub struct MemoryCursor {
    txn: MemoryTransaction,
    store: String,
    entries: VecDeque<(Key, Key)>,
}

#[async_trait(?Send)]
impl Cursor for MemoryCursor {
    async fn next(&mut self) -> StoreResult<Option<CursorEntry>> {
        while let Some((key, primary_key)) = self.entries.pop_front() {
            let value = self
                .txn
                .inner
                .read(&self.store, |s| Ok(s.records.get(&primary_key).cloned()))?;
            if let Some(value) = value {
                return Ok(Some(CursorEntry {
                    key,
                    primary_key,
                    value,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn upgrade(
        f: impl FnOnce(VersionChange<'_, MemoryTransaction>) -> StoreResult<()> + 'static,
    ) -> UpgradeFn<MemoryTransaction> {
        Box::new(f)
    }

    async fn open_users(engine: &MemoryEngine) -> MemoryConnection {
        engine
            .open(
                "test",
                1,
                upgrade(|change| {
                    let store =
                        change
                            .transaction
                            .create_object_store("users", &KeyPath::from("id"), false)?;
                    store.create_index(&IndexSpec::new("by_team", "team"))?;
                    store.create_index(&IndexSpec::new("by_email", "email").unique(true))?;
                    Ok(())
                }),
            )
            .await
            .unwrap()
    }

    async fn seed(conn: &MemoryConnection, values: Vec<Value>) {
        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("users").unwrap();
        for value in values {
            store.add(value).await.unwrap();
        }
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;

        let writer = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        writer
            .object_store("users")
            .unwrap()
            .add(json!({"id": 1}))
            .await
            .unwrap();

        let reader = conn
            .transaction(&["users"], TransactionMode::ReadOnly)
            .unwrap();
        let store = reader.object_store("users").unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        writer.commit().await.unwrap();
        // reads stay repeatable for the rest of the readonly transaction
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.get(&Key::from(1)).await.unwrap(), None);
        reader.commit().await.unwrap();

        let fresh = conn
            .transaction(&["users"], TransactionMode::ReadOnly)
            .unwrap();
        assert_eq!(fresh.object_store("users").unwrap().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_readonly_scope_is_consistent_across_stores() {
        let engine = MemoryEngine::new();
        let conn = engine
            .open(
                "ledger",
                1,
                upgrade(|change| {
                    change
                        .transaction
                        .create_object_store("accounts", &KeyPath::from("id"), false)?;
                    change
                        .transaction
                        .create_object_store("entries", &KeyPath::from("id"), false)?;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let reader = conn
            .transaction(&["accounts", "entries"], TransactionMode::ReadOnly)
            .unwrap();
        let accounts = reader.object_store("accounts").unwrap();
        assert_eq!(accounts.count().await.unwrap(), 0);

        let writer = conn
            .transaction(&["accounts", "entries"], TransactionMode::ReadWrite)
            .unwrap();
        writer
            .object_store("accounts")
            .unwrap()
            .add(json!({"id": 1}))
            .await
            .unwrap();
        writer
            .object_store("entries")
            .unwrap()
            .add(json!({"id": 1, "account": 1}))
            .await
            .unwrap();
        writer.commit().await.unwrap();

        // the entry committed with its account is not visible either
        let entries = reader.object_store("entries").unwrap();
        assert_eq!(entries.count().await.unwrap(), 0);
        let mut cursor = entries
            .open_cursor(None, None, Direction::Next)
            .await
            .unwrap();
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_increment_generator_caps_at_2_pow_53() {
        let engine = MemoryEngine::new();
        let conn = engine
            .open(
                "counters",
                1,
                upgrade(|change| {
                    change
                        .transaction
                        .create_object_store("events", &KeyPath::from("id"), true)?;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let txn = conn
            .transaction(&["events"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("events").unwrap();
        store
            .add(json!({"id": 9007199254740991u64, "t": "last"}))
            .await
            .unwrap();
        let generated = store.add(json!({"t": "cap"})).await.unwrap();
        assert_eq!(generated, Key::from(9007199254740992u64));
        let err = store.add(json!({"t": "over"})).await.unwrap_err();
        assert!(err.is_constraint(), "got {:?}", err);

        // a huge explicit key is stored, and exhausts the generator
        let txn = conn
            .transaction(&["events"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("events").unwrap();
        assert_eq!(
            store.add(json!({"id": 1e20, "t": "big"})).await.unwrap(),
            Key::from(1e20)
        );
        let err = store.add(json!({"t": "next"})).await.unwrap_err();
        assert!(err.is_constraint(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_store_accessors_fail_after_abort() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;

        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("users").unwrap();
        assert_eq!(store.key_path().unwrap(), KeyPath::from("id"));
        assert_eq!(
            store.index_names().unwrap(),
            vec!["by_email".to_string(), "by_team".to_string()]
        );
        assert!(!store.auto_increment().unwrap());

        txn.abort();
        for err in [
            store.key_path().unwrap_err(),
            store.auto_increment().unwrap_err(),
            store.index_names().unwrap_err(),
        ] {
            assert_eq!(err.storage_kind(), Some(StorageErrorKind::InvalidState));
        }
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;

        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        txn.object_store("users")
            .unwrap()
            .add(json!({"id": 1}))
            .await
            .unwrap();
        txn.abort();

        assert!(matches!(
            txn.commit().await,
            Err(StoreError::Storage {
                kind: StorageErrorKind::Aborted,
                ..
            })
        ));
        let reader = conn
            .transaction(&["users"], TransactionMode::ReadOnly)
            .unwrap();
        assert_eq!(reader.object_store("users").unwrap().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_request_aborts_transaction() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;
        seed(&conn, vec![json!({"id": 1})]).await;

        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("users").unwrap();
        store.add(json!({"id": 2})).await.unwrap();
        let dup = store.add(json!({"id": 1})).await;
        assert!(matches!(dup, Err(StoreError::Constraint(_))));

        // the commit reports the original cause and nothing was written
        assert!(matches!(txn.commit().await, Err(StoreError::Constraint(_))));
        let reader = conn
            .transaction(&["users"], TransactionMode::ReadOnly)
            .unwrap();
        assert_eq!(reader.object_store("users").unwrap().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_readonly_rejects_writes() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;
        let txn = conn
            .transaction(&["users"], TransactionMode::ReadOnly)
            .unwrap();
        let err = txn
            .object_store("users")
            .unwrap()
            .put(json!({"id": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.storage_kind(), Some(StorageErrorKind::ReadOnly));
    }

    #[tokio::test]
    async fn test_unique_index_violation() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;
        seed(&conn, vec![json!({"id": 1, "email": "a@x"})]).await;

        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("users").unwrap();
        let err = store.add(json!({"id": 2, "email": "a@x"})).await.unwrap_err();
        assert!(err.is_constraint());
    }

    #[tokio::test]
    async fn test_overlapping_readwrite_scopes_are_serialized() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let second = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();

        // first request takes the store lock
        first
            .object_store("users")
            .unwrap()
            .add(json!({"id": 1}))
            .await
            .unwrap();

        let first_task = {
            let log = log.clone();
            async move {
                tokio::task::yield_now().await;
                first.commit().await.unwrap();
                log.borrow_mut().push("first committed");
            }
        };
        let second_task = {
            let log = log.clone();
            async move {
                let store = second.object_store("users").unwrap();
                let count = store.count().await.unwrap();
                log.borrow_mut().push("second started");
                assert_eq!(count, 1);
                second.commit().await.unwrap();
            }
        };
        tokio::join!(first_task, second_task);

        assert_eq!(*log.borrow(), vec!["first committed", "second started"]);
    }

    #[tokio::test]
    async fn test_quota_rejects_commit() {
        let engine = MemoryEngine::with_quota(1);
        let conn = open_users(&engine).await;
        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("users").unwrap();
        store.add(json!({"id": 1})).await.unwrap();
        store.add(json!({"id": 2})).await.unwrap();

        let err = txn.commit().await.unwrap_err();
        assert_eq!(err.storage_kind(), Some(StorageErrorKind::Quota));
    }

    #[tokio::test]
    async fn test_auto_increment_injects_key() {
        let engine = MemoryEngine::new();
        let conn = engine
            .open(
                "auto",
                1,
                upgrade(|change| {
                    change
                        .transaction
                        .create_object_store("notes", &KeyPath::from("id"), true)?;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let txn = conn
            .transaction(&["notes"], TransactionMode::ReadWrite)
            .unwrap();
        let store = txn.object_store("notes").unwrap();
        assert_eq!(store.add(json!({"text": "a"})).await.unwrap(), Key::from(1));
        assert_eq!(store.add(json!({"id": 10, "text": "b"})).await.unwrap(), Key::from(10));
        assert_eq!(store.add(json!({"text": "c"})).await.unwrap(), Key::from(11));
        assert_eq!(
            store.get(&Key::from(1)).await.unwrap(),
            Some(json!({"id": 1, "text": "a"}))
        );
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_index_cursor_order_and_unique_direction() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;
        seed(
            &conn,
            vec![
                json!({"id": 1, "team": "b"}),
                json!({"id": 2, "team": "a"}),
                json!({"id": 3, "team": "b"}),
                json!({"id": 4}),
            ],
        )
        .await;

        let txn = conn
            .transaction(&["users"], TransactionMode::ReadOnly)
            .unwrap();
        let store = txn.object_store("users").unwrap();

        let mut ids = Vec::new();
        let mut cursor = store
            .open_cursor(Some("by_team"), None, Direction::Next)
            .await
            .unwrap();
        while let Some(entry) = cursor.next().await.unwrap() {
            ids.push(entry.primary_key);
        }
        assert_eq!(ids, vec![Key::from(2), Key::from(1), Key::from(3)]);

        let mut ids = Vec::new();
        let mut cursor = store
            .open_cursor(Some("by_team"), None, Direction::PrevUnique)
            .await
            .unwrap();
        while let Some(entry) = cursor.next().await.unwrap() {
            ids.push(entry.primary_key);
        }
        assert_eq!(ids, vec![Key::from(1), Key::from(2)]);
    }

    #[tokio::test]
    async fn test_index_changes_need_version_change() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;
        let txn = conn
            .transaction(&["users"], TransactionMode::ReadWrite)
            .unwrap();
        let err = txn
            .object_store("users")
            .unwrap()
            .create_index(&IndexSpec::new("by_name", "name"))
            .unwrap_err();
        assert_eq!(err.storage_kind(), Some(StorageErrorKind::InvalidState));
    }

    #[tokio::test]
    async fn test_open_errors() {
        let engine = MemoryEngine::new();
        let conn = open_users(&engine).await;

        // older connection still open
        let blocked = engine
            .open("test", 2, upgrade(|_| Ok(())))
            .await
            .err()
            .unwrap();
        assert_eq!(blocked.storage_kind(), Some(StorageErrorKind::Blocked));

        conn.close();
        engine.open("test", 2, upgrade(|_| Ok(()))).await.unwrap();

        let downgrade = engine
            .open("test", 1, upgrade(|_| Ok(())))
            .await
            .err()
            .unwrap();
        assert_eq!(downgrade.storage_kind(), Some(StorageErrorKind::Version));

        engine.set_denied(true);
        let denied = engine
            .open("other", 1, upgrade(|_| Ok(())))
            .await
            .err()
            .unwrap();
        assert_eq!(denied.storage_kind(), Some(StorageErrorKind::Denied));
    }

    #[tokio::test]
    async fn test_failed_upgrade_leaves_no_database() {
        let engine = MemoryEngine::new();
        let result = engine
            .open(
                "broken",
                1,
                upgrade(|change| {
                    change
                        .transaction
                        .create_object_store("a", &KeyPath::from("id"), false)?;
                    Err(StoreError::Config("nope".into()))
                }),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Config(_))));
        assert!(engine.database_names().is_empty());
    }
}
