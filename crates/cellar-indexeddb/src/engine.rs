//! IndexedDB implementation of the core storage engine traits.
//!
//! Every request is turned into a promise as soon as it is issued, so no
//! `success` or `error` event can fire before its listener exists. The
//! transaction's completion promise is created when the transaction begins
//! for the same reason.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use cellar_core::engine::{
    Connection, Cursor, CursorEntry, ObjectStore, StorageEngine, Transaction, TransactionMode,
    UpgradeFn, VersionChange,
};
use cellar_core::{
    Direction, IndexSpec, Key, KeyPath, KeyRange, StorageErrorKind, StoreError, StoreResult,
};
use js_sys::Promise;
use serde_json::Value;
use tracing::{debug, info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    DomStringList, IdbCursorWithValue, IdbDatabase, IdbIndexParameters, IdbObjectStore,
    IdbObjectStoreParameters, IdbOpenDbRequest, IdbRequest, IdbTransaction, IdbTransactionMode,
};

use crate::convert::{
    direction_to_js, key_from_js, key_path_from_js, key_path_to_js, key_to_js, range_to_js,
    value_from_js, value_to_js,
};
use crate::error::js_error;
use crate::idb;

type UpgradeClosure = Rc<RefCell<Option<Closure<dyn FnMut(web_sys::IdbVersionChangeEvent)>>>>;

/// The browser's `indexedDB` factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexedDbEngine;

impl IndexedDbEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl StorageEngine for IndexedDbEngine {
    type Connection = IndexedDbConnection;

    async fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeFn<IndexedDbTransaction>,
    ) -> StoreResult<IndexedDbConnection> {
        if version == 0 {
            return Err(StoreError::storage(
                StorageErrorKind::Version,
                "version must be at least 1",
            ));
        }
        let factory = idb::idb_factory()?;
        let open_req: IdbOpenDbRequest = factory.open_with_u32(name, version).map_err(js_error)?;

        let hook = Rc::new(RefCell::new(Some(on_upgrade)));
        let failure: Rc<RefCell<Option<StoreError>>> = Rc::new(RefCell::new(None));

        // Store upgrade closure to manage its lifetime without leaking
        let upgrade_closure: UpgradeClosure = Rc::new(RefCell::new(None));
        let failure_for_upgrade = failure.clone();
        let on_upgrade = Closure::wrap(Box::new(move |event: web_sys::IdbVersionChangeEvent| {
            let Some(hook) = hook.borrow_mut().take() else {
                return;
            };
            if let Err(e) = run_upgrade(&event, hook) {
                warn!(error = %e, "upgrade failed");
                *failure_for_upgrade.borrow_mut() = Some(e);
            }
        }) as Box<dyn FnMut(web_sys::IdbVersionChangeEvent)>);

        open_req.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));
        *upgrade_closure.borrow_mut() = Some(on_upgrade);

        let result = idb::await_promise(idb::open_request_to_promise(&open_req, name)).await;
        *upgrade_closure.borrow_mut() = None;

        // A failed hook aborts the upgrade; report its error, not the AbortError
        if let Some(e) = failure.borrow_mut().take() {
            if let Ok(db) = result.as_ref().map(|v| v.unchecked_ref::<IdbDatabase>().clone()) {
                db.close();
            }
            return Err(e);
        }

        let db: IdbDatabase = result?
            .dyn_into()
            .map_err(|_| StoreError::storage(StorageErrorKind::Open, "result is not IdbDatabase"))?;
        info!(database = name, version, "opened IndexedDB database");
        Ok(IndexedDbConnection { db })
    }

    async fn delete_database(&self, name: &str) -> StoreResult<()> {
        idb::delete_database(name).await?;
        debug!(database = name, "deleted IndexedDB database");
        Ok(())
    }
}

fn run_upgrade(
    event: &web_sys::IdbVersionChangeEvent,
    hook: UpgradeFn<IndexedDbTransaction>,
) -> StoreResult<()> {
    let req: IdbOpenDbRequest = event
        .target()
        .ok_or_else(|| StoreError::invalid_state("upgrade event has no target"))?
        .unchecked_into();
    let db: IdbDatabase = req.result().map_err(js_error)?.unchecked_into();
    let tx = req
        .transaction()
        .ok_or_else(|| StoreError::invalid_state("upgrade has no versionchange transaction"))?;

    let txn = IndexedDbTransaction::version_change(db, tx);
    let result = hook(VersionChange {
        old_version: event.old_version() as u32,
        new_version: event.new_version().unwrap_or_default() as u32,
        transaction: &txn,
    });
    if result.is_err() {
        txn.abort();
    }
    result
}

/// An open IndexedDB connection.
#[derive(Debug, Clone)]
pub struct IndexedDbConnection {
    db: IdbDatabase,
}

impl IndexedDbConnection {
    pub fn database(&self) -> &IdbDatabase {
        &self.db
    }
}

impl Connection for IndexedDbConnection {
    type Transaction = IndexedDbTransaction;

    fn name(&self) -> String {
        self.db.name()
    }

    fn version(&self) -> u32 {
        self.db.version() as u32
    }

    fn collection_names(&self) -> Vec<String> {
        names(&self.db.object_store_names())
    }

    fn transaction(&self, scope: &[&str], mode: TransactionMode) -> StoreResult<IndexedDbTransaction> {
        let idb_mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
            TransactionMode::VersionChange => {
                return Err(StoreError::invalid_state(
                    "versionchange transactions are only created by an upgrade",
                ))
            }
        };
        let names: js_sys::Array = scope.iter().map(|s| JsValue::from_str(s)).collect();
        let tx = self
            .db
            .transaction_with_str_sequence_and_mode(&names, idb_mode)
            .map_err(js_error)?;
        Ok(IndexedDbTransaction::new(self.db.clone(), tx, mode))
    }

    fn close(&self) {
        self.db.close();
    }
}

fn names(list: &DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.get(i)).collect()
}

struct TxnInner {
    db: IdbDatabase,
    tx: IdbTransaction,
    mode: TransactionMode,
    /// Settles on complete or abort; `None` for upgrades, which finish
    /// when the open request does
    done: Option<Promise>,
}

/// An IndexedDB transaction.
#[derive(Clone)]
pub struct IndexedDbTransaction {
    inner: Rc<TxnInner>,
}

impl IndexedDbTransaction {
    fn new(db: IdbDatabase, tx: IdbTransaction, mode: TransactionMode) -> Self {
        let done = idb::transaction_to_promise(&tx);
        Self {
            inner: Rc::new(TxnInner {
                db,
                tx,
                mode,
                done: Some(done),
            }),
        }
    }

    fn version_change(db: IdbDatabase, tx: IdbTransaction) -> Self {
        Self {
            inner: Rc::new(TxnInner {
                db,
                tx,
                mode: TransactionMode::VersionChange,
                done: None,
            }),
        }
    }

    pub fn raw(&self) -> &IdbTransaction {
        &self.inner.tx
    }

    fn store(&self, store: IdbObjectStore) -> IndexedDbStore {
        IndexedDbStore {
            store,
            txn: self.clone(),
        }
    }
}

#[async_trait(?Send)]
impl Transaction for IndexedDbTransaction {
    type Store = IndexedDbStore;

    fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    fn scope(&self) -> Vec<String> {
        names(&self.inner.tx.object_store_names())
    }

    fn object_store(&self, name: &str) -> StoreResult<IndexedDbStore> {
        let store = self.inner.tx.object_store(name).map_err(js_error)?;
        Ok(self.store(store))
    }

    fn create_object_store(
        &self,
        name: &str,
        key_path: &KeyPath,
        auto_increment: bool,
    ) -> StoreResult<IndexedDbStore> {
        if self.inner.mode != TransactionMode::VersionChange {
            return Err(StoreError::invalid_state(
                "object stores can only be created during a version change",
            ));
        }
        let params = IdbObjectStoreParameters::new();
        js_sys::Reflect::set(&params, &"keyPath".into(), &key_path_to_js(key_path))
            .map_err(js_error)?;
        js_sys::Reflect::set(&params, &"autoIncrement".into(), &JsValue::from_bool(auto_increment))
            .map_err(js_error)?;
        let store = self
            .inner
            .db
            .create_object_store_with_optional_parameters(name, &params)
            .map_err(js_error)?;
        debug!(store = name, key_path = %key_path, "created object store");
        Ok(self.store(store))
    }

    fn abort(&self) {
        // InvalidStateError once finished; aborting is then a no-op
        if self.inner.tx.abort().is_ok() {
            debug!(mode = %self.inner.mode, "transaction aborted");
        }
    }

    async fn commit(&self) -> StoreResult<()> {
        let Some(done) = &self.inner.done else {
            return Err(StoreError::invalid_state(
                "versionchange transactions commit when the upgrade returns",
            ));
        };
        // Fails once the transaction is already committing or finished; the
        // completion promise reports the outcome either way
        let _ = self.inner.tx.commit();
        idb::await_promise(done.clone()).await?;
        Ok(())
    }
}

/// An object store within an IndexedDB transaction.
pub struct IndexedDbStore {
    store: IdbObjectStore,
    txn: IndexedDbTransaction,
}

impl IndexedDbStore {
    /// Issue a request. A request that throws synchronously aborts the
    /// transaction, matching how a failed asynchronous write behaves.
    fn request(
        &self,
        issue: impl FnOnce(&IdbObjectStore) -> Result<IdbRequest, JsValue>,
    ) -> StoreResult<Promise> {
        match issue(&self.store) {
            Ok(req) => Ok(idb::request_to_promise(&req)),
            Err(e) => {
                let err = js_error(e);
                if self.txn.inner.mode.is_writable() {
                    warn!(store = %self.store.name(), error = %err, "request failed, aborting transaction");
                    self.txn.abort();
                }
                Err(err)
            }
        }
    }

    async fn send(
        &self,
        issue: impl FnOnce(&IdbObjectStore) -> Result<IdbRequest, JsValue>,
    ) -> StoreResult<JsValue> {
        let promise = self.request(issue)?;
        Ok(idb::await_promise(promise).await?)
    }
}

#[async_trait(?Send)]
impl ObjectStore for IndexedDbStore {
    type Cursor = IndexedDbCursor;

    fn name(&self) -> String {
        self.store.name()
    }

    fn key_path(&self) -> StoreResult<KeyPath> {
        self.store
            .key_path()
            .map(|v| key_path_from_js(&v))
            .map_err(js_error)
    }

    fn auto_increment(&self) -> StoreResult<bool> {
        Ok(self.store.auto_increment())
    }

    fn index_names(&self) -> StoreResult<Vec<String>> {
        Ok(names(&self.store.index_names()))
    }

    async fn add(&self, value: Value) -> StoreResult<Key> {
        let js = value_to_js(&value)?;
        let key = self.send(|s| s.add(&js)).await?;
        key_from_js(&key)
    }

    async fn put(&self, value: Value) -> StoreResult<Key> {
        let js = value_to_js(&value)?;
        let key = self.send(|s| s.put(&js)).await?;
        key_from_js(&key)
    }

    async fn get(&self, key: &Key) -> StoreResult<Option<Value>> {
        let key = key_to_js(key);
        let result = self.send(|s| s.get(&key)).await?;
        if result.is_undefined() {
            return Ok(None);
        }
        value_from_js(&result).map(Some)
    }

    async fn get_all(&self) -> StoreResult<Vec<Value>> {
        let result = self.send(|s| s.get_all()).await?;
        js_sys::Array::from(&result)
            .iter()
            .map(|v| value_from_js(&v))
            .collect()
    }

    async fn get_all_keys(&self) -> StoreResult<Vec<Key>> {
        let result = self.send(|s| s.get_all_keys()).await?;
        js_sys::Array::from(&result)
            .iter()
            .map(|v| key_from_js(&v))
            .collect()
    }

    async fn count(&self) -> StoreResult<usize> {
        let result = self.send(|s| s.count()).await?;
        Ok(result.as_f64().unwrap_or(0.0) as usize)
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        let key = key_to_js(key);
        self.send(|s| s.delete(&key)).await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.send(|s| s.clear()).await?;
        Ok(())
    }

    async fn open_cursor(
        &self,
        index: Option<&str>,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> StoreResult<IndexedDbCursor> {
        let range = range_to_js(range)?;
        let direction = direction_to_js(direction);
        let request = match index {
            Some(name) => self
                .store
                .index(name)
                .and_then(|index| index.open_cursor_with_range_and_direction(&range, direction)),
            None => self
                .store
                .open_cursor_with_range_and_direction(&range, direction),
        }
        .map_err(js_error)?;

        let pending = idb::request_to_promise(&request);
        Ok(IndexedDbCursor {
            request,
            pending: Some(pending),
            exhausted: false,
        })
    }

    fn create_index(&self, spec: &IndexSpec) -> StoreResult<()> {
        let params = IdbIndexParameters::new();
        js_sys::Reflect::set(&params, &"unique".into(), &JsValue::from_bool(spec.unique))
            .map_err(js_error)?;
        js_sys::Reflect::set(&params, &"multiEntry".into(), &JsValue::from_bool(spec.multi_entry))
            .map_err(js_error)?;

        // Outside versionchange the browser throws InvalidStateError
        match &spec.key_path {
            KeyPath::Single(path) => self
                .store
                .create_index_with_str_and_optional_parameters(&spec.name, path, &params),
            KeyPath::Compound(_) => self.store.create_index_with_str_sequence_and_optional_parameters(
                &spec.name,
                &key_path_to_js(&spec.key_path),
                &params,
            ),
        }
        .map_err(js_error)?;
        debug!(store = %self.store.name(), index = %spec.name, "created index");
        Ok(())
    }

    fn delete_index(&self, name: &str) -> StoreResult<()> {
        self.store.delete_index(name).map_err(js_error)
    }
}

/// Cursor over an IndexedDB store or index.
pub struct IndexedDbCursor {
    request: IdbRequest,
    /// Promise for the step in flight
    pending: Option<Promise>,
    exhausted: bool,
}

#[async_trait(?Send)]
impl Cursor for IndexedDbCursor {
    async fn next(&mut self) -> StoreResult<Option<CursorEntry>> {
        if self.exhausted {
            return Ok(None);
        }

        let promise = match self.pending.take() {
            Some(promise) => promise,
            None => {
                let current: IdbCursorWithValue = self
                    .request
                    .result()
                    .map_err(js_error)?
                    .dyn_into()
                    .map_err(|_| StoreError::invalid_state("cursor has no current position"))?;
                current.continue_().map_err(js_error)?;
                idb::request_to_promise(&self.request)
            }
        };

        let result = idb::await_promise(promise).await?;
        if result.is_null() || result.is_undefined() {
            self.exhausted = true;
            return Ok(None);
        }

        let cursor: IdbCursorWithValue = result
            .dyn_into()
            .map_err(|_| StoreError::invalid_state("cursor result is not IDBCursorWithValue"))?;
        Ok(Some(CursorEntry {
            key: key_from_js(&cursor.key().map_err(js_error)?)?,
            primary_key: key_from_js(&cursor.primary_key().map_err(js_error)?)?,
            value: value_from_js(&cursor.value().map_err(js_error)?)?,
        }))
    }
}
