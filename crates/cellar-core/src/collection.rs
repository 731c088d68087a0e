//! Typed collection handle
//!
//! A [`Collection`] is the per-store entry point: schema validation, CRUD,
//! cursor queries and vector search. Every operation either runs in its own
//! transaction (committed on success, aborted on error) or joins a
//! transaction supplied by the caller, in which case committing is left to
//! whoever created it.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{IndexSpec, StoreConfig, VectorOptions};
use crate::engine::{Connection, Cursor, ObjectStore, Transaction, TransactionMode};
use crate::error::{StoreError, StoreResult};
use crate::key::{field, Direction, Key, KeyRange};
use crate::similarity::{CosineRanker, Ranker};
use crate::validate::SharedValidator;

/// Results returned by [`Collection::find_similar`] when no limit is given.
pub const DEFAULT_SIMILAR_LIMIT: usize = 5;

/// Transaction type of a connection.
pub type Txn<C> = <C as Connection>::Transaction;
type Store<C> = <Txn<C> as Transaction>::Store;

/// Current ranker of a collection, shared by every handle to it.
pub(crate) type RankerSlot = Arc<RwLock<Arc<dyn Ranker>>>;

/// Cursor query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Traverse this index instead of the primary key
    pub index: Option<String>,
    pub range: Option<KeyRange>,
    pub direction: Direction,
    /// Maximum number of matching records
    pub limit: Option<usize>,
    /// Matching records to skip before collecting
    pub offset: usize,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// A record returned by vector search with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked<T> {
    pub record: T,
    pub score: f32,
}

/// Handle to one collection of `T` records.
///
/// Cheap to clone; clones share the connection and the current ranker.
pub struct Collection<T, C: Connection> {
    conn: C,
    name: String,
    validator: Option<SharedValidator>,
    vector: Option<VectorOptions>,
    vector_field: String,
    ranker: RankerSlot,
    cancel: Option<CancellationToken>,
    _record: PhantomData<fn() -> T>,
}

impl<T, C: Connection> Clone for Collection<T, C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            name: self.name.clone(),
            validator: self.validator.clone(),
            vector: self.vector.clone(),
            vector_field: self.vector_field.clone(),
            ranker: self.ranker.clone(),
            cancel: self.cancel.clone(),
            _record: PhantomData,
        }
    }
}

impl<T, C> Collection<T, C>
where
    T: Serialize + DeserializeOwned,
    C: Connection,
{
    pub(crate) fn new(conn: C, name: &str, config: &StoreConfig, ranker: RankerSlot) -> Self {
        Self {
            conn,
            name: name.to_string(),
            validator: config.validator.clone(),
            vector: config.vector.clone(),
            vector_field: config.vector_field().to_string(),
            ranker,
            cancel: None,
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vector_options(&self) -> Option<&VectorOptions> {
        self.vector.as_ref()
    }

    /// A handle whose operations give up when `token` is cancelled.
    ///
    /// A cancelled operation aborts its transaction, including one supplied
    /// by the caller, and returns [`StoreError::Cancelled`].
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut handle = self.clone();
        handle.cancel = Some(token);
        handle
    }

    /// Insert a new record. Fails with a constraint error if the key exists.
    pub async fn add(&self, record: &T, txn: Option<&Txn<C>>) -> StoreResult<Key> {
        let doc = self.prepare(record)?;
        let key = self
            .run(txn, TransactionMode::ReadWrite, |store| async move {
                store.add(doc).await
            })
            .await?;
        debug!(collection = %self.name, %key, "added record");
        Ok(key)
    }

    /// Insert several records atomically. Every record is validated before
    /// the transaction starts.
    pub async fn add_all(&self, records: &[T], txn: Option<&Txn<C>>) -> StoreResult<Vec<Key>> {
        let docs = records
            .iter()
            .map(|r| self.prepare(r))
            .collect::<StoreResult<Vec<_>>>()?;
        let count = docs.len();
        let keys = self
            .run(txn, TransactionMode::ReadWrite, |store| async move {
                let mut keys = Vec::with_capacity(docs.len());
                for doc in docs {
                    keys.push(store.add(doc).await?);
                }
                Ok(keys)
            })
            .await?;
        debug!(collection = %self.name, count, "added records");
        Ok(keys)
    }

    /// Fetch one record. A missing key is `Ok(None)`.
    pub async fn get(&self, key: impl Into<Key>) -> StoreResult<Option<T>> {
        self.fetch(&key.into(), None).await
    }

    /// [`Collection::get`] inside an existing transaction.
    pub async fn get_in(&self, key: impl Into<Key>, txn: &Txn<C>) -> StoreResult<Option<T>> {
        self.fetch(&key.into(), Some(txn)).await
    }

    async fn fetch(&self, key: &Key, txn: Option<&Txn<C>>) -> StoreResult<Option<T>> {
        let doc = self
            .run(txn, TransactionMode::ReadOnly, |store| async move {
                store.get(key).await
            })
            .await?;
        doc.map(from_document).transpose()
    }

    /// Every record in primary key order.
    pub async fn get_all(&self) -> StoreResult<Vec<T>> {
        let docs = self
            .run(None, TransactionMode::ReadOnly, |store| async move {
                store.get_all().await
            })
            .await?;
        docs.into_iter().map(from_document).collect()
    }

    /// Insert or fully replace a record.
    pub async fn update(&self, record: &T, txn: Option<&Txn<C>>) -> StoreResult<Key> {
        let doc = self.prepare(record)?;
        let key = self
            .run(txn, TransactionMode::ReadWrite, |store| async move {
                store.put(doc).await
            })
            .await?;
        debug!(collection = %self.name, %key, "updated record");
        Ok(key)
    }

    /// Merge `partial` into the stored record (JSON merge patch: `null`
    /// removes a field, objects merge recursively, anything else replaces).
    ///
    /// The merged record is validated before it is written. Fails with
    /// `NotFound` if the key is absent.
    pub async fn patch(
        &self,
        key: impl Into<Key>,
        partial: &Value,
        txn: Option<&Txn<C>>,
    ) -> StoreResult<T> {
        let key = key.into();
        let merged = self
            .run(txn, TransactionMode::ReadWrite, |store| {
                let key = &key;
                async move {
                    let key_path = store.key_path()?;
                    let mut doc = store.get(key).await?.ok_or_else(|| {
                        StoreError::NotFound(format!("record {} in '{}'", key, self.name))
                    })?;
                    merge_patch(&mut doc, partial);
                    let doc = self.check(doc)?;
                    if key_path.extract(&doc).as_ref() != Some(key) {
                        return Err(StoreError::Constraint(format!(
                            "patch would change the key of record {}",
                            key
                        )));
                    }
                    store.put(doc.clone()).await?;
                    Ok(doc)
                }
            })
            .await?;
        debug!(collection = %self.name, %key, "patched record");
        from_document(merged)
    }

    /// Delete by key. Deleting a missing key succeeds.
    pub async fn delete(&self, key: impl Into<Key>, txn: Option<&Txn<C>>) -> StoreResult<()> {
        let key = key.into();
        self.run(txn, TransactionMode::ReadWrite, |store| {
            let key = &key;
            async move { store.delete(key).await }
        })
        .await?;
        debug!(collection = %self.name, %key, "deleted record");
        Ok(())
    }

    /// Remove every record.
    pub async fn clear(&self, txn: Option<&Txn<C>>) -> StoreResult<()> {
        self.run(txn, TransactionMode::ReadWrite, |store| async move {
            store.clear().await
        })
        .await?;
        debug!(collection = %self.name, "cleared collection");
        Ok(())
    }

    pub async fn count(&self) -> StoreResult<usize> {
        self.run(None, TransactionMode::ReadOnly, |store| async move {
            store.count().await
        })
        .await
    }

    pub async fn exists(&self, key: impl Into<Key>) -> StoreResult<bool> {
        let key = key.into();
        let doc = self
            .run(None, TransactionMode::ReadOnly, |store| {
                let key = &key;
                async move { store.get(key).await }
            })
            .await?;
        Ok(doc.is_some())
    }

    /// Every primary key in order.
    pub async fn keys(&self) -> StoreResult<Vec<Key>> {
        self.run(None, TransactionMode::ReadOnly, |store| async move {
            store.get_all_keys().await
        })
        .await
    }

    /// Walk a cursor and collect records matching `predicate`.
    ///
    /// Traversal stops as soon as `limit` matches are collected, so the
    /// predicate never runs on records past that point.
    pub async fn query(
        &self,
        predicate: Option<&dyn Fn(&T) -> bool>,
        options: QueryOptions,
    ) -> StoreResult<Vec<T>> {
        if options.limit == Some(0) {
            return Ok(Vec::new());
        }

        let results = self
            .run(None, TransactionMode::ReadOnly, |store| {
                let options = &options;
                async move {
                    let mut cursor = store
                        .open_cursor(
                            options.index.as_deref(),
                            options.range.as_ref(),
                            options.direction,
                        )
                        .await?;

                    let mut results = Vec::new();
                    let mut skipped = 0;
                    while let Some(entry) = cursor.next().await? {
                        let record: T = from_document(entry.value)?;
                        if !predicate.map(|p| p(&record)).unwrap_or(true) {
                            continue;
                        }
                        if skipped < options.offset {
                            skipped += 1;
                            continue;
                        }
                        results.push(record);
                        if options.limit.map(|l| results.len() >= l).unwrap_or(false) {
                            break;
                        }
                    }
                    Ok(results)
                }
            })
            .await?;

        debug!(
            collection = %self.name,
            index = ?options.index,
            direction = options.direction.as_str(),
            matched = results.len(),
            "query finished"
        );
        Ok(results)
    }

    /// Brute-force vector search over the whole collection.
    ///
    /// Records without a numeric array at the vector field are skipped.
    /// Results are ordered by descending score; ties keep primary key order.
    pub async fn find_similar(
        &self,
        query: &[f32],
        limit: Option<usize>,
    ) -> StoreResult<Vec<Ranked<T>>> {
        let limit = limit.unwrap_or(DEFAULT_SIMILAR_LIMIT);
        // in-flight searches keep the ranker they started with
        let ranker = self.ranker.read().clone();

        if let Some(options) = &self.vector {
            if query.len() != options.dimensions {
                warn!(
                    collection = %self.name,
                    expected = options.dimensions,
                    actual = query.len(),
                    "query vector dimension mismatch"
                );
            }
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let docs = self
            .run(None, TransactionMode::ReadOnly, |store| async move {
                store.get_all().await
            })
            .await?;

        let mut candidates: Vec<(Value, Vec<f32>)> = docs
            .into_iter()
            .filter_map(|doc| vector_at(&doc, &self.vector_field).map(|v| (doc, v)))
            .collect();
        let vectors: Vec<&[f32]> = candidates.iter().map(|(_, v)| v.as_slice()).collect();
        let scored = ranker.rank(query, &vectors);
        debug!(
            collection = %self.name,
            ranker = ranker.name(),
            candidates = scored.len(),
            "ranked candidates"
        );

        let mut results = Vec::with_capacity(limit.min(scored.len()));
        for s in scored.into_iter().take(limit) {
            let doc = std::mem::take(&mut candidates[s.position].0);
            results.push(Ranked {
                record: from_document(doc)?,
                score: s.score,
            });
        }
        Ok(results)
    }

    /// Replace the similarity strategy for every handle to this collection.
    pub fn set_ranker(&self, ranker: Arc<dyn Ranker>) {
        debug!(collection = %self.name, ranker = ranker.name(), "ranker replaced");
        *self.ranker.write() = ranker;
    }

    pub fn ranker(&self) -> Arc<dyn Ranker> {
        self.ranker.read().clone()
    }

    /// Add an index. Only valid inside a `versionchange` transaction.
    pub fn create_index(&self, spec: &IndexSpec, txn: &Txn<C>) -> StoreResult<()> {
        txn.object_store(&self.name)?.create_index(spec)
    }

    /// Drop an index. Only valid inside a `versionchange` transaction.
    pub fn delete_index(&self, name: &str, txn: &Txn<C>) -> StoreResult<()> {
        txn.object_store(&self.name)?.delete_index(name)
    }

    /// Run `op` in a transaction over this collection.
    ///
    /// An error from `op` aborts the transaction and is returned. If `op`
    /// succeeds the transaction is committed, and a failed commit is
    /// returned even though `op` itself succeeded.
    pub async fn transaction<R, F, Fut>(&self, mode: TransactionMode, op: F) -> StoreResult<R>
    where
        F: FnOnce(Txn<C>) -> Fut,
        Fut: Future<Output = StoreResult<R>>,
    {
        let txn = self.conn.transaction(&[self.name.as_str()], mode)?;
        settle(txn.clone(), self.cancel.as_ref(), op(txn)).await
    }

    fn prepare(&self, record: &T) -> StoreResult<Value> {
        self.check(serde_json::to_value(record)?)
    }

    fn check(&self, doc: Value) -> StoreResult<Value> {
        match &self.validator {
            Some(validator) => validator.validate(&doc).map_err(|issues| {
                debug!(collection = %self.name, issues = issues.len(), "record rejected");
                StoreError::Validation(issues)
            }),
            None => Ok(doc),
        }
    }

    /// Run `op` against this collection's store, in `txn` if given.
    async fn run<R, F, Fut>(
        &self,
        txn: Option<&Txn<C>>,
        mode: TransactionMode,
        op: F,
    ) -> StoreResult<R>
    where
        F: FnOnce(Store<C>) -> Fut,
        Fut: Future<Output = StoreResult<R>>,
    {
        match txn {
            Some(txn) => {
                let store = txn.object_store(&self.name)?;
                race(txn, self.cancel.as_ref(), op(store)).await
            }
            None => {
                let txn = self.conn.transaction(&[self.name.as_str()], mode)?;
                let store = txn.object_store(&self.name)?;
                settle(txn, self.cancel.as_ref(), op(store)).await
            }
        }
    }
}

/// Ranker slot for a store, seeded from its configured metric.
pub(crate) fn ranker_slot(config: &StoreConfig) -> RankerSlot {
    let ranker: Arc<dyn Ranker> = match &config.vector {
        Some(options) => options.metric.ranker(),
        None => Arc::new(CosineRanker),
    };
    Arc::new(RwLock::new(ranker))
}

/// Await `op` then commit, or abort if it failed.
pub(crate) async fn settle<X, R>(
    txn: X,
    cancel: Option<&CancellationToken>,
    op: impl Future<Output = StoreResult<R>>,
) -> StoreResult<R>
where
    X: Transaction,
{
    match race(&txn, cancel, op).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            txn.abort();
            Err(e)
        }
    }
}

/// Await `op` unless `cancel` fires first, in which case `txn` is aborted.
pub(crate) async fn race<X, R>(
    txn: &X,
    cancel: Option<&CancellationToken>,
    op: impl Future<Output = StoreResult<R>>,
) -> StoreResult<R>
where
    X: Transaction,
{
    let Some(token) = cancel else {
        return op.await;
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(mode = %txn.mode(), "operation cancelled, aborting transaction");
            txn.abort();
            Err(StoreError::Cancelled)
        }
        result = op => result,
    }
}

fn from_document<T: DeserializeOwned>(doc: Value) -> StoreResult<T> {
    Ok(serde_json::from_value(doc)?)
}

fn vector_at(doc: &Value, path: &str) -> Option<Vec<f32>> {
    field(doc, path)?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (name, value) in patch {
            if value.is_null() {
                target.remove(name);
            } else {
                merge_patch(target.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
