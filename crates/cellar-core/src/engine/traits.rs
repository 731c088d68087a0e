//! Storage engine trait definitions
//!
//! The shape mirrors IndexedDB: a factory opens versioned connections, a
//! connection begins transactions over a set of object stores, and every
//! store operation is a request that completes asynchronously.
//!
//! Futures are `?Send`: browser backends hold JS handles that never leave
//! the event loop thread.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::IndexSpec;
use crate::error::StoreResult;
use crate::key::{Direction, Key, KeyPath, KeyRange};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Only granted while a connection is being upgraded
    VersionChange,
}

impl TransactionMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
            TransactionMode::VersionChange => "versionchange",
        })
    }
}

/// Passed to the upgrade callback while a connection moves to a new version.
pub struct VersionChange<'a, T> {
    /// 0 when the database did not exist yet
    pub old_version: u32,
    pub new_version: u32,
    /// The `versionchange` transaction covering every store
    pub transaction: &'a T,
}

/// Upgrade callback handed to [`StorageEngine::open`].
///
/// Returning an error aborts the upgrade and fails the open.
pub type UpgradeFn<T> = Box<dyn FnOnce(VersionChange<'_, T>) -> StoreResult<()>>;

/// Factory for connections (IndexedDB's `indexedDB` global).
#[async_trait(?Send)]
pub trait StorageEngine: Clone + 'static {
    type Connection: Connection;

    /// Open `name` at `version`, running `on_upgrade` first if the stored
    /// version is lower.
    async fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeFn<<Self::Connection as Connection>::Transaction>,
    ) -> StoreResult<Self::Connection>;

    /// Remove a database and everything in it.
    async fn delete_database(&self, name: &str) -> StoreResult<()>;
}

/// An open connection. Cheap to clone; clones share the same connection.
pub trait Connection: Clone + 'static {
    type Transaction: Transaction;

    fn name(&self) -> String;

    fn version(&self) -> u32;

    fn collection_names(&self) -> Vec<String>;

    /// Begin a transaction over `scope`. `versionchange` cannot be requested.
    fn transaction(&self, scope: &[&str], mode: TransactionMode) -> StoreResult<Self::Transaction>;

    fn close(&self);
}

/// A transaction scope. Clones refer to the same transaction.
#[async_trait(?Send)]
pub trait Transaction: Clone + 'static {
    type Store: ObjectStore;

    fn mode(&self) -> TransactionMode;

    /// Names of the stores this transaction covers.
    fn scope(&self) -> Vec<String>;

    fn object_store(&self, name: &str) -> StoreResult<Self::Store>;

    /// Create a store. Only valid in a `versionchange` transaction.
    fn create_object_store(
        &self,
        name: &str,
        key_path: &KeyPath,
        auto_increment: bool,
    ) -> StoreResult<Self::Store>;

    /// Abort, discarding every write. A no-op once the transaction finished.
    fn abort(&self);

    /// Commit and wait until the engine reports completion.
    ///
    /// Fails if the transaction was aborted, by the caller or the engine.
    async fn commit(&self) -> StoreResult<()>;
}

/// A store as seen through one transaction.
#[async_trait(?Send)]
pub trait ObjectStore {
    type Cursor: Cursor;

    fn name(&self) -> String;

    /// Fails like any request if the transaction has finished.
    fn key_path(&self) -> StoreResult<KeyPath>;

    fn auto_increment(&self) -> StoreResult<bool>;

    fn index_names(&self) -> StoreResult<Vec<String>>;

    /// Insert; fails with a constraint error if the key exists.
    async fn add(&self, value: Value) -> StoreResult<Key>;

    /// Insert or replace.
    async fn put(&self, value: Value) -> StoreResult<Key>;

    async fn get(&self, key: &Key) -> StoreResult<Option<Value>>;

    /// Every record in primary key order.
    async fn get_all(&self) -> StoreResult<Vec<Value>>;

    async fn get_all_keys(&self) -> StoreResult<Vec<Key>>;

    async fn count(&self) -> StoreResult<usize>;

    /// Delete by key. Deleting a missing key succeeds.
    async fn delete(&self, key: &Key) -> StoreResult<()>;

    async fn clear(&self) -> StoreResult<()>;

    /// Open a cursor over the store, or over `index` if given.
    async fn open_cursor(
        &self,
        index: Option<&str>,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> StoreResult<Self::Cursor>;

    /// Only valid in a `versionchange` transaction.
    fn create_index(&self, spec: &IndexSpec) -> StoreResult<()>;

    /// Only valid in a `versionchange` transaction.
    fn delete_index(&self, name: &str) -> StoreResult<()>;
}

/// One position of a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry {
    /// Index key, or the primary key for store cursors
    pub key: Key,
    pub primary_key: Key,
    pub value: Value,
}

/// Lazy traversal of a store or index.
#[async_trait(?Send)]
pub trait Cursor {
    /// Advance and return the next entry, or `None` once exhausted.
    async fn next(&mut self) -> StoreResult<Option<CursorEntry>>;
}
