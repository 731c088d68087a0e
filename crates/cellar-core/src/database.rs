//! Database handle
//!
//! Opens a storage engine from a [`DatabaseConfig`] and hands out typed
//! [`Collection`] handles. The open starts lazily on first use and its
//! result is shared, so every caller waiting for a collection sees the same
//! connection or the same error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collection::{ranker_slot, settle, Collection, RankerSlot, Txn};
use crate::config::DatabaseConfig;
use crate::engine::{
    Connection, ObjectStore, StorageEngine, Transaction, TransactionMode, UpgradeFn,
    VersionChange,
};
use crate::error::{StoreError, StoreResult};

type OpenFuture<C> = Shared<LocalBoxFuture<'static, StoreResult<C>>>;

/// Handle to a configured database.
///
/// ```rust
/// use cellar_core::config::{DatabaseConfig, StoreConfig};
/// use cellar_core::engine::MemoryEngine;
/// use cellar_core::Database;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Note {
///     id: u32,
///     text: String,
/// }
///
/// # async fn run() -> cellar_core::StoreResult<()> {
/// let config = DatabaseConfig::new("app", 1).store("notes", StoreConfig::new("id"));
/// let db = Database::open(MemoryEngine::new(), config).await?;
///
/// let notes = db.collection::<Note>("notes").await?;
/// notes.add(&Note { id: 1, text: "hello".into() }, None).await?;
/// assert!(notes.exists(1).await?);
/// # Ok(())
/// # }
/// ```
pub struct Database<E: StorageEngine> {
    engine: E,
    config: Arc<DatabaseConfig>,
    connection: OpenFuture<E::Connection>,
    rankers: Arc<Mutex<HashMap<String, RankerSlot>>>,
}

impl<E: StorageEngine> Clone for Database<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            connection: self.connection.clone(),
            rankers: self.rankers.clone(),
        }
    }
}

impl<E: StorageEngine> Database<E> {
    /// Build a handle without opening. The engine is opened when the first
    /// collection is requested.
    pub fn new(engine: E, config: DatabaseConfig) -> Self {
        Self::build(engine, config, None)
    }

    /// Open, creating or upgrading the stored schema as needed.
    pub async fn open(engine: E, config: DatabaseConfig) -> StoreResult<Self> {
        let db = Self::new(engine, config);
        db.connection().await?;
        Ok(db)
    }

    /// Like [`Database::open`], then runs `hook` inside the same
    /// `versionchange` transaction once the declared stores and indexes
    /// exist. The hook only runs when the stored version is lower than the
    /// configured one.
    pub async fn open_with_upgrade<F>(engine: E, config: DatabaseConfig, hook: F) -> StoreResult<Self>
    where
        F: FnOnce(VersionChange<'_, Txn<E::Connection>>) -> StoreResult<()> + 'static,
    {
        let db = Self::build(engine, config, Some(Box::new(hook)));
        db.connection().await?;
        Ok(db)
    }

    fn build(
        engine: E,
        config: DatabaseConfig,
        hook: Option<UpgradeFn<Txn<E::Connection>>>,
    ) -> Self {
        let config = Arc::new(config);
        let connection = {
            let engine = engine.clone();
            let config = config.clone();
            async move {
                config.validate()?;
                let on_upgrade = upgrade_fn(config.clone(), hook);
                let conn = engine.open(&config.name, config.version, on_upgrade).await?;
                info!(database = %config.name, version = config.version, "database open");
                Ok::<_, StoreError>(conn)
            }
            .boxed_local()
            .shared()
        };

        Self {
            engine,
            config,
            connection,
            rankers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The open connection, opening first if needed.
    pub async fn connection(&self) -> StoreResult<E::Connection> {
        self.connection.clone().await
    }

    /// Typed handle to a configured collection.
    ///
    /// Names missing from the configuration fail with `NotFound` without
    /// waiting for the open.
    pub async fn collection<T>(&self, name: &str) -> StoreResult<Collection<T, E::Connection>>
    where
        T: Serialize + DeserializeOwned,
    {
        let store = self
            .config
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", name)))?;
        let conn = self.connection().await?;
        let ranker = self
            .rankers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| ranker_slot(store))
            .clone();
        Ok(Collection::new(conn, name, store, ranker))
    }

    /// Run `op` in one transaction spanning several collections.
    ///
    /// Collection handles join it by passing the transaction to their
    /// operations. An error from `op` aborts everything; otherwise the
    /// transaction is committed and a failed commit is returned.
    pub async fn transaction<R, F, Fut>(
        &self,
        names: &[&str],
        mode: TransactionMode,
        op: F,
    ) -> StoreResult<R>
    where
        F: FnOnce(Txn<E::Connection>) -> Fut,
        Fut: Future<Output = StoreResult<R>>,
    {
        if let Some(missing) = names.iter().find(|n| self.config.get(n).is_none()) {
            return Err(StoreError::NotFound(format!("collection '{}'", missing)));
        }
        let conn = self.connection().await?;
        let txn = conn.transaction(names, mode)?;
        debug!(database = %self.config.name, ?names, %mode, "transaction started");
        settle(txn.clone(), None, op(txn)).await
    }

    /// Close the connection. A failed open leaves nothing to close.
    pub async fn close(&self) {
        if let Ok(conn) = self.connection().await {
            conn.close();
            info!(database = %self.config.name, "database closed");
        }
    }
}

/// Upgrade callback: create what the configuration declares, then run the
/// caller's hook.
fn upgrade_fn<T: Transaction>(
    config: Arc<DatabaseConfig>,
    hook: Option<UpgradeFn<T>>,
) -> UpgradeFn<T> {
    Box::new(move |change: VersionChange<'_, T>| {
        info!(
            database = %config.name,
            from = change.old_version,
            to = change.new_version,
            "applying schema"
        );
        apply_schema(&config, change.transaction)?;
        match hook {
            Some(hook) => hook(change),
            None => Ok(()),
        }
    })
}

/// Additive and idempotent: existing stores and indexes are left alone.
fn apply_schema<T: Transaction>(config: &DatabaseConfig, txn: &T) -> StoreResult<()> {
    let existing = txn.scope();
    for (name, store_config) in &config.stores {
        let store = if existing.contains(name) {
            let store = txn.object_store(name)?;
            let stored = store.key_path()?;
            if stored != store_config.key_path {
                warn!(
                    store = %name,
                    %stored,
                    configured = %store_config.key_path,
                    "key path cannot change after creation"
                );
            }
            store
        } else {
            debug!(store = %name, "creating store");
            txn.create_object_store(name, &store_config.key_path, store_config.auto_increment)?
        };

        let indexes = store.index_names()?;
        for index in &store_config.indexes {
            if !indexes.contains(&index.name) {
                debug!(store = %name, index = %index.name, "creating index");
                store.create_index(index)?;
            }
        }
    }
    Ok(())
}
