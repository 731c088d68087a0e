//! IndexedDB storage engine for Cellar (browser WASM)
//!
//! Implements the `cellar_core::engine` traits on top of the browser's
//! IndexedDB, so a [`cellar_core::Database`] can run against persistent
//! browser storage with the same semantics it has on the in-memory engine.
//!
//! Records are stored as plain JS objects produced by `JSON.parse`, which
//! keeps them readable from devtools and from other JS code.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellar_core::{Database, DatabaseConfig, StoreConfig};
//! use cellar_indexeddb::IndexedDbEngine;
//!
//! let config = DatabaseConfig::new("notes", 1).store("notes", StoreConfig::new("id"));
//! let db = Database::open(IndexedDbEngine::new(), config).await?;
//! let notes = db.collection::<Note>("notes").await?;
//! notes.add(&note, None).await?;
//! ```

pub mod convert;
pub mod engine;
pub mod error;
pub mod idb;

pub use engine::{
    IndexedDbConnection, IndexedDbCursor, IndexedDbEngine, IndexedDbStore, IndexedDbTransaction,
};
pub use error::{IndexedDbError, Result};
