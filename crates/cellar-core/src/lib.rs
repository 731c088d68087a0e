//! Cellar Core
//!
//! A typed data-access layer over a transactional key/value store with
//! IndexedDB semantics. It runs identically in the browser (WASM, with the
//! `cellar-indexeddb` engine) and natively (with [`engine::MemoryEngine`]).
//!
//! - [`Database`] opens or upgrades the store from a declarative
//!   [`DatabaseConfig`] and hands out collections
//! - [`Collection`] validates, reads and writes records, runs cursor queries
//!   and brute-force vector search
//! - [`engine`] holds the storage traits a backend implements
//!
//! # Example
//!
//! ```rust
//! use cellar_core::{Database, DatabaseConfig, QueryOptions, StoreConfig};
//! use cellar_core::engine::MemoryEngine;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     id: u32,
//!     age: u32,
//! }
//!
//! # async fn run() -> cellar_core::StoreResult<()> {
//! let config = DatabaseConfig::new("app", 1)
//!     .store("users", StoreConfig::new("id").index("age"));
//! let db = Database::open(MemoryEngine::new(), config).await?;
//! let users = db.collection::<User>("users").await?;
//!
//! users.add(&User { id: 1, age: 30 }, None).await?;
//! let adults = users
//!     .query(Some(&|u: &User| u.age >= 18), QueryOptions::new().index("age").limit(10))
//!     .await?;
//! assert_eq!(adults.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod key;
pub mod similarity;
pub mod validate;

// Re-export main types at crate root
pub use collection::{Collection, QueryOptions, Ranked, Txn, DEFAULT_SIMILAR_LIMIT};
pub use config::{DatabaseConfig, IndexSpec, StoreConfig, VectorOptions, DEFAULT_VECTOR_FIELD};
pub use database::Database;
pub use engine::TransactionMode;
pub use error::{Issue, StorageErrorKind, StoreError, StoreResult};
pub use key::{Direction, Key, KeyPath, KeyRange};
pub use similarity::{
    cosine_similarity, CosineRanker, DotProductRanker, EuclideanRanker, Metric, Ranker, Scored,
};
pub use tokio_util::sync::CancellationToken;
pub use validate::{validator_fn, SchemaValidator, SharedValidator, Validator};
