//! Storage engine abstraction
//!
//! The collection layer talks to storage only through these traits.
//! Implementations exist for:
//!
//! - **Memory**: in-process engine for tests and native use (`MemoryEngine`)
//! - **IndexedDB**: browser storage via web-sys (`cellar-indexeddb` crate, WASM only)

mod memory;
mod traits;

pub use memory::{MemoryConnection, MemoryCursor, MemoryEngine, MemoryStore, MemoryTransaction};
pub use traits::{
    Connection, Cursor, CursorEntry, ObjectStore, StorageEngine, Transaction, TransactionMode,
    UpgradeFn, VersionChange,
};
