//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use cellar_core::engine::{MemoryConnection, MemoryEngine};
use cellar_core::{Database, DatabaseConfig, IndexSpec, StoreConfig, VectorOptions};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Route engine logs to the test harness. `RUST_LOG=cellar_core=debug`
/// shows every transaction.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_test_writer())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub name: String,
    pub email: String,
    pub age: u32,
}

pub fn user(id: u32, name: &str, age: u32) -> User {
    User {
        id,
        name: name.to_string(),
        email: format!("{}@example.com", name),
        age,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

pub fn doc(id: u32, title: &str, embedding: &[f32]) -> Doc {
    Doc {
        id: Some(id),
        title: title.to_string(),
        embedding: Some(embedding.to_vec()),
    }
}

/// `users` keyed by id with a unique email index and an age index; `docs`
/// auto-incremented with 2-dimensional embeddings.
pub fn app_config(version: u32) -> DatabaseConfig {
    DatabaseConfig::new("app", version)
        .store(
            "users",
            StoreConfig::new("id")
                .index(IndexSpec::new("by_email", "email").unique(true))
                .index(IndexSpec::new("by_age", "age")),
        )
        .store(
            "docs",
            StoreConfig::new("id")
                .auto_increment(true)
                .vector(VectorOptions::new("embedding", 2)),
        )
}

pub async fn open_app(engine: &MemoryEngine) -> Database<MemoryEngine> {
    init_tracing();
    Database::open(engine.clone(), app_config(1)).await.unwrap()
}

pub type Users = cellar_core::Collection<User, MemoryConnection>;
pub type Docs = cellar_core::Collection<Doc, MemoryConnection>;
