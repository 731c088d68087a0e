//! Declarative database configuration
//!
//! Configuration is immutable once a [`Database`](crate::Database) is built.
//! Structural changes go through a version bump: on upgrade every missing
//! collection and index declared here is created, nothing is ever dropped.
//!
//! ```rust
//! use cellar_core::config::{DatabaseConfig, StoreConfig, VectorOptions};
//!
//! let config = DatabaseConfig::new("notes", 1)
//!     .store("notes", StoreConfig::new("id").index("created_at"))
//!     .store(
//!         "chunks",
//!         StoreConfig::new("id")
//!             .auto_increment(true)
//!             .vector(VectorOptions::new("embedding", 384)),
//!     );
//! assert!(config.validate().is_ok());
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::key::KeyPath;
use crate::similarity::Metric;
use crate::validate::SharedValidator;

/// Field name searched when a store declares no vector options.
pub const DEFAULT_VECTOR_FIELD: &str = "embedding";

/// Top-level configuration: database name, schema version and stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub stores: BTreeMap<String, StoreConfig>,
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            stores: BTreeMap::new(),
        }
    }

    /// Parse a configuration from JSON. Validators are attached afterwards
    /// with [`DatabaseConfig::with_validator`].
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn store(mut self, name: impl Into<String>, store: StoreConfig) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    /// Attach a validator to an already declared store.
    pub fn with_validator(mut self, store: &str, validator: SharedValidator) -> StoreResult<Self> {
        let config = self
            .stores
            .get_mut(store)
            .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", store)))?;
        config.validator = Some(validator);
        Ok(self)
    }

    pub fn get(&self, store: &str) -> Option<&StoreConfig> {
        self.stores.get(store)
    }

    /// Check the configuration for inconsistencies before opening.
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::Config("database name is empty".into()));
        }
        if self.version == 0 {
            return Err(StoreError::Config("database version must be at least 1".into()));
        }
        for (name, store) in &self.stores {
            store
                .validate()
                .map_err(|msg| StoreError::Config(format!("store '{}': {}", name, msg)))?;
        }
        Ok(())
    }
}

/// Per-collection configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub key_path: KeyPath,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default, rename = "vectorOptions")]
    pub vector: Option<VectorOptions>,
    #[serde(skip)]
    pub validator: Option<SharedValidator>,
}

impl StoreConfig {
    pub fn new(key_path: impl Into<KeyPath>) -> Self {
        Self {
            key_path: key_path.into(),
            auto_increment: false,
            indexes: Vec::new(),
            vector: None,
            validator: None,
        }
    }

    pub fn auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    pub fn index(mut self, index: impl Into<IndexSpec>) -> Self {
        self.indexes.push(index.into());
        self
    }

    pub fn vector(mut self, options: VectorOptions) -> Self {
        self.vector = Some(options);
        self
    }

    pub fn validator(mut self, validator: SharedValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Field holding each record's embedding.
    pub fn vector_field(&self) -> &str {
        self.vector
            .as_ref()
            .map(|v| v.field.as_str())
            .unwrap_or(DEFAULT_VECTOR_FIELD)
    }

    fn validate(&self) -> Result<(), String> {
        if self.key_path.is_empty() {
            return Err("key path is empty".into());
        }
        if self.auto_increment && matches!(self.key_path, KeyPath::Compound(_)) {
            return Err("auto increment requires a single key path".into());
        }
        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() || index.key_path.is_empty() {
                return Err("index name and key path must be set".into());
            }
            if !seen.insert(index.name.as_str()) {
                return Err(format!("duplicate index '{}'", index.name));
            }
            if index.multi_entry && matches!(index.key_path, KeyPath::Compound(_)) {
                return Err(format!(
                    "multi-entry index '{}' needs a single key path",
                    index.name
                ));
            }
        }
        if let Some(vector) = &self.vector {
            if vector.field.is_empty() {
                return Err("vector field is empty".into());
            }
            if vector.dimensions == 0 {
                return Err("vector dimensions must be positive".into());
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("key_path", &self.key_path)
            .field("auto_increment", &self.auto_increment)
            .field("indexes", &self.indexes)
            .field("vector", &self.vector)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Secondary index declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "IndexDecl")]
pub struct IndexSpec {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn multi_entry(mut self, multi_entry: bool) -> Self {
        self.multi_entry = multi_entry;
        self
    }
}

/// A bare field name declares an index named after that field.
impl From<&str> for IndexSpec {
    fn from(field: &str) -> Self {
        IndexSpec::new(field, field)
    }
}

impl From<String> for IndexSpec {
    fn from(field: String) -> Self {
        IndexSpec::new(field.clone(), field)
    }
}

/// Accepts either `"field"` or a full object in JSON configs.
#[derive(Deserialize)]
#[serde(untagged)]
enum IndexDecl {
    Field(String),
    #[serde(rename_all = "camelCase")]
    Full {
        name: String,
        key_path: Option<KeyPath>,
        #[serde(default)]
        unique: bool,
        #[serde(default)]
        multi_entry: bool,
    },
}

impl From<IndexDecl> for IndexSpec {
    fn from(decl: IndexDecl) -> Self {
        match decl {
            IndexDecl::Field(field) => field.into(),
            IndexDecl::Full {
                name,
                key_path,
                unique,
                multi_entry,
            } => IndexSpec {
                key_path: key_path.unwrap_or_else(|| KeyPath::Single(name.clone())),
                name,
                unique,
                multi_entry,
            },
        }
    }
}

/// Vector search settings for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorOptions {
    #[serde(alias = "vectorField")]
    pub field: String,
    pub dimensions: usize,
    #[serde(default)]
    pub metric: Metric,
}

impl VectorOptions {
    pub fn new(field: impl Into<String>, dimensions: usize) -> Self {
        Self {
            field: field.into(),
            dimensions,
            metric: Metric::default(),
        }
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }
}
