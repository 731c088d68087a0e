//! Validator adapter
//!
//! The schema library is external; a collection only needs something that
//! turns a candidate document into either its normalized form or a list of
//! issues. Validation always runs before a transaction is opened.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Issue;

/// Schema check applied to records before they are written.
pub trait Validator: Send + Sync {
    /// Returns the normalized document, or every issue found.
    fn validate(&self, candidate: &Value) -> Result<Value, Vec<Issue>>;
}

/// Shared validator handle as stored in configuration.
pub type SharedValidator = Arc<dyn Validator>;

/// Validator built from a closure.
pub struct FnValidator<F> {
    check: F,
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> Result<Value, Vec<Issue>> + Send + Sync,
{
    fn validate(&self, candidate: &Value) -> Result<Value, Vec<Issue>> {
        (self.check)(candidate)
    }
}

impl<F> fmt::Debug for FnValidator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnValidator")
    }
}

/// Wrap a closure as a shared validator.
pub fn validator_fn<F>(check: F) -> SharedValidator
where
    F: Fn(&Value) -> Result<Value, Vec<Issue>> + Send + Sync + 'static,
{
    Arc::new(FnValidator { check })
}

/// Uses a serde type as the schema.
///
/// The candidate is deserialized into `S` and serialized back, so defaults
/// are filled in and fields `S` does not know are dropped.
pub struct SchemaValidator<S> {
    _schema: PhantomData<fn() -> S>,
}

impl<S> SchemaValidator<S>
where
    S: Serialize + DeserializeOwned + 'static,
{
    pub fn new() -> Self {
        Self {
            _schema: PhantomData,
        }
    }

    pub fn shared() -> SharedValidator {
        Arc::new(Self::new())
    }
}

impl<S> Default for SchemaValidator<S>
where
    S: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Validator for SchemaValidator<S>
where
    S: Serialize + DeserializeOwned,
{
    fn validate(&self, candidate: &Value) -> Result<Value, Vec<Issue>> {
        let typed: S = serde_json::from_value(candidate.clone())
            .map_err(|e| vec![Issue::new("", e.to_string())])?;
        serde_json::to_value(&typed).map_err(|e| vec![Issue::new("", e.to_string())])
    }
}
