//! Conversions between core values and JS values
//!
//! Records go through `JSON.parse`/`JSON.stringify`, so what IndexedDB
//! stores is exactly the JSON document the core produced.

use cellar_core::{Direction, Key, KeyPath, KeyRange, StoreError, StoreResult};
use serde_json::Value;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{IdbCursorDirection, IdbKeyRange};

use crate::error::js_error;

pub fn value_to_js(value: &Value) -> StoreResult<JsValue> {
    let text = serde_json::to_string(value)?;
    js_sys::JSON::parse(&text).map_err(js_error)
}

pub fn value_from_js(value: &JsValue) -> StoreResult<Value> {
    if value.is_undefined() {
        return Ok(Value::Null);
    }
    let text: String = js_sys::JSON::stringify(value).map_err(js_error)?.into();
    Ok(serde_json::from_str(&text)?)
}

pub fn key_to_js(key: &Key) -> JsValue {
    match key {
        Key::Number(n) => JsValue::from_f64(*n),
        Key::String(s) => JsValue::from_str(s),
        Key::Array(items) => items.iter().map(key_to_js).collect::<js_sys::Array>().into(),
    }
}

pub fn key_from_js(value: &JsValue) -> StoreResult<Key> {
    if let Some(n) = value.as_f64() {
        return Ok(Key::Number(n));
    }
    if let Some(s) = value.as_string() {
        return Ok(Key::String(s));
    }
    if let Some(array) = value.dyn_ref::<js_sys::Array>() {
        return array
            .iter()
            .map(|item| key_from_js(&item))
            .collect::<StoreResult<Vec<_>>>()
            .map(Key::Array);
    }
    Err(StoreError::data(format!(
        "unsupported key type: {:?}",
        value.js_typeof()
    )))
}

pub fn key_path_to_js(path: &KeyPath) -> JsValue {
    match path {
        KeyPath::Single(path) => JsValue::from_str(path),
        KeyPath::Compound(paths) => paths
            .iter()
            .map(|p| JsValue::from_str(p))
            .collect::<js_sys::Array>()
            .into(),
    }
}

pub fn key_path_from_js(value: &JsValue) -> KeyPath {
    match value.dyn_ref::<js_sys::Array>() {
        Some(array) => KeyPath::Compound(array.iter().filter_map(|v| v.as_string()).collect()),
        None => KeyPath::Single(value.as_string().unwrap_or_default()),
    }
}

/// `IDBKeyRange` for a core range; `null` means the whole source.
pub fn range_to_js(range: Option<&KeyRange>) -> StoreResult<JsValue> {
    let Some(range) = range else {
        return Ok(JsValue::NULL);
    };
    let lower = range.lower.as_ref().map(key_to_js);
    let upper = range.upper.as_ref().map(key_to_js);
    let js_range = match (lower, upper) {
        (None, None) => return Ok(JsValue::NULL),
        (Some(lower), None) => IdbKeyRange::lower_bound_with_open(&lower, range.lower_open),
        (None, Some(upper)) => IdbKeyRange::upper_bound_with_open(&upper, range.upper_open),
        (Some(lower), Some(upper)) => IdbKeyRange::bound_with_lower_open_and_upper_open(
            &lower,
            &upper,
            range.lower_open,
            range.upper_open,
        ),
    };
    js_range.map(JsValue::from).map_err(js_error)
}

pub fn direction_to_js(direction: Direction) -> IdbCursorDirection {
    match direction {
        Direction::Next => IdbCursorDirection::Next,
        Direction::NextUnique => IdbCursorDirection::Nextunique,
        Direction::Prev => IdbCursorDirection::Prev,
        Direction::PrevUnique => IdbCursorDirection::Prevunique,
    }
}
