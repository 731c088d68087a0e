//! Low-level IndexedDB helpers using web-sys
//!
//! Wraps the callback-based IndexedDB API into Rust futures using
//! `wasm_bindgen_futures::JsFuture` and `js_sys::Promise`. Every promise
//! settles exactly once: requests on `success`/`error`, transactions on
//! `complete`/`abort`, opens additionally on `blocked`.

use std::cell::RefCell;
use std::rc::Rc;

use js_sys::Promise;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{DomException, IdbDatabase, IdbFactory, IdbOpenDbRequest, IdbRequest, IdbTransaction};

use crate::error::{IndexedDbError, Result};

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;

/// Get the global IndexedDB factory.
pub fn idb_factory() -> Result<IdbFactory> {
    let global = js_sys::global();

    let idb: JsValue = js_sys::Reflect::get(&global, &"indexedDB".into())
        .map_err(|_| IndexedDbError::NotAvailable("no indexedDB on global".into()))?;

    if idb.is_undefined() || idb.is_null() {
        return Err(IndexedDbError::NotAvailable(
            "indexedDB is null/undefined".into(),
        ));
    }

    idb.dyn_into::<IdbFactory>()
        .map_err(|_| IndexedDbError::NotAvailable("indexedDB is not IdbFactory".into()))
}

/// A `DOMException` value, falling back to a plain string if the
/// constructor is unavailable.
fn dom_exception(message: &str, name: &str) -> JsValue {
    DomException::new_with_message_and_name(message, name)
        .map(JsValue::from)
        .unwrap_or_else(|_| JsValue::from_str(message))
}

/// Convert an IdbRequest into a JS Promise that resolves with the request's
/// result and rejects with its `DOMException`.
pub fn request_to_promise(req: &IdbRequest) -> Promise {
    let req = req.clone();

    Promise::new(&mut move |resolve, reject| {
        // Store closures in Rc<RefCell> to manage their lifetime without leaking
        let closures: Rc<RefCell<Option<(EventClosure, EventClosure)>>> =
            Rc::new(RefCell::new(None));

        let req_s = req.clone();
        let closures_for_success = closures.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::UNDEFINED);
            let _ = resolve.call1(&JsValue::UNDEFINED, &result);
            *closures_for_success.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req.clone();
        let closures_for_error = closures.clone();
        let on_error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let err = req_e
                .error()
                .ok()
                .flatten()
                .map(JsValue::from)
                .unwrap_or_else(|| dom_exception("request failed", "UnknownError"));
            let _ = reject.call1(&JsValue::UNDEFINED, &err);
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        req.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        // Keep both closures alive until one fires
        *closures.borrow_mut() = Some((on_success, on_error));
    })
}

/// Promise settling when a transaction finishes.
///
/// Resolves on `complete`. Rejects on `abort` with the transaction's error
/// (the failed request's `DOMException`, or a quota error raised at commit),
/// or an `AbortError` when the caller aborted explicitly.
pub fn transaction_to_promise(tx: &IdbTransaction) -> Promise {
    let tx = tx.clone();

    Promise::new(&mut move |resolve, reject| {
        let closures: Rc<RefCell<Option<(EventClosure, EventClosure)>>> =
            Rc::new(RefCell::new(None));

        let closures_for_complete = closures.clone();
        let on_complete = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let _ = resolve.call0(&JsValue::UNDEFINED);
            *closures_for_complete.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let tx_a = tx.clone();
        let closures_for_abort = closures.clone();
        let on_abort = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let err = tx_a
                .error()
                .map(JsValue::from)
                .unwrap_or_else(|| dom_exception("transaction was aborted", "AbortError"));
            let _ = reject.call1(&JsValue::UNDEFINED, &err);
            *closures_for_abort.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        tx.set_oncomplete(Some(on_complete.as_ref().unchecked_ref()));
        tx.set_onabort(Some(on_abort.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some((on_complete, on_abort));
    })
}

/// Promise for an open request.
///
/// A `blocked` event rejects immediately. If the open still succeeds later,
/// once the other connections close, the late connection is closed again.
pub fn open_request_to_promise(req: &IdbOpenDbRequest, name: &str) -> Promise {
    let req = req.clone();
    let name = name.to_string();

    Promise::new(&mut move |resolve, reject| {
        let closures: Rc<RefCell<Option<(EventClosure, EventClosure, EventClosure)>>> =
            Rc::new(RefCell::new(None));
        let blocked = Rc::new(RefCell::new(false));

        let req_s = req.clone();
        let blocked_s = blocked.clone();
        let closures_for_success = closures.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::UNDEFINED);
            if *blocked_s.borrow() {
                if let Some(db) = result.dyn_ref::<IdbDatabase>() {
                    db.close();
                }
            } else {
                let _ = resolve.call1(&JsValue::UNDEFINED, &result);
            }
            *closures_for_success.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req.clone();
        let reject_e = reject.clone();
        let closures_for_error = closures.clone();
        let on_error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let err = req_e
                .error()
                .ok()
                .flatten()
                .map(JsValue::from)
                .unwrap_or_else(|| dom_exception("open failed", "UnknownError"));
            let _ = reject_e.call1(&JsValue::UNDEFINED, &err);
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let name = name.clone();
        let on_blocked = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            *blocked.borrow_mut() = true;
            let msg = format!("'{}' has open connections on an older version", name);
            let _ = reject.call1(&JsValue::UNDEFINED, &dom_exception(&msg, "BlockedError"));
        }) as Box<dyn FnMut(web_sys::Event)>);

        req.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        req.set_onblocked(Some(on_blocked.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some((on_success, on_error, on_blocked));
    })
}

/// Await a promise made by one of the helpers above.
pub async fn await_promise(promise: Promise) -> Result<JsValue> {
    JsFuture::from(promise).await.map_err(|e| match IndexedDbError::from(e) {
        IndexedDbError::Dom { name, message } if name == "BlockedError" => {
            IndexedDbError::Blocked(message)
        }
        other => other,
    })
}

/// Await an IdbRequest, resolving to its result JsValue.
pub async fn await_request(req: &IdbRequest) -> Result<JsValue> {
    await_promise(request_to_promise(req)).await
}

/// Delete an IndexedDB database by name.
pub async fn delete_database(db_name: &str) -> Result<()> {
    let factory = idb_factory()?;
    let req = factory.delete_database(db_name)?;
    await_promise(open_request_to_promise(&req, db_name)).await?;
    Ok(())
}
