//! Database lifecycle, schema upgrade and cross-collection transaction tests

mod common;

use cellar_core::engine::{
    Connection, MemoryEngine, MemoryTransaction, ObjectStore, Transaction, VersionChange,
};
use cellar_core::{
    Database, DatabaseConfig, IndexSpec, Metric, QueryOptions, StorageErrorKind, StoreConfig,
    StoreError, TransactionMode, VectorOptions,
};
use common::{app_config, doc, init_tracing, open_app, user, Doc, User};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_open_creates_declared_stores() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;

    assert_eq!(db.name(), "app");
    assert_eq!(db.version(), 1);
    assert_eq!(engine.database_names(), vec!["app".to_string()]);

    let conn = db.connection().await.unwrap();
    assert_eq!(conn.version(), 1);
    assert_eq!(
        conn.collection_names(),
        vec!["docs".to_string(), "users".to_string()]
    );
}

#[tokio::test]
async fn test_unknown_collection_is_not_found() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;

    let result = db.collection::<User>("orders").await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_unknown_collection_fails_before_open() {
    init_tracing();
    let engine = MemoryEngine::new();
    engine.set_denied(true);
    let db = Database::new(engine, app_config(1));

    // the open would fail with Denied; the name check comes first
    let result = db.collection::<User>("orders").await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_open_failure_reaches_every_caller() {
    init_tracing();
    let engine = MemoryEngine::new();
    engine.set_denied(true);
    let db = Database::new(engine, app_config(1));

    let (users, docs) = tokio::join!(
        db.collection::<User>("users"),
        db.collection::<Doc>("docs")
    );
    assert_eq!(
        users.err().and_then(|e| e.storage_kind()),
        Some(StorageErrorKind::Denied)
    );
    assert_eq!(
        docs.err().and_then(|e| e.storage_kind()),
        Some(StorageErrorKind::Denied)
    );
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    init_tracing();
    let engine = MemoryEngine::new();

    let result = Database::open(engine.clone(), app_config(0)).await;
    assert!(matches!(result, Err(StoreError::Config(_))));

    let no_key = DatabaseConfig::new("broken", 1).store("things", StoreConfig::new(""));
    let result = Database::open(engine.clone(), no_key).await;
    assert!(matches!(result, Err(StoreError::Config(_))));
    assert!(engine.database_names().is_empty());
}

#[tokio::test]
async fn test_open_from_json_config() {
    init_tracing();
    let config = DatabaseConfig::from_json(
        r#"{
            "name": "library",
            "version": 1,
            "stores": {
                "books": {
                    "keyPath": "id",
                    "indexes": ["title"],
                    "vectorOptions": {"field": "embedding", "dimensions": 2, "metric": "dot"}
                }
            }
        }"#,
    )
    .unwrap();
    assert_eq!(
        config.get("books").and_then(|s| s.vector.clone()),
        Some(VectorOptions::new("embedding", 2).metric(Metric::DotProduct))
    );

    let db = Database::open(MemoryEngine::new(), config).await.unwrap();
    let books = db.collection::<Doc>("books").await.unwrap();
    assert_eq!(books.ranker().name(), "dot");

    books.add(&doc(1, "dune", &[1.0, 0.0]), None).await.unwrap();
    let by_title = books
        .query(None, QueryOptions::new().index("title"))
        .await
        .unwrap();
    assert_eq!(by_title.len(), 1);
}

#[tokio::test]
async fn test_upgrade_is_additive() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;
    let users = db.collection::<User>("users").await.unwrap();
    users.add(&user(1, "alice", 30), None).await.unwrap();
    db.close().await;

    let v2 = app_config(2).store("tags", StoreConfig::new("name"));
    let db = Database::open(engine.clone(), v2).await.unwrap();
    assert_eq!(db.version(), 2);

    let users = db.collection::<User>("users").await.unwrap();
    assert_eq!(users.get(1).await.unwrap(), Some(user(1, "alice", 30)));
    let conn = db.connection().await.unwrap();
    assert!(conn.collection_names().contains(&"tags".to_string()));
}

#[tokio::test]
async fn test_upgrade_blocked_by_open_connection() {
    let engine = MemoryEngine::new();
    let v1 = open_app(&engine).await;

    let blocked = Database::open(engine.clone(), app_config(2)).await;
    assert_eq!(
        blocked.err().and_then(|e| e.storage_kind()),
        Some(StorageErrorKind::Blocked)
    );

    v1.close().await;
    let v2 = Database::open(engine.clone(), app_config(2)).await.unwrap();
    assert_eq!(v2.version(), 2);
}

#[tokio::test]
async fn test_version_downgrade_fails() {
    let engine = MemoryEngine::new();
    let db = Database::open(engine.clone(), app_config(3)).await.unwrap();
    db.close().await;

    let result = Database::open(engine.clone(), app_config(2)).await;
    assert_eq!(
        result.err().and_then(|e| e.storage_kind()),
        Some(StorageErrorKind::Version)
    );
}

#[tokio::test]
async fn test_upgrade_hook_manages_indexes() {
    init_tracing();
    let engine = MemoryEngine::new();
    let db = Database::open_with_upgrade(
        engine.clone(),
        app_config(1),
        |change: VersionChange<'_, MemoryTransaction>| {
            assert_eq!(change.old_version, 0);
            assert_eq!(change.new_version, 1);
            let users = change.transaction.object_store("users")?;
            users.create_index(&IndexSpec::new("by_name", "name"))?;
            users.delete_index("by_age")?;
            Ok(())
        },
    )
    .await
    .unwrap();

    let users = db.collection::<User>("users").await.unwrap();
    users
        .add_all(&[user(1, "zoe", 20), user(2, "adam", 40)], None)
        .await
        .unwrap();
    let by_name = users
        .query(None, QueryOptions::new().index("by_name"))
        .await
        .unwrap();
    assert_eq!(by_name.iter().map(|u| u.id).collect::<Vec<_>>(), vec![2, 1]);

    let dropped = users
        .query(None, QueryOptions::new().index("by_age"))
        .await;
    assert!(matches!(dropped, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_hook_does_not_run_without_version_change() {
    let engine = MemoryEngine::new();
    open_app(&engine).await.close().await;

    let db = Database::open_with_upgrade(
        engine.clone(),
        app_config(1),
        |_: VersionChange<'_, MemoryTransaction>| {
            Err(StoreError::Config("hook must not run".into()))
        },
    )
    .await;
    assert!(db.is_ok());
}

#[tokio::test]
async fn test_failed_hook_aborts_upgrade() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;
    db.collection::<User>("users")
        .await
        .unwrap()
        .add(&user(1, "alice", 30), None)
        .await
        .unwrap();
    db.close().await;

    let v2 = app_config(2).store("tags", StoreConfig::new("name"));
    let result = Database::open_with_upgrade(
        engine.clone(),
        v2,
        |_: VersionChange<'_, MemoryTransaction>| {
            Err(StoreError::Config("migration failed".into()))
        },
    )
    .await;
    assert!(matches!(result, Err(StoreError::Config(_))));

    // still at version 1 with the old data
    let db = open_app(&engine).await;
    let conn = db.connection().await.unwrap();
    assert_eq!(conn.version(), 1);
    assert!(!conn.collection_names().contains(&"tags".to_string()));
    let users = db.collection::<User>("users").await.unwrap();
    assert_eq!(users.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_first_open_leaves_no_database() {
    init_tracing();
    let engine = MemoryEngine::new();
    let result = Database::open_with_upgrade(
        engine.clone(),
        app_config(1),
        |_: VersionChange<'_, MemoryTransaction>| Err(StoreError::Config("nope".into())),
    )
    .await;
    assert!(result.is_err());
    assert!(engine.database_names().is_empty());
}

#[tokio::test]
async fn test_create_index_outside_upgrade_is_invalid_state() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;
    let users = db.collection::<User>("users").await.unwrap();

    let conn = db.connection().await.unwrap();
    let txn = conn
        .transaction(&["users"], TransactionMode::ReadWrite)
        .unwrap();
    let err = users
        .create_index(&IndexSpec::new("by_name", "name"), &txn)
        .unwrap_err();
    assert_eq!(err.storage_kind(), Some(StorageErrorKind::InvalidState));
    txn.abort();
}

#[tokio::test]
async fn test_transaction_spans_collections() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;
    let users = db.collection::<User>("users").await.unwrap();
    let docs = db.collection::<Doc>("docs").await.unwrap();

    let (u, d) = (users.clone(), docs.clone());
    let key = db
        .transaction(&["users", "docs"], TransactionMode::ReadWrite, |txn| async move {
            u.add(&user(1, "alice", 30), Some(&txn)).await?;
            d.add(&doc(1, "profile", &[1.0, 0.0]), Some(&txn)).await
        })
        .await
        .unwrap();
    assert_eq!(key, 1.into());
    assert_eq!(users.count().await.unwrap(), 1);
    assert_eq!(docs.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_cross_collection_failure_rolls_back_both() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;
    let users = db.collection::<User>("users").await.unwrap();
    let docs = db.collection::<Doc>("docs").await.unwrap();
    docs.add(&doc(1, "existing", &[0.0, 1.0]), None).await.unwrap();

    let (u, d) = (users.clone(), docs.clone());
    let result = db
        .transaction(&["users", "docs"], TransactionMode::ReadWrite, |txn| async move {
            u.add(&user(1, "alice", 30), Some(&txn)).await?;
            d.add(&doc(1, "duplicate", &[1.0, 0.0]), Some(&txn)).await
        })
        .await;

    assert!(matches!(result, Err(StoreError::Constraint(_))));
    assert_eq!(users.count().await.unwrap(), 0);
    assert_eq!(docs.get_all().await.unwrap(), vec![doc(1, "existing", &[0.0, 1.0])]);
}

#[tokio::test]
async fn test_transaction_with_unknown_collection_fails() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;

    let result = db
        .transaction(&["users", "orders"], TransactionMode::ReadOnly, |_txn| async {
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_closed_connection_rejects_transactions() {
    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;
    let users = db.collection::<User>("users").await.unwrap();
    db.close().await;

    let err = users.count().await.unwrap_err();
    assert_eq!(err.storage_kind(), Some(StorageErrorKind::Closed));
}

#[tokio::test]
async fn test_delete_database() {
    use cellar_core::engine::StorageEngine;

    let engine = MemoryEngine::new();
    let db = open_app(&engine).await;

    let busy = engine.delete_database("app").await;
    assert_eq!(
        busy.err().and_then(|e| e.storage_kind()),
        Some(StorageErrorKind::Blocked)
    );

    db.close().await;
    engine.delete_database("app").await.unwrap();
    assert!(engine.database_names().is_empty());

    // deleting a missing database is fine
    engine.delete_database("app").await.unwrap();
}
