#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::handle::Handle;
use crate::registry::Registry;

async fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_mode_stores_writes() {
    let reg = Registry::new();
    let store = Arc::new(MemoryStore::new());
    let _persist = Persist::start(&reg, store.clone(), "/Local/").unwrap();

    let item = Handle::open(&reg, "/Local/Cfg/name").unwrap();
    item.set_save_mode();
    item.set_string("stored value");

    wait_until(
        || {
            store
                .value_of("/Local/Cfg/name")
                .map(|v| v.ends_with(b"stored value"))
                .unwrap_or(false)
        },
        "value stored",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stored_value_loads_on_save_mode() {
    let reg = Registry::new();
    let store = Arc::new(MemoryStore::new());
    store.insert_db_value("/Local/Cfg/greet", b"from the store").await.unwrap();

    let _persist = Persist::start(&reg, store.clone(), "/Local/").unwrap();

    let item = Handle::open(&reg, "/Local/Cfg/greet").unwrap();
    item.set_save_mode();

    wait_until(
        || item.to_string_val().as_deref() == Some("from the store"),
        "value loaded",
    )
    .await;

    // A persist load is a local write (only remote imports are excluded
    // from the update count).
    assert_eq!(item.local_update_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mandatory_entries_preload() {
    let reg = Registry::new();
    let store = Arc::new(MemoryStore::new());
    let id = store.insert_db_value("/Local/Boot/flag", b"1").await.unwrap();
    store.update_db_mandatory(id, true).await.unwrap();

    let _persist = Persist::start(&reg, store.clone(), "/Local/").unwrap();

    wait_until(|| reg.get_string("/Local/Boot/flag").as_deref() == Some("1"), "preloaded").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_mandatory_marks_store() {
    let reg = Registry::new();
    let store = Arc::new(MemoryStore::new());
    let persist = Persist::start(&reg, store.clone(), "/Local/").unwrap();

    assert!(persist.set_mandatory("/Local/Keep/me", true).await);
    let id = store.get_db_id("/Local/Keep/me").await.unwrap().expect("entry created");
    let ids = store.mandatory_store_ids().await.unwrap();
    assert!(ids.contains(&id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_store_bookkeeping() {
    let store = MemoryStore::new();
    let id = store.insert_db_value("/p", b"v1").await.unwrap();

    assert_eq!(store.get_db_id("/p").await.unwrap(), Some(id));
    assert_eq!(store.get_db_value(id).await.unwrap(), Some(("/p".to_string(), b"v1".to_vec())));

    store.update_db_value(id, b"v2").await.unwrap();
    assert_eq!(store.value_of("/p"), Some(b"v2".to_vec()));

    store.update_db_used(id, false).await.unwrap();
    store.update_db_mandatory(id, true).await.unwrap();
    assert_eq!(store.mandatory_store_ids().await.unwrap(), vec![id]);

    assert!(store.update_db_value(999, b"x").await.is_err());
}
