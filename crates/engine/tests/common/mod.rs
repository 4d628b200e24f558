//! Shared helpers for engine integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use soupstore_core::SoupIndex;
use soupstore_engine::{SoupStore, StoreManager};
use std::sync::Arc;
use tempfile::TempDir;

pub const CONTACTS: &str = "contacts";

/// Route engine logs to the test output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Manager over an unencrypted root in `dir`
pub fn manager(dir: &TempDir) -> StoreManager {
    init_tracing();
    StoreManager::builder()
        .root(dir.path())
        .unencrypted()
        .build()
        .unwrap()
}

/// Fresh temp root with one open global store
pub fn setup() -> (TempDir, StoreManager, Arc<SoupStore>) {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let store = manager.shared_global_store("test").unwrap();
    (dir, manager, store)
}

pub fn contact_indexes() -> Vec<SoupIndex> {
    vec![SoupIndex::string("name"), SoupIndex::integer("age")]
}

/// Store with a `contacts` soup indexed on `name` and `age`
pub fn setup_contacts() -> (TempDir, StoreManager, Arc<SoupStore>) {
    let (dir, manager, store) = setup();
    store.register_soup(CONTACTS, &contact_indexes()).unwrap();
    (dir, manager, store)
}

pub fn contact(name: &str, age: i64) -> Value {
    json!({ "name": name, "age": age })
}

pub fn id_of(entry: &Value) -> i64 {
    entry["_soupEntryId"].as_i64().unwrap()
}

pub fn created_of(entry: &Value) -> i64 {
    entry["_soupCreatedDate"].as_i64().unwrap()
}

pub fn last_modified_of(entry: &Value) -> i64 {
    entry["_soupLastModifiedDate"].as_i64().unwrap()
}

/// Document without its system fields
pub fn strip_system_fields(entry: &Value) -> Value {
    let mut entry = entry.clone();
    if let Some(map) = entry.as_object_mut() {
        map.remove("_soupEntryId");
        map.remove("_soupCreatedDate");
        map.remove("_soupLastModifiedDate");
    }
    entry
}
