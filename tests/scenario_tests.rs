//! End-to-end scenarios through the public facade

use proptest::prelude::*;
use serde_json::{json, Value};
use soupstore::{
    AlterStatus, ErrorCode, QuerySpec, SortOrder, SoupIndex, SoupSpec, SoupStore, StoreManager,
    StoreScope, UserAccount,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open(dir: &TempDir, name: &str) -> (StoreManager, Arc<SoupStore>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let manager = StoreManager::builder()
        .root(dir.path())
        .unencrypted()
        .build()
        .unwrap();
    let store = manager.shared_global_store(name).unwrap();
    (manager, store)
}

fn id_of(entry: &Value) -> i64 {
    entry["_soupEntryId"].as_i64().unwrap()
}

#[test]
fn test_offline_sync_round() {
    let dir = TempDir::new().unwrap();
    let manager = StoreManager::builder()
        .root(dir.path())
        .unencrypted()
        .build()
        .unwrap();
    let scope = StoreScope::User(UserAccount::new("00Dorg", "005user"));
    let store = manager.shared_store("smartstore", &scope).unwrap();

    store
        .register_soup(
            "accounts",
            &[
                SoupIndex::string("Id"),
                SoupIndex::string("Name"),
                SoupIndex::string("__local__"),
            ],
        )
        .unwrap();

    // Records arrive from the server
    store
        .upsert_entries_with_external_id(
            "accounts",
            vec![
                json!({ "Id": "001A", "Name": "Acme", "__local__": false }),
                json!({ "Id": "001B", "Name": "Globex", "__local__": false }),
            ],
            "Id",
        )
        .unwrap();

    // Local edit marks the record dirty
    let acme_id = store
        .lookup_soup_entry_id("accounts", "Id", &json!("001A"))
        .unwrap();
    let mut acme = store.retrieve_entries("accounts", &[acme_id]).unwrap().remove(0);
    acme["Name"] = json!("Acme Corp");
    acme["__local__"] = json!(true);
    store.upsert_entries("accounts", vec![acme]).unwrap();
    assert_eq!(store.dirty_entry_ids("accounts").unwrap(), vec![acme_id]);

    // Sync down again after the push clears the flag
    store
        .upsert_entries_with_external_id(
            "accounts",
            vec![json!({ "Id": "001A", "Name": "Acme Corp", "__local__": false })],
            "Id",
        )
        .unwrap();
    assert!(store.dirty_entry_ids("accounts").unwrap().is_empty());
    assert_eq!(store.count(&QuerySpec::all("accounts", 10)).unwrap(), 2);

    let names = QuerySpec::smart(
        "select {accounts:Name} from {accounts} order by {accounts:Name}",
        10,
    );
    assert_eq!(
        store.query(&names, 0).unwrap(),
        vec![json!(["Acme Corp"]), json!(["Globex"])]
    );
}

#[test]
fn test_alteration_survives_restart() {
    let dir = TempDir::new().unwrap();
    let stored = {
        let (_manager, store) = open(&dir, "app");
        store
            .register_soup("notes", &[SoupIndex::string("title")])
            .unwrap();
        let stored = store
            .upsert_entries(
                "notes",
                (0..20)
                    .map(|i| json!({ "title": format!("n{}", i), "body": format!("text {}", i) }))
                    .collect(),
            )
            .unwrap();
        store
            .alter_soup_until(
                "notes",
                &SoupSpec::external("notes"),
                &[SoupIndex::string("title"), SoupIndex::full_text("body")],
                true,
                Some(AlterStatus::DataReindexed),
            )
            .unwrap();
        stored
    };

    let (_manager, store) = open(&dir, "app");
    assert!(store.long_operations().unwrap().is_empty());
    assert!(store.soup_spec("notes").unwrap().is_external());
    let ids: Vec<i64> = stored.iter().map(id_of).collect();
    assert_eq!(store.retrieve_entries("notes", &ids).unwrap(), stored);
    assert_eq!(
        store
            .count(&QuerySpec::full_text("notes", Some("body".into()), "7", 10))
            .unwrap(),
        1
    );
}

#[test]
fn test_concurrent_writers_share_one_store() {
    let dir = TempDir::new().unwrap();
    let (manager, store) = open(&dir, "busy");
    store
        .register_soup("events", &[SoupIndex::integer("writer")])
        .unwrap();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let store = manager.shared_global_store("busy").unwrap();
                for seq in 0..25 {
                    store
                        .upsert_entries("events", vec![json!({ "writer": writer, "seq": seq })])
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.count(&QuerySpec::all("events", 10)).unwrap(), 100);
    for writer in 0..4 {
        assert_eq!(
            store
                .count(&QuerySpec::exact("events", "writer", writer, 10))
                .unwrap(),
            25
        );
    }
    let ids: Vec<i64> = store
        .query(&QuerySpec::all("events", 100), 0)
        .unwrap()
        .iter()
        .map(id_of)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_unindexed_paths_are_rejected(path in "[a-z]{1,6}(\\.[a-z]{1,6})?") {
        prop_assume!(path != "name");
        let dir = TempDir::new().unwrap();
        let (_manager, store) = open(&dir, "props");
        store.register_soup("contacts", &[SoupIndex::string("name")]).unwrap();

        let specs = [
            QuerySpec::range("contacts", path.as_str(), Some(json!(1)), None, 10),
            QuerySpec::like("contacts", path.as_str(), "a%", 10),
            QuerySpec::all("contacts", 10).order_by(path.as_str(), SortOrder::Descending),
        ];
        for spec in specs {
            prop_assert_eq!(store.query(&spec, 0).unwrap_err().code(), ErrorCode::PathNotIndexed);
        }
    }
}
