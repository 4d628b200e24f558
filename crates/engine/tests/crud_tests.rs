//! Integration tests for the entry CRUD engine
//!
//! Covers identity and timestamp bookkeeping, external-id upserts, batch
//! atomicity, removal, lookups and dirty-entry enumeration.

mod common;

use common::*;
use proptest::prelude::*;
use serde_json::{json, Value};
use soupstore_core::{Error, ErrorCode, QuerySpec, SoupIndex};

fn exact_name(name: &str) -> QuerySpec {
    QuerySpec::exact(CONTACTS, "name", name, 10)
}

// ============================================================================
// Identity and timestamps
// ============================================================================

#[test]
fn test_contacts_scenario() {
    let (_dir, _manager, store) = setup();
    store
        .register_soup(CONTACTS, &[SoupIndex::string("name")])
        .unwrap();
    store
        .upsert_entries(CONTACTS, vec![json!({ "name": "Ann" })])
        .unwrap();

    let found = store.query(&exact_name("Ann"), 0).unwrap();
    assert_eq!(found.len(), 1);
    let ann = &found[0];
    assert_eq!(ann["name"], "Ann");
    assert!(id_of(ann) > 0);
    assert_eq!(created_of(ann), last_modified_of(ann));

    let mut renamed = ann.clone();
    renamed["name"] = json!("Ann B");
    store.upsert_entries(CONTACTS, vec![renamed]).unwrap();

    assert!(store.query(&exact_name("Ann"), 0).unwrap().is_empty());
    let found = store.query(&exact_name("Ann B"), 0).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(id_of(&found[0]), id_of(ann));
    assert_eq!(created_of(&found[0]), created_of(ann));
    assert!(last_modified_of(&found[0]) > last_modified_of(ann));
}

#[test]
fn test_inserts_get_increasing_ids() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(
            CONTACTS,
            vec![contact("Ann", 30), contact("Bob", 40), contact("Cy", 50)],
        )
        .unwrap();

    let ids: Vec<i64> = stored.iter().map(id_of).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    for entry in &stored {
        assert_eq!(created_of(entry), last_modified_of(entry));
    }
}

#[test]
fn test_round_trip_adds_only_system_fields() {
    let (_dir, _manager, store) = setup_contacts();
    let original = json!({
        "name": "Ann",
        "age": 30,
        "address": { "city": "Lyon", "zip": "69001" },
        "tags": ["a", "b"],
        "score": 1.5,
        "active": true,
        "nothing": null
    });

    let stored = store
        .upsert_entries(CONTACTS, vec![original.clone()])
        .unwrap();
    let retrieved = store
        .retrieve_entries(CONTACTS, &[id_of(&stored[0])])
        .unwrap();

    assert_eq!(retrieved, stored);
    assert_eq!(strip_system_fields(&retrieved[0]), original);
}

#[test]
fn test_stale_entry_id_inserts() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(
            CONTACTS,
            vec![json!({ "name": "Ghost", "_soupEntryId": 999 })],
        )
        .unwrap();
    assert_ne!(id_of(&stored[0]), 999);
    assert_eq!(
        store.retrieve_entries(CONTACTS, &[999]).unwrap(),
        Vec::<Value>::new()
    );
}

#[test]
fn test_retrieve_omits_missing_ids() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(CONTACTS, vec![contact("Ann", 30), contact("Bob", 40)])
        .unwrap();
    let wanted = [id_of(&stored[1]), 12345, id_of(&stored[0])];
    let retrieved = store.retrieve_entries(CONTACTS, &wanted).unwrap();
    assert_eq!(retrieved.len(), 2);
    assert!(store.retrieve_entries(CONTACTS, &[]).unwrap().is_empty());
}

// ============================================================================
// External ids
// ============================================================================

#[test]
fn test_external_id_scenario() {
    let (_dir, _manager, store) = setup();
    store
        .register_soup(
            "accounts",
            &[SoupIndex::integer("extId"), SoupIndex::string("name")],
        )
        .unwrap();

    let first = store
        .upsert_entries_with_external_id(
            "accounts",
            vec![json!({ "extId": 1 }), json!({ "extId": 2 })],
            "extId",
        )
        .unwrap();

    let updated = store
        .upsert_entries_with_external_id(
            "accounts",
            vec![json!({ "extId": 1, "name": "changed" })],
            "extId",
        )
        .unwrap();

    assert_eq!(id_of(&updated[0]), id_of(&first[0]));
    assert_eq!(store.count(&QuerySpec::all("accounts", 10)).unwrap(), 2);
    let retrieved = store
        .retrieve_entries("accounts", &[id_of(&first[0])])
        .unwrap();
    assert_eq!(retrieved[0]["name"], "changed");
    assert_eq!(created_of(&retrieved[0]), created_of(&first[0]));
}

#[test]
fn test_external_id_missing_field_inserts() {
    let (_dir, _manager, store) = setup();
    store
        .register_soup("accounts", &[SoupIndex::string("extId")])
        .unwrap();
    store
        .upsert_entries_with_external_id("accounts", vec![json!({ "n": 1 })], "extId")
        .unwrap();
    store
        .upsert_entries_with_external_id("accounts", vec![json!({ "n": 2 })], "extId")
        .unwrap();
    assert_eq!(store.count(&QuerySpec::all("accounts", 10)).unwrap(), 2);
}

#[test]
fn test_ambiguous_external_id() {
    let (_dir, _manager, store) = setup();
    store
        .register_soup("accounts", &[SoupIndex::string("extId")])
        .unwrap();
    let stored = store
        .upsert_entries(
            "accounts",
            vec![json!({ "extId": "001" }), json!({ "extId": "001" })],
        )
        .unwrap();

    let err = store
        .upsert_entries_with_external_id(
            "accounts",
            vec![json!({ "extId": "001", "name": "x" })],
            "extId",
        )
        .unwrap_err();
    match err {
        Error::AmbiguousExternalId { soup, path, ids, .. } => {
            assert_eq!(soup, "accounts");
            assert_eq!(path, "extId");
            assert_eq!(ids, stored.iter().map(id_of).collect::<Vec<_>>());
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_external_id_path_must_be_indexed() {
    let (_dir, _manager, store) = setup_contacts();
    let err = store
        .upsert_entries_with_external_id(CONTACTS, vec![contact("Ann", 1)], "email")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PathNotIndexed);
}

// ============================================================================
// Atomicity
// ============================================================================

#[test]
fn test_malformed_entry_rolls_back_whole_batch() {
    let (_dir, _manager, store) = setup_contacts();
    let err = store
        .upsert_entries(
            CONTACTS,
            vec![
                contact("Ann", 30),
                contact("Bob", 40),
                json!(42),
                contact("Cy", 50),
            ],
        )
        .unwrap_err();

    match err {
        Error::InvalidEntry { position, .. } => assert_eq!(position, 2),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(store.count(&QuerySpec::all(CONTACTS, 10)).unwrap(), 0);
}

#[test]
fn test_failed_batch_leaves_updates_unapplied() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(CONTACTS, vec![contact("Ann", 30)])
        .unwrap();

    let mut renamed = stored[0].clone();
    renamed["name"] = json!("Changed");
    assert!(store
        .upsert_entries(CONTACTS, vec![renamed, json!("not an object")])
        .is_err());

    let retrieved = store
        .retrieve_entries(CONTACTS, &[id_of(&stored[0])])
        .unwrap();
    assert_eq!(retrieved, stored);
}

// ============================================================================
// Removal
// ============================================================================

#[test]
fn test_remove_entries() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(CONTACTS, vec![contact("Ann", 30), contact("Bob", 40)])
        .unwrap();

    store
        .remove_entries(CONTACTS, &[id_of(&stored[0]), 777])
        .unwrap();
    let remaining = store.query(&QuerySpec::all(CONTACTS, 10), 0).unwrap();
    assert_eq!(remaining, vec![stored[1].clone()]);

    // Removing again is a no-op
    store.remove_entries(CONTACTS, &[id_of(&stored[0])]).unwrap();
}

#[test]
fn test_remove_by_query_removes_first_page() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(
            CONTACTS,
            vec![contact("Ann", 30), contact("Bob", 40), contact("Cy", 50)],
        )
        .unwrap();

    store
        .remove_entries_by_query(CONTACTS, &QuerySpec::all(CONTACTS, 2))
        .unwrap();
    let remaining = store.query(&QuerySpec::all(CONTACTS, 10), 0).unwrap();
    assert_eq!(remaining, vec![stored[2].clone()]);

    store
        .remove_entries_by_query(
            CONTACTS,
            &QuerySpec::range(CONTACTS, "age", Some(json!(45)), None, 10),
        )
        .unwrap();
    assert_eq!(store.count(&QuerySpec::all(CONTACTS, 10)).unwrap(), 0);
}

#[test]
fn test_remove_by_query_rejects_smart_and_mismatched_soup() {
    let (_dir, _manager, store) = setup_contacts();
    let smart = QuerySpec::smart("select {contacts:_soupEntryId} from {contacts}", 10);
    assert_eq!(
        store
            .remove_entries_by_query(CONTACTS, &smart)
            .unwrap_err()
            .code(),
        ErrorCode::UnsupportedOperation
    );
    assert_eq!(
        store
            .remove_entries_by_query(CONTACTS, &QuerySpec::all("accounts", 10))
            .unwrap_err()
            .code(),
        ErrorCode::InvalidArgument
    );
}

#[test]
fn test_clear_soup_keeps_registration_and_ids_advance() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(CONTACTS, vec![contact("Ann", 30), contact("Bob", 40)])
        .unwrap();

    store.clear_soup(CONTACTS).unwrap();
    assert!(store.soup_exists(CONTACTS).unwrap());
    assert_eq!(store.count(&QuerySpec::all(CONTACTS, 10)).unwrap(), 0);

    let fresh = store
        .upsert_entries(CONTACTS, vec![contact("Cy", 50)])
        .unwrap();
    assert!(id_of(&fresh[0]) > id_of(&stored[1]));
}

// ============================================================================
// Lookups
// ============================================================================

#[test]
fn test_lookup_soup_entry_id() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = store
        .upsert_entries(
            CONTACTS,
            vec![contact("Ann", 30), contact("Bob", 40), contact("Bob", 41)],
        )
        .unwrap();

    assert_eq!(
        store
            .lookup_soup_entry_id(CONTACTS, "name", &json!("Ann"))
            .unwrap(),
        id_of(&stored[0])
    );
    assert_eq!(
        store
            .lookup_soup_entry_id(CONTACTS, "age", &json!(41))
            .unwrap(),
        id_of(&stored[2])
    );
    assert_eq!(
        store
            .lookup_soup_entry_id(CONTACTS, "name", &json!("Zed"))
            .unwrap_err()
            .code(),
        ErrorCode::NotFound
    );
    match store
        .lookup_soup_entry_id(CONTACTS, "name", &json!("Bob"))
        .unwrap_err()
    {
        Error::AmbiguousMatch { ids, .. } => {
            assert_eq!(ids, vec![id_of(&stored[1]), id_of(&stored[2])])
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        store
            .lookup_soup_entry_id(CONTACTS, "email", &json!("a@b"))
            .unwrap_err()
            .code(),
        ErrorCode::PathNotIndexed
    );
}

#[test]
fn test_dirty_entry_ids() {
    let (_dir, _manager, store) = setup();
    store
        .register_soup(
            "accounts",
            &[SoupIndex::string("Id"), SoupIndex::string("__local__")],
        )
        .unwrap();
    let stored = store
        .upsert_entries(
            "accounts",
            vec![
                json!({ "Id": "1", "__local__": false }),
                json!({ "Id": "2", "__local__": true }),
                json!({ "Id": "3" }),
                json!({ "Id": "4", "__local__": true }),
            ],
        )
        .unwrap();

    assert_eq!(
        store.dirty_entry_ids("accounts").unwrap(),
        vec![id_of(&stored[1]), id_of(&stored[3])]
    );

    store.register_soup(CONTACTS, &contact_indexes()).unwrap();
    assert_eq!(
        store.dirty_entry_ids(CONTACTS).unwrap_err().code(),
        ErrorCode::PathNotIndexed
    );
}

#[test]
fn test_re_index_soup() {
    let (_dir, _manager, store) = setup_contacts();
    store
        .upsert_entries(CONTACTS, vec![contact("Ann", 30), contact("Bob", 40)])
        .unwrap();

    store
        .re_index_soup(CONTACTS, &["name".to_string(), "age".to_string()])
        .unwrap();
    assert_eq!(store.query(&exact_name("Bob"), 0).unwrap().len(), 1);

    assert_eq!(
        store
            .re_index_soup(CONTACTS, &["email".to_string()])
            .unwrap_err()
            .code(),
        ErrorCode::PathNotIndexed
    );
}

#[test]
fn test_closed_store_rejects_operations() {
    let (_dir, _manager, store) = setup_contacts();
    store.close();
    assert!(store.is_closed());
    assert_eq!(
        store
            .upsert_entries(CONTACTS, vec![contact("Ann", 1)])
            .unwrap_err()
            .code(),
        ErrorCode::Closed
    );
    store.close();
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_identity_and_timestamps(names in prop::collection::vec("[a-z]{1,8}", 1..6)) {
        let (_dir, _manager, store) = setup_contacts();
        let mut current = store
            .upsert_entries(CONTACTS, vec![contact("start", 0)])
            .unwrap()
            .remove(0);
        let id = id_of(&current);
        let created = created_of(&current);

        for name in names {
            let mut next = current.clone();
            next["name"] = json!(name);
            let stored = store.upsert_entries(CONTACTS, vec![next]).unwrap().remove(0);
            prop_assert_eq!(id_of(&stored), id);
            prop_assert_eq!(created_of(&stored), created);
            prop_assert!(last_modified_of(&stored) > last_modified_of(&current));
            current = stored;
        }

        let retrieved = store.retrieve_entries(CONTACTS, &[id]).unwrap();
        prop_assert_eq!(&retrieved[0], &current);
    }
}
