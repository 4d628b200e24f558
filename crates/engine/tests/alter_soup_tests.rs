//! Integration tests for soup alteration
//!
//! Alterations run in recorded phases; these tests interrupt them at each
//! phase and check that a reopen or an explicit resume finishes the job.

mod common;

use common::*;
use serde_json::{json, Value};
use soupstore_core::{ErrorCode, QuerySpec, SoupIndex, SoupSpec, StorageMode};
use soupstore_engine::AlterStatus;

fn widened_indexes() -> Vec<SoupIndex> {
    vec![
        SoupIndex::string("name"),
        SoupIndex::integer("age"),
        SoupIndex::string("city"),
    ]
}

fn seed(store: &soupstore_engine::SoupStore) -> Vec<Value> {
    store
        .upsert_entries(
            CONTACTS,
            vec![
                json!({ "name": "Ann", "age": 30, "city": "Lyon" }),
                json!({ "name": "Bob", "age": 40, "city": "Paris" }),
                json!({ "name": "Cy", "age": 50, "city": "Lyon" }),
            ],
        )
        .unwrap()
}

fn city_count(store: &soupstore_engine::SoupStore, city: &str) -> usize {
    store
        .count(&QuerySpec::exact(CONTACTS, "city", city, 10))
        .unwrap()
}

#[test]
fn test_alter_adds_index_and_keeps_entries() {
    for reindex_data in [false, true] {
        let (_dir, _manager, store) = setup_contacts();
        let stored = seed(&store);

        store
            .alter_soup(CONTACTS, &widened_indexes(), reindex_data)
            .unwrap();

        assert_eq!(store.indices_for_soup(CONTACTS).unwrap(), widened_indexes());
        assert_eq!(city_count(&store, "Lyon"), 2);
        let ids: Vec<i64> = stored.iter().map(id_of).collect();
        assert_eq!(store.retrieve_entries(CONTACTS, &ids).unwrap(), stored);
        assert!(store.long_operations().unwrap().is_empty());

        // New entries keep getting fresh ids
        let fresh = store
            .upsert_entries(CONTACTS, vec![contact("Dee", 60)])
            .unwrap();
        assert!(id_of(&fresh[0]) > ids[2]);
    }
}

#[test]
fn test_alter_can_drop_an_index() {
    let (_dir, _manager, store) = setup_contacts();
    seed(&store);
    store
        .alter_soup(CONTACTS, &[SoupIndex::string("name")], false)
        .unwrap();

    assert_eq!(
        store
            .count(&QuerySpec::exact(CONTACTS, "age", 30, 10))
            .unwrap_err()
            .code(),
        ErrorCode::PathNotIndexed
    );
    assert_eq!(
        store
            .count(&QuerySpec::exact(CONTACTS, "name", "Bob", 10))
            .unwrap(),
        1
    );
}

#[test]
fn test_alter_never_reuses_removed_ids() {
    for reindex_data in [false, true] {
        let (_dir, _manager, store) = setup_contacts();
        let stored = seed(&store);
        let highest = id_of(&stored[2]);
        store.remove_entries(CONTACTS, &[highest]).unwrap();

        store
            .alter_soup(CONTACTS, &widened_indexes(), reindex_data)
            .unwrap();

        let fresh = store
            .upsert_entries(CONTACTS, vec![contact("Dee", 60)])
            .unwrap();
        assert!(
            id_of(&fresh[0]) > highest,
            "reindex_data={} reused id {}",
            reindex_data,
            id_of(&fresh[0])
        );
    }
}

#[test]
fn test_alter_after_clear_never_reuses_ids() {
    for reindex_data in [false, true] {
        let (_dir, _manager, store) = setup_contacts();
        let stored = seed(&store);
        store.clear_soup(CONTACTS).unwrap();

        store
            .alter_soup(CONTACTS, &widened_indexes(), reindex_data)
            .unwrap();

        let fresh = store
            .upsert_entries(CONTACTS, vec![contact("Dee", 60)])
            .unwrap();
        assert!(id_of(&fresh[0]) > id_of(&stored[2]));
    }
}

#[test]
fn test_resumed_copy_keeps_id_high_water_mark() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = seed(&store);
    let highest = id_of(&stored[2]);
    store.remove_entries(CONTACTS, &[highest]).unwrap();

    store
        .alter_soup_until(
            CONTACTS,
            &SoupSpec::external(CONTACTS),
            &widened_indexes(),
            true,
            Some(AlterStatus::DataReindexed),
        )
        .unwrap();
    assert_eq!(store.resume_long_operations().unwrap(), 1);

    let fresh = store
        .upsert_entries(CONTACTS, vec![contact("Dee", 60)])
        .unwrap();
    assert!(id_of(&fresh[0]) > highest);
}

#[test]
fn test_interrupted_alter_resumes_on_reopen() {
    let (_dir, manager, store) = setup_contacts();
    let stored = seed(&store);

    let status = store
        .alter_soup_until(
            CONTACTS,
            &SoupSpec::new(CONTACTS),
            &widened_indexes(),
            true,
            Some(AlterStatus::DataReindexed),
        )
        .unwrap();
    assert_eq!(status, AlterStatus::DataReindexed);

    let pending = store.long_operations().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, AlterStatus::DataReindexed);
    assert_eq!(pending[0].details.soup_name, CONTACTS);

    // Mutations wait for the alteration
    assert_eq!(
        store
            .upsert_entries(CONTACTS, vec![contact("Dee", 60)])
            .unwrap_err()
            .code(),
        ErrorCode::AlterPending
    );
    assert_eq!(
        store
            .alter_soup(CONTACTS, &contact_indexes(), false)
            .unwrap_err()
            .code(),
        ErrorCode::AlterPending
    );
    drop(store);

    let store = manager.shared_global_store("test").unwrap();
    assert!(store.long_operations().unwrap().is_empty());
    assert_eq!(store.indices_for_soup(CONTACTS).unwrap(), widened_indexes());
    assert_eq!(city_count(&store, "Paris"), 1);
    let ids: Vec<i64> = stored.iter().map(id_of).collect();
    assert_eq!(store.retrieve_entries(CONTACTS, &ids).unwrap(), stored);
}

#[test]
fn test_explicit_resume_from_every_phase() {
    for stop in [
        AlterStatus::NotStarted,
        AlterStatus::SchemaBuilt,
        AlterStatus::DataReindexed,
        AlterStatus::OldDropped,
    ] {
        let (_dir, _manager, store) = setup_contacts();
        let stored = seed(&store);

        let reached = store
            .alter_soup_until(
                CONTACTS,
                &SoupSpec::new(CONTACTS),
                &widened_indexes(),
                false,
                Some(stop),
            )
            .unwrap();
        assert_eq!(reached, stop);

        assert_eq!(store.resume_long_operations().unwrap(), 1, "from {}", stop);
        assert_eq!(store.resume_long_operations().unwrap(), 0);
        assert_eq!(city_count(&store, "Lyon"), 2, "from {}", stop);
        assert_eq!(store.count(&QuerySpec::all(CONTACTS, 10)).unwrap(), 3);
        assert_eq!(
            store.retrieve_entries(CONTACTS, &[id_of(&stored[1])]).unwrap(),
            vec![stored[1].clone()]
        );
    }
}

#[test]
fn test_alter_to_external_storage_and_back() {
    let (_dir, _manager, store) = setup_contacts();
    let stored = seed(&store);
    let ids: Vec<i64> = stored.iter().map(id_of).collect();

    store
        .alter_soup_with_spec(
            CONTACTS,
            &SoupSpec::external(CONTACTS),
            &widened_indexes(),
            false,
        )
        .unwrap();
    assert_eq!(store.soup_spec(CONTACTS).unwrap().storage, StorageMode::External);
    assert_eq!(store.external_file_count(CONTACTS).unwrap(), 3);
    assert_eq!(store.retrieve_entries(CONTACTS, &ids).unwrap(), stored);
    assert_eq!(city_count(&store, "Lyon"), 2);

    store
        .alter_soup_with_spec(CONTACTS, &SoupSpec::new(CONTACTS), &contact_indexes(), false)
        .unwrap();
    assert_eq!(store.soup_spec(CONTACTS).unwrap().storage, StorageMode::Internal);
    assert_eq!(store.external_file_count(CONTACTS).unwrap(), 0);
    assert_eq!(store.retrieve_entries(CONTACTS, &ids).unwrap(), stored);
}

#[test]
fn test_alter_rejects_invalid_requests() {
    let (_dir, _manager, store) = setup_contacts();
    assert_eq!(
        store
            .alter_soup("missing", &contact_indexes(), false)
            .unwrap_err()
            .code(),
        ErrorCode::NotFound
    );
    assert_eq!(
        store
            .alter_soup(CONTACTS, &[], false)
            .unwrap_err()
            .code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(
        store
            .alter_soup_with_spec(CONTACTS, &SoupSpec::new("renamed"), &contact_indexes(), false)
            .unwrap_err()
            .code(),
        ErrorCode::InvalidArgument
    );
    assert!(store.long_operations().unwrap().is_empty());
}

#[test]
fn test_remove_soup_discards_pending_alter() {
    let (_dir, _manager, store) = setup_contacts();
    seed(&store);
    store
        .alter_soup_until(
            CONTACTS,
            &SoupSpec::external(CONTACTS),
            &widened_indexes(),
            false,
            Some(AlterStatus::DataReindexed),
        )
        .unwrap();

    store.remove_soup(CONTACTS).unwrap();
    assert!(store.long_operations().unwrap().is_empty());
    assert!(!store.soup_exists(CONTACTS).unwrap());
    assert!(store.all_soup_names().unwrap().is_empty());

    store.register_soup(CONTACTS, &contact_indexes()).unwrap();
    assert_eq!(store.count(&QuerySpec::all(CONTACTS, 10)).unwrap(), 0);
}
