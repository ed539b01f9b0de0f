#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Value};

use vikingbase::key_router::{Backing, KeyRouter};
use vikingbase::legacy_kv::LegacyKv;
use vikingbase::object_store::ObjectStore;
use vikingbase::stores::StoreName;

async fn router() -> KeyRouter {
    let legacy = Arc::new(LegacyKv::in_memory(1024 * 1024));
    let store = ObjectStore::open_in_memory().await.expect("open store");
    KeyRouter::new(store, legacy, "viking")
}

fn recognized_fixtures() -> Vec<(&'static str, Value)> {
    vec![
        ("viking_last_sync", json!(1_700_000_000_000_i64)),
        ("viking_attendance_cache_time_e1", json!(1_700_000_000_500_i64)),
        ("viking_shared_metadata_e1_extra", json!({"shared": true})),
        (
            "viking_sections_offline",
            json!([{"sectionid": 101, "sectionname": "Cubs", "sectiontype": "cubs"}]),
        ),
        ("viking_startup_data_offline", json!({"globals": {"userid": 9}})),
        ("viking_terms_offline", json!({"101": [{"termid": "t1"}]})),
        (
            "viking_current_active_terms",
            json!({"101": {"sectionId": "101", "currentTermId": "t1", "lastUpdated": 5}}),
        ),
        ("viking_flexi_lists_101_offline", json!({"items": []})),
        (
            "viking_flexi_structure_42_offline",
            json!({"structure": [{"name": "CampGroup", "id": "f_1"}]}),
        ),
        ("viking_flexi_data_42_101_t1_offline", json!({"items": []})),
        (
            "viking_events_101_offline",
            json!([{"eventid": "e1", "name": "Camp", "sectionid": 101}]),
        ),
        (
            "viking_attendance_e1_offline",
            json!([{"scoutid": 1, "attending": "Yes", "eventid": "e1"}]),
        ),
        (
            "viking_shared_attendance_e1_202_offline",
            json!([{"scoutid": 2, "attending": "Yes", "eventid": "e1", "sectionid": 202, "isSharedSection": true}]),
        ),
        (
            "viking_members_comprehensive_offline",
            json!({"101": [{"scoutid": 1}]}),
        ),
    ]
}

#[tokio::test]
async fn every_recognized_key_round_trips_and_removes_cleanly() {
    let router = router().await;

    for (key, value) in recognized_fixtures() {
        assert!(
            matches!(router.route(key), Backing::Object(_)),
            "{key} should route to the object store"
        );
        router.set(key, &value).await.unwrap();

        let loaded = router.get(key).await.unwrap();
        assert!(loaded.is_some(), "{key} should read back");
        // Nothing leaked into the legacy store on the object path.
        assert_eq!(router.legacy().get_item(key), None, "{key} hit legacy");

        router.remove(key).await.unwrap();
        assert_eq!(router.get(key).await.unwrap(), None, "{key} survived remove");
    }
}

#[tokio::test]
async fn normalized_blob_values_survive_the_round_trip() {
    let router = router().await;

    let attendance = json!([
        {"scoutid": 1, "attending": "yes"},
        {"scoutid": 2, "attending": "invited"}
    ]);
    router
        .set("viking_attendance_e1_offline", &attendance)
        .await
        .unwrap();

    let rows = router
        .get("viking_attendance_e1_offline")
        .await
        .unwrap()
        .unwrap();
    let rows = rows.as_array().unwrap().clone();
    assert_eq!(rows.len(), 2);
    // Normalization happened on the way in.
    let attending: Vec<&str> = rows
        .iter()
        .map(|r| r["attending"].as_str().unwrap())
        .collect();
    assert!(attending.contains(&"Yes"));
    assert!(attending.contains(&"Invited"));
}

#[tokio::test]
async fn unrecognized_keys_stay_on_the_legacy_store() {
    let router = router().await;

    for key in ["random_key", "viking_something_new", "osm_last_sync"] {
        assert_eq!(router.route(key), Backing::Legacy);
        router.set(key, &json!({"v": key})).await.unwrap();
        assert_eq!(router.get(key).await.unwrap(), Some(json!({"v": key})));
        assert!(router.legacy().get_item(key).is_some());

        router.remove(key).await.unwrap();
        assert_eq!(router.get(key).await.unwrap(), None);
    }

    // Nothing reached any object store table.
    for store in [StoreName::CacheData, StoreName::StartupData] {
        assert_eq!(router.object_store().count(store).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn get_falls_back_to_legacy_for_unmigrated_data() {
    let router = router().await;

    // Data written before migration lives only in the legacy store, but a
    // routed read still finds it.
    router
        .legacy()
        .set_json("viking_startup_data_offline", &json!({"globals": 1}))
        .unwrap();
    assert_eq!(
        router.get("viking_startup_data_offline").await.unwrap(),
        Some(json!({"globals": 1}))
    );

    // Once the object store has the data, it wins.
    router
        .set("viking_startup_data_offline", &json!({"globals": 2}))
        .await
        .unwrap();
    assert_eq!(
        router.get("viking_startup_data_offline").await.unwrap(),
        Some(json!({"globals": 2}))
    );
}

#[tokio::test]
async fn remove_clears_both_backings() {
    let router = router().await;
    router
        .legacy()
        .set_json("viking_terms_offline", &json!({"101": []}))
        .unwrap();
    router
        .set("viking_terms_offline", &json!({"101": [{"termid": "t1"}]}))
        .await
        .unwrap();

    router.remove("viking_terms_offline").await.unwrap();
    assert_eq!(router.get("viking_terms_offline").await.unwrap(), None);
    assert_eq!(router.legacy().get_item("viking_terms_offline"), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // OSM payloads carry scout ids as both numbers and numeric strings;
    // either spelling must address the same attendance row.
    #[test]
    fn numeric_and_string_ids_address_the_same_row(scoutid in 1i64..1_000_000) {
        let runtime = tokio::runtime::Runtime::new().expect("create tokio runtime");
        runtime.block_on(async move {
            let router = router().await;
            let store = router.object_store();

            store
                .put(
                    StoreName::Attendance,
                    &json!({"eventid": "e1", "scoutid": scoutid, "attending": "Yes"}),
                )
                .await
                .unwrap();
            store
                .put(
                    StoreName::Attendance,
                    &json!({
                        "eventid": "e1",
                        "scoutid": scoutid.to_string(),
                        "attending": "No"
                    }),
                )
                .await
                .unwrap();

            assert_eq!(store.count(StoreName::Attendance).await.unwrap(), 1);
            let rows = store.get_all(StoreName::Attendance).await.unwrap();
            assert_eq!(rows[0]["attending"].as_str(), Some("No"));
        });
    }
}
