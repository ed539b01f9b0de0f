//! Per-section event lists and the shared-event metadata side table.

use serde_json::{json, Value};

use crate::model::{from_value, to_value, Event, SharedEventMetadata};
use crate::object_store::{IndexQuery, ObjectStore};
use crate::stores::{Key, StoreName};
use crate::{AppError, AppResult};

/// Atomically replaces every event row for one section. Events for other
/// sections are untouched. The section scope is authoritative: each record
/// is stamped with `sectionid` regardless of what it carried.
pub async fn bulk_replace_events_for_section(
    store: &ObjectStore,
    section_id: i64,
    events: &[Event],
) -> AppResult<usize> {
    let mut records = Vec::with_capacity(events.len());
    for event in events {
        let mut scoped = event.clone();
        scoped.sectionid = Some(section_id);
        records.push(to_value(&scoped)?);
    }
    let written = store
        .replace_where(
            StoreName::Events,
            &[("sectionid", json!(section_id))],
            &records,
        )
        .await?;
    tracing::info!(
        target = "vikingbase",
        event = "events_section_replaced",
        section_id,
        count = written
    );
    Ok(written)
}

pub async fn get_events_by_section(store: &ObjectStore, section_id: i64) -> AppResult<Vec<Event>> {
    let rows = store
        .get_all_from_index(
            StoreName::Events,
            "sectionid",
            IndexQuery::Equals(json!(section_id)),
        )
        .await?;
    rows.into_iter().map(from_value).collect()
}

pub async fn get_events_by_term(store: &ObjectStore, term_id: &str) -> AppResult<Vec<Event>> {
    let rows = store
        .get_all_from_index(
            StoreName::Events,
            "termid",
            IndexQuery::Equals(json!(term_id)),
        )
        .await?;
    rows.into_iter().map(from_value).collect()
}

pub async fn get_event_by_id(store: &ObjectStore, event_id: &str) -> AppResult<Option<Event>> {
    let value = store.get(StoreName::Events, &Key::from(event_id)).await?;
    value.map(from_value).transpose()
}

pub async fn save_shared_event_metadata(
    store: &ObjectStore,
    metadata: &SharedEventMetadata,
) -> AppResult<()> {
    store
        .put(StoreName::SharedEventMetadata, &to_value(metadata)?)
        .await?;
    Ok(())
}

pub async fn get_shared_event_metadata(
    store: &ObjectStore,
    event_id: &str,
) -> AppResult<Option<SharedEventMetadata>> {
    let value = store
        .get(StoreName::SharedEventMetadata, &Key::from(event_id))
        .await?;
    value.map(from_value).transpose()
}

/// Pass-through in cache-only mode. The upstream expansion rule is host
/// policy; until a host supplies one this is the identity.
pub fn expand_shared_events(events: Vec<Event>) -> Vec<Event> {
    events
}

/// Parses a legacy events blob (`<prefix>_events_{sectionId}_offline`) into
/// typed rows. Accepts both a bare array and the `{items: [...]}` wrapper
/// produced by some legacy sync paths.
pub fn parse_legacy_events_blob(value: &Value) -> AppResult<Vec<Event>> {
    let items = value
        .as_array()
        .or_else(|| value.get("items").and_then(Value::as_array))
        .ok_or_else(|| AppError::invalid_input("events blob is not an array"))?;
    items
        .iter()
        .map(|item| from_value(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, section: i64, term: &str) -> Event {
        from_value(json!({
            "eventid": id,
            "name": format!("Event {id}"),
            "startdate": "2025-10-01",
            "sectionid": section,
            "termid": term
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn replace_is_scoped_to_section() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        bulk_replace_events_for_section(&store, 1, &[event("a", 1, "t1"), event("b", 1, "t1")])
            .await
            .unwrap();
        bulk_replace_events_for_section(&store, 2, &[event("c", 2, "t1")])
            .await
            .unwrap();
        bulk_replace_events_for_section(&store, 1, &[event("d", 1, "t2")])
            .await
            .unwrap();

        let section1 = get_events_by_section(&store, 1).await.unwrap();
        assert_eq!(section1.len(), 1);
        assert_eq!(section1[0].eventid, "d");
        let section2 = get_events_by_section(&store, 2).await.unwrap();
        assert_eq!(section2.len(), 1);

        let by_term = get_events_by_term(&store, "t2").await.unwrap();
        assert_eq!(by_term.len(), 1);
        assert!(get_event_by_id(&store, "d").await.unwrap().is_some());
        assert!(get_event_by_id(&store, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shared_event_metadata_roundtrip() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        let meta: SharedEventMetadata = from_value(json!({
            "eventid": "e1",
            "isSharedEvent": true,
            "ownerSectionId": 42,
            "sections": [{"sectionid": 42}, {"sectionid": 43}]
        }))
        .unwrap();
        save_shared_event_metadata(&store, &meta).await.unwrap();
        let loaded = get_shared_event_metadata(&store, "e1").await.unwrap();
        assert_eq!(loaded, Some(meta));
        assert!(get_shared_event_metadata(&store, "e2")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn legacy_blob_accepts_array_and_wrapper() {
        let bare = json!([{"eventid": "e1"}]);
        assert_eq!(parse_legacy_events_blob(&bare).unwrap().len(), 1);
        let wrapped = json!({"items": [{"eventid": "e1"}, {"eventid": "e2"}]});
        assert_eq!(parse_legacy_events_blob(&wrapped).unwrap().len(), 2);
        assert!(parse_legacy_events_blob(&json!({"nope": 1})).is_err());
    }
}
