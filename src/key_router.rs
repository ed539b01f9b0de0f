//! Unified storage routing between the legacy flat store and the object
//! store.
//!
//! Every recognized key maps to exactly one backing. Object-store failures
//! fall back to the legacy store with a warning, so a partial migration or
//! a transient store error never loses user-visible data. Deletes attempt
//! both backings and succeed if either did.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::attendance_store::{
    bulk_replace_attendance_for_event, bulk_replace_shared_attendance, get_attendance_by_event,
};
use crate::event_store::{bulk_replace_events_for_section, get_events_by_section, parse_legacy_events_blob};
use crate::legacy_kv::LegacyKv;
use crate::model::as_i64;
use crate::object_store::{IndexQuery, ObjectStore};
use crate::stores::{Key, StoreName};
use crate::time::now_ms;
use crate::{AppError, AppResult};

static RE_ATTENDANCE_CACHE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^attendance_cache_time_(.+)$").expect("valid regex"));
static RE_SHARED_METADATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^shared_metadata_(.+)$").expect("valid regex"));
static RE_EVENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^events_(\d+)_offline$").expect("valid regex"));
static RE_SHARED_ATTENDANCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^shared_attendance_(.+)_(\d+)_offline$").expect("valid regex"));
static RE_ATTENDANCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^attendance_(.+)_offline$").expect("valid regex"));
static RE_FLEXI_LISTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^flexi_lists_(.+)_offline$").expect("valid regex"));
static RE_FLEXI_STRUCTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^flexi_structure_(.+)_offline$").expect("valid regex"));
static RE_FLEXI_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^flexi_data_([^_]+)_([^_]+)_([^_]+)_offline$").expect("valid regex")
});

/// Classification attached to cache entries on write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheEntryType {
    Sync,
    Cache,
    Metadata,
    Data,
}

impl CacheEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheEntryType::Sync => "sync",
            CacheEntryType::Cache => "cache",
            CacheEntryType::Metadata => "metadata",
            CacheEntryType::Data => "data",
        }
    }
}

/// Object-store destination for a routed key.
#[derive(Clone, PartialEq, Debug)]
pub enum Target {
    CacheEntry(CacheEntryType),
    Sections,
    StartupData,
    Terms,
    CurrentActiveTerms,
    FlexiLists { section_id: String },
    FlexiStructure { record_id: String },
    FlexiData { record_id: String, section_id: String, term_id: String },
    Events { section_id: i64 },
    Attendance { event_id: String },
    SharedAttendance { event_id: String, section_id: i64 },
    MembersBlob,
}

impl Target {
    pub fn store(&self) -> StoreName {
        match self {
            Target::CacheEntry(_) => StoreName::CacheData,
            Target::Sections => StoreName::Sections,
            Target::StartupData => StoreName::StartupData,
            Target::Terms => StoreName::Terms,
            Target::CurrentActiveTerms => StoreName::CurrentActiveTerms,
            Target::FlexiLists { .. } => StoreName::FlexiLists,
            Target::FlexiStructure { .. } => StoreName::FlexiStructure,
            Target::FlexiData { .. } => StoreName::FlexiData,
            Target::Events { .. } => StoreName::Events,
            Target::Attendance { .. } => StoreName::Attendance,
            Target::SharedAttendance { .. } => StoreName::SharedAttendance,
            Target::MembersBlob => StoreName::Members,
        }
    }
}

/// Which backing owns a key.
#[derive(Clone, PartialEq, Debug)]
pub enum Backing {
    Object(Target),
    Legacy,
}

pub struct KeyRouter {
    store: ObjectStore,
    legacy: Arc<LegacyKv>,
    prefix: String,
}

impl KeyRouter {
    pub fn new(store: ObjectStore, legacy: Arc<LegacyKv>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            legacy,
            prefix: prefix.into(),
        }
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn legacy(&self) -> &LegacyKv {
        &self.legacy
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn suffix<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?.strip_prefix('_')
    }

    /// Routes a key to its owning backing. Keys outside the recognized
    /// prefix, and recognized-prefix keys with no object-store mapping, stay
    /// on the legacy store.
    pub fn route(&self, key: &str) -> Backing {
        let Some(suffix) = self.suffix(key) else {
            return Backing::Legacy;
        };

        if suffix == "last_sync" {
            return Backing::Object(Target::CacheEntry(CacheEntryType::Sync));
        }
        if RE_ATTENDANCE_CACHE_TIME.is_match(suffix) {
            return Backing::Object(Target::CacheEntry(CacheEntryType::Cache));
        }
        if RE_SHARED_METADATA.is_match(suffix) {
            return Backing::Object(Target::CacheEntry(CacheEntryType::Metadata));
        }
        if suffix == "sections_offline" {
            return Backing::Object(Target::Sections);
        }
        if suffix == "startup_data_offline" {
            return Backing::Object(Target::StartupData);
        }
        if suffix == "terms_offline" {
            return Backing::Object(Target::Terms);
        }
        if suffix == "current_active_terms" {
            return Backing::Object(Target::CurrentActiveTerms);
        }
        if suffix == "members_comprehensive_offline" {
            return Backing::Object(Target::MembersBlob);
        }
        if let Some(caps) = RE_FLEXI_LISTS.captures(suffix) {
            return Backing::Object(Target::FlexiLists {
                section_id: caps[1].to_string(),
            });
        }
        if let Some(caps) = RE_FLEXI_STRUCTURE.captures(suffix) {
            return Backing::Object(Target::FlexiStructure {
                record_id: caps[1].to_string(),
            });
        }
        if let Some(caps) = RE_FLEXI_DATA.captures(suffix) {
            return Backing::Object(Target::FlexiData {
                record_id: caps[1].to_string(),
                section_id: caps[2].to_string(),
                term_id: caps[3].to_string(),
            });
        }
        if let Some(caps) = RE_EVENTS.captures(suffix) {
            if let Ok(section_id) = caps[1].parse::<i64>() {
                return Backing::Object(Target::Events { section_id });
            }
        }
        // shared_attendance must match before the broader attendance pattern.
        if let Some(caps) = RE_SHARED_ATTENDANCE.captures(suffix) {
            if let Ok(section_id) = caps[2].parse::<i64>() {
                return Backing::Object(Target::SharedAttendance {
                    event_id: caps[1].to_string(),
                    section_id,
                });
            }
        }
        if let Some(caps) = RE_ATTENDANCE.captures(suffix) {
            return Backing::Object(Target::Attendance {
                event_id: caps[1].to_string(),
            });
        }

        Backing::Legacy
    }

    /// Stores a value under a key, at whichever backing owns it.
    pub async fn set(&self, key: &str, value: &Value) -> AppResult<()> {
        match self.route(key) {
            Backing::Legacy => self.set_legacy(key, value),
            Backing::Object(target) => match self.set_object(key, &target, value).await {
                Ok(()) => Ok(()),
                Err(err) if crate::error::is_store_unavailable(&err) => {
                    warn!(
                        target = "vikingbase",
                        event = "router_set_fallback",
                        key = %key,
                        store = %target.store(),
                        error = %err
                    );
                    self.set_legacy(key, value)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Loads a value by key. An object-store failure or miss retries on the
    /// legacy store, which is what keeps partially migrated data readable.
    pub async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        match self.route(key) {
            Backing::Legacy => Ok(self.legacy.get_json(key)),
            Backing::Object(target) => match self.get_object(key, &target).await {
                Ok(Some(value)) => Ok(Some(value)),
                Ok(None) => Ok(self.legacy.get_json(key)),
                Err(err) => {
                    warn!(
                        target = "vikingbase",
                        event = "router_get_fallback",
                        key = %key,
                        store = %target.store(),
                        error = %err
                    );
                    Ok(self.legacy.get_json(key))
                }
            },
        }
    }

    /// Removes a key from both backings. Succeeds if either backing
    /// succeeded; fails only when both did.
    pub async fn remove(&self, key: &str) -> AppResult<()> {
        let object_result = match self.route(key) {
            Backing::Legacy => Ok(()),
            Backing::Object(target) => self.remove_object(key, &target).await,
        };
        let legacy_result = self.legacy.remove_item(key);

        match (&object_result, &legacy_result) {
            (Err(obj_err), Err(kv_err)) => Err(AppError::new(
                AppError::STORE_UNAVAILABLE,
                format!("remove failed on both backings: {obj_err}; {kv_err}"),
            )
            .with_context("key", key)),
            (Err(err), Ok(())) => {
                warn!(
                    target = "vikingbase",
                    event = "router_remove_partial",
                    key = %key,
                    error = %err
                );
                Ok(())
            }
            (Ok(()), Err(err)) => {
                warn!(
                    target = "vikingbase",
                    event = "router_remove_partial",
                    key = %key,
                    error = %err.to_string()
                );
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn set_legacy(&self, key: &str, value: &Value) -> AppResult<()> {
        self.legacy
            .set_json(key, value)
            .map_err(|e| AppError::new(AppError::STORE_UNAVAILABLE, e.to_string()).with_context("key", key))
    }

    fn blob_record(&self, key: &str, value: &Value, extras: &[(&str, Value)]) -> Value {
        let mut record = Map::new();
        record.insert("key".into(), json!(key));
        record.insert("data".into(), value.clone());
        record.insert("timestamp".into(), json!(now_ms()));
        for (k, v) in extras {
            record.insert((*k).to_string(), v.clone());
        }
        Value::Object(record)
    }

    async fn set_object(&self, key: &str, target: &Target, value: &Value) -> AppResult<()> {
        match target {
            Target::CacheEntry(entry_type) => {
                let record =
                    self.blob_record(key, value, &[("type", json!(entry_type.as_str()))]);
                self.store.put(StoreName::CacheData, &record).await?;
            }
            Target::StartupData | Target::Terms => {
                let record = self.blob_record(key, value, &[]);
                self.store.put(target.store(), &record).await?;
            }
            Target::MembersBlob => {
                let record = self.blob_record(key, value, &[]);
                self.store.put(StoreName::Members, &record).await?;
            }
            Target::FlexiLists { section_id } => {
                let record =
                    self.blob_record(key, value, &[("sectionId", json!(section_id))]);
                self.store.put(StoreName::FlexiLists, &record).await?;
            }
            Target::FlexiStructure { record_id } => {
                let record = self.blob_record(key, value, &[("recordId", json!(record_id))]);
                self.store.put(StoreName::FlexiStructure, &record).await?;
            }
            Target::FlexiData {
                record_id,
                section_id,
                term_id,
            } => {
                let record = self.blob_record(
                    key,
                    value,
                    &[
                        ("recordId", json!(record_id)),
                        ("sectionId", json!(section_id)),
                        ("termId", json!(term_id)),
                    ],
                );
                self.store.put(StoreName::FlexiData, &record).await?;
            }
            Target::Sections => {
                let rows = value
                    .as_array()
                    .ok_or_else(|| AppError::invalid_input("sections blob is not an array"))?;
                self.store.replace_all(StoreName::Sections, rows).await?;
            }
            Target::CurrentActiveTerms => {
                let rows = current_active_term_rows(value)?;
                self.store
                    .replace_all(StoreName::CurrentActiveTerms, &rows)
                    .await?;
            }
            Target::Events { section_id } => {
                let events = parse_legacy_events_blob(value)?;
                bulk_replace_events_for_section(&self.store, *section_id, &events).await?;
            }
            Target::Attendance { event_id } => {
                let rows = value
                    .as_array()
                    .ok_or_else(|| AppError::invalid_input("attendance blob is not an array"))?;
                bulk_replace_attendance_for_event(&self.store, event_id, rows).await?;
            }
            Target::SharedAttendance {
                event_id,
                section_id,
            } => {
                let rows = value
                    .as_array()
                    .ok_or_else(|| AppError::invalid_input("attendance blob is not an array"))?;
                bulk_replace_shared_attendance(&self.store, event_id, *section_id, rows).await?;
            }
        }
        Ok(())
    }

    /// Object-side read with no legacy fallback. The migration engine uses
    /// this to verify that a write actually landed.
    pub(crate) async fn get_object(&self, key: &str, target: &Target) -> AppResult<Option<Value>> {
        match target {
            Target::CacheEntry(_)
            | Target::StartupData
            | Target::Terms
            | Target::MembersBlob
            | Target::FlexiLists { .. }
            | Target::FlexiStructure { .. }
            | Target::FlexiData { .. } => {
                let record = self.store.get(target.store(), &Key::from(key)).await?;
                Ok(record.and_then(|r| r.get("data").cloned()))
            }
            Target::Sections => {
                let rows = self.store.get_all(StoreName::Sections).await?;
                Ok(non_empty(rows))
            }
            Target::CurrentActiveTerms => {
                let rows = self.store.get_all(StoreName::CurrentActiveTerms).await?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let mut map = Map::new();
                for row in rows {
                    if let Some(section_id) = row.get("sectionId").and_then(Value::as_str) {
                        map.insert(section_id.to_string(), row.clone());
                    }
                }
                Ok(Some(Value::Object(map)))
            }
            Target::Events { section_id } => {
                let events = get_events_by_section(&self.store, *section_id).await?;
                let rows: AppResult<Vec<Value>> =
                    events.iter().map(crate::model::to_value).collect();
                Ok(non_empty(rows?))
            }
            Target::Attendance { event_id } => {
                let records = get_attendance_by_event(&self.store, event_id).await?;
                let rows: AppResult<Vec<Value>> =
                    records.iter().map(crate::model::to_value).collect();
                Ok(non_empty(rows?))
            }
            Target::SharedAttendance {
                event_id,
                section_id,
            } => {
                let rows = self
                    .store
                    .get_all_from_index(
                        StoreName::SharedAttendance,
                        "eventid",
                        IndexQuery::Equals(json!(event_id)),
                    )
                    .await?;
                let filtered: Vec<Value> = rows
                    .into_iter()
                    .filter(|row| row.get("sectionid").and_then(as_i64) == Some(*section_id))
                    .collect();
                Ok(non_empty(filtered))
            }
        }
    }

    /// Object-side delete with no legacy involvement. Rollback restores the
    /// legacy copy first and then calls this, so `remove` (which clears both
    /// backings) would undo the restore.
    pub(crate) async fn remove_object(&self, key: &str, target: &Target) -> AppResult<()> {
        match target {
            Target::CacheEntry(_)
            | Target::StartupData
            | Target::Terms
            | Target::MembersBlob
            | Target::FlexiLists { .. }
            | Target::FlexiStructure { .. }
            | Target::FlexiData { .. } => {
                self.store.delete(target.store(), &Key::from(key)).await?;
            }
            Target::Sections => {
                self.store.clear(StoreName::Sections).await?;
            }
            Target::CurrentActiveTerms => {
                self.store.clear(StoreName::CurrentActiveTerms).await?;
            }
            Target::Events { section_id } => {
                self.store
                    .replace_where(StoreName::Events, &[("sectionid", json!(section_id))], &[])
                    .await?;
            }
            Target::Attendance { event_id } => {
                self.store
                    .replace_where(
                        StoreName::Attendance,
                        &[("eventid", json!(event_id))],
                        &[],
                    )
                    .await?;
            }
            Target::SharedAttendance {
                event_id,
                section_id,
            } => {
                self.store
                    .replace_where(
                        StoreName::SharedAttendance,
                        &[("eventid", json!(event_id)), ("sectionid", json!(section_id))],
                        &[],
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn non_empty(rows: Vec<Value>) -> Option<Value> {
    if rows.is_empty() {
        None
    } else {
        Some(Value::Array(rows))
    }
}

/// Accepts both shapes of the legacy active-terms blob: a mapping keyed by
/// section id, or a bare array of rows.
fn current_active_term_rows(value: &Value) -> AppResult<Vec<Value>> {
    match value {
        Value::Array(rows) => Ok(rows.clone()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(section_id, row)| {
                let mut entry = row.as_object().cloned().unwrap_or_default();
                entry
                    .entry("sectionId".to_string())
                    .or_insert_with(|| json!(section_id));
                Value::Object(entry)
            })
            .collect()),
        _ => Err(AppError::invalid_input(
            "current_active_terms blob is neither an object nor an array",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn router() -> (KeyRouter, Arc<LegacyKv>) {
        let legacy = Arc::new(LegacyKv::in_memory(1024 * 1024));
        let store = ObjectStore::open_in_memory().await.unwrap();
        (KeyRouter::new(store, legacy.clone(), "viking"), legacy)
    }

    #[tokio::test]
    async fn routing_table_covers_every_recognized_key() {
        let (router, _) = router().await;
        assert_eq!(
            router.route("viking_last_sync"),
            Backing::Object(Target::CacheEntry(CacheEntryType::Sync))
        );
        assert_eq!(
            router.route("viking_attendance_cache_time_evt9"),
            Backing::Object(Target::CacheEntry(CacheEntryType::Cache))
        );
        assert_eq!(
            router.route("viking_shared_metadata_evt9"),
            Backing::Object(Target::CacheEntry(CacheEntryType::Metadata))
        );
        assert_eq!(router.route("viking_sections_offline"), Backing::Object(Target::Sections));
        assert_eq!(
            router.route("viking_startup_data_offline"),
            Backing::Object(Target::StartupData)
        );
        assert_eq!(router.route("viking_terms_offline"), Backing::Object(Target::Terms));
        assert_eq!(
            router.route("viking_current_active_terms"),
            Backing::Object(Target::CurrentActiveTerms)
        );
        assert_eq!(
            router.route("viking_events_123_offline"),
            Backing::Object(Target::Events { section_id: 123 })
        );
        assert_eq!(
            router.route("viking_attendance_evt7_offline"),
            Backing::Object(Target::Attendance {
                event_id: "evt7".into()
            })
        );
        assert_eq!(
            router.route("viking_shared_attendance_evt7_55_offline"),
            Backing::Object(Target::SharedAttendance {
                event_id: "evt7".into(),
                section_id: 55
            })
        );
        assert_eq!(
            router.route("viking_members_comprehensive_offline"),
            Backing::Object(Target::MembersBlob)
        );
        assert_eq!(
            router.route("viking_flexi_lists_42_offline"),
            Backing::Object(Target::FlexiLists {
                section_id: "42".into()
            })
        );
        assert_eq!(
            router.route("viking_flexi_structure_r1_offline"),
            Backing::Object(Target::FlexiStructure {
                record_id: "r1".into()
            })
        );
        assert_eq!(
            router.route("viking_flexi_data_r1_42_t2_offline"),
            Backing::Object(Target::FlexiData {
                record_id: "r1".into(),
                section_id: "42".into(),
                term_id: "t2".into()
            })
        );
        // Unrecognized and unprefixed keys stay legacy.
        assert_eq!(router.route("viking_user_preferences"), Backing::Legacy);
        assert_eq!(router.route("other_last_sync"), Backing::Legacy);
    }

    #[tokio::test]
    async fn blob_set_get_remove_roundtrip() {
        let (router, legacy) = router().await;
        let value = json!({"ts": 1700000000000_i64});
        router.set("viking_last_sync", &value).await.unwrap();
        assert_eq!(router.get("viking_last_sync").await.unwrap(), Some(value));
        // Owned by the object store, not legacy.
        assert_eq!(legacy.get_item("viking_last_sync"), None);

        router.remove("viking_last_sync").await.unwrap();
        assert_eq!(router.get("viking_last_sync").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_entries_carry_their_classification() {
        let (router, _) = router().await;
        router
            .set("viking_last_sync", &json!(1700000000000_i64))
            .await
            .unwrap();
        router
            .set("viking_shared_metadata_evt1", &json!({"shared": true}))
            .await
            .unwrap();

        let synced = router
            .object_store()
            .get_all_from_index(
                StoreName::CacheData,
                "type",
                IndexQuery::Equals(json!("sync")),
            )
            .await
            .unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0]["key"], "viking_last_sync");

        let metadata = router
            .object_store()
            .get_all_from_index(
                StoreName::CacheData,
                "type",
                IndexQuery::Equals(json!("metadata")),
            )
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);
    }

    #[tokio::test]
    async fn events_key_round_trips_through_normalized_store() {
        let (router, _) = router().await;
        let blob = json!([
            {"eventid": "e1", "name": "Camp", "termid": "t1"},
            {"eventid": "e2", "name": "Hike", "termid": "t1"}
        ]);
        router.set("viking_events_9_offline", &blob).await.unwrap();

        let loaded = router.get("viking_events_9_offline").await.unwrap().unwrap();
        let rows = loaded.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        // The section scope is stamped onto normalized rows.
        assert!(rows.iter().all(|r| r["sectionid"] == 9));

        router.remove("viking_events_9_offline").await.unwrap();
        assert_eq!(router.get("viking_events_9_offline").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unrecognized_key_lives_on_legacy() {
        let (router, legacy) = router().await;
        router
            .set("viking_user_preferences", &json!({"theme": "dark"}))
            .await
            .unwrap();
        assert!(legacy.get_item("viking_user_preferences").is_some());
        assert_eq!(
            router.get("viking_user_preferences").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );
        router.remove("viking_user_preferences").await.unwrap();
        assert_eq!(router.get("viking_user_preferences").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_falls_back_to_legacy_when_object_store_is_empty() {
        let (router, legacy) = router().await;
        // Data staged by an older build that never migrated.
        legacy
            .set_json("viking_terms_offline", &json!({"101": []}))
            .unwrap();
        assert_eq!(
            router.get("viking_terms_offline").await.unwrap(),
            Some(json!({"101": []}))
        );
    }
}
