//! Per-event attendance rosters, shared-section attendance, and the merged
//! read path.
//!
//! Regular and shared records live in separate stores with the same
//! compound key `[eventid, scoutid]`. Shared rows are attendance for
//! sections the client cannot query directly; they carry
//! `isSharedSection = true` and lose to regular rows when both exist for a
//! scout.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::event_store::get_event_by_id;
use crate::model::{
    as_i64, from_value, to_value, AttendanceRecord, AttendanceSource, MergedAttendance,
};
use crate::object_store::{IndexQuery, ObjectStore};
use crate::stores::{Key, StoreName};
use crate::time::now_ms;
use crate::validation::normalize_attending;
use crate::{AppError, AppResult};

/// Builds a normalized attendance record from a loose legacy row. The event
/// scope is authoritative; `attending` is normalized; `updated_at` is
/// stamped by the store.
fn normalize_row(event_id: &str, raw: &Value, shared_section: Option<i64>) -> AppResult<AttendanceRecord> {
    let scoutid = raw
        .get("scoutid")
        .or_else(|| raw.get("member_id"))
        .and_then(as_i64)
        .ok_or_else(|| {
            AppError::invalid_input("attendance row is missing scoutid")
                .with_context("eventid", event_id)
        })?;
    let mut record: AttendanceRecord = from_value(json!({
        "eventid": event_id,
        "scoutid": scoutid,
        "attending": "No",
    }))?;
    record.attending = normalize_attending(raw.get("attending").unwrap_or(&Value::Null));
    record.sectionid = shared_section.or_else(|| raw.get("sectionid").and_then(as_i64));
    record.patrol = raw
        .get("patrol")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.notes = raw
        .get("notes")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.is_shared_section = shared_section.is_some();
    record.updated_at = now_ms();
    Ok(record)
}

/// Atomically replaces the roster for one event. Records for other events
/// are untouched.
pub async fn bulk_replace_attendance_for_event(
    store: &ObjectStore,
    event_id: &str,
    rows: &[Value],
) -> AppResult<usize> {
    let mut records = Vec::with_capacity(rows.len());
    for raw in rows {
        records.push(to_value(&normalize_row(event_id, raw, None)?)?);
    }
    let written = store
        .replace_where(
            StoreName::Attendance,
            &[("eventid", json!(event_id))],
            &records,
        )
        .await?;
    tracing::info!(
        target = "vikingbase",
        event = "attendance_event_replaced",
        event_id,
        count = written
    );
    Ok(written)
}

/// Replaces the shared-attendance rows for one (event, section) pair.
pub async fn bulk_replace_shared_attendance(
    store: &ObjectStore,
    event_id: &str,
    section_id: i64,
    rows: &[Value],
) -> AppResult<usize> {
    let mut records = Vec::with_capacity(rows.len());
    for raw in rows {
        records.push(to_value(&normalize_row(event_id, raw, Some(section_id))?)?);
    }
    store
        .replace_where(
            StoreName::SharedAttendance,
            &[("eventid", json!(event_id)), ("sectionid", json!(section_id))],
            &records,
        )
        .await
}

pub async fn get_attendance_by_event(
    store: &ObjectStore,
    event_id: &str,
) -> AppResult<Vec<AttendanceRecord>> {
    let rows = store
        .get_all_from_index(
            StoreName::Attendance,
            "eventid",
            IndexQuery::Equals(json!(event_id)),
        )
        .await?;
    rows.into_iter().map(from_value).collect()
}

pub async fn get_attendance_by_scout(
    store: &ObjectStore,
    scout_id: i64,
) -> AppResult<Vec<AttendanceRecord>> {
    let rows = store
        .get_all_from_index(
            StoreName::Attendance,
            "scoutid",
            IndexQuery::Equals(json!(scout_id)),
        )
        .await?;
    rows.into_iter().map(from_value).collect()
}

pub async fn get_attendance_record(
    store: &ObjectStore,
    event_id: &str,
    scout_id: i64,
) -> AppResult<Option<AttendanceRecord>> {
    let value = store
        .get(StoreName::Attendance, &Key::from((event_id, scout_id)))
        .await?;
    value.map(from_value).transpose()
}

pub async fn get_shared_attendance_by_event(
    store: &ObjectStore,
    event_id: &str,
) -> AppResult<Vec<AttendanceRecord>> {
    let rows = store
        .get_all_from_index(
            StoreName::SharedAttendance,
            "eventid",
            IndexQuery::Equals(json!(event_id)),
        )
        .await?;
    rows.into_iter().map(from_value).collect()
}

/// Merged regular + shared roster for an event, deduplicated by scoutid:
/// a scout present in regular attendance wins; shared-only scouts are
/// appended with a synthetic key marker. Each row is enriched with the
/// owning event's name, date and section name at read time.
pub async fn get_merged_attendance(
    store: &ObjectStore,
    event_id: &str,
) -> AppResult<Vec<MergedAttendance>> {
    let event = get_event_by_id(store, event_id).await?;
    let (eventname, eventdate, sectionname) = match &event {
        Some(e) => (e.name.clone(), e.startdate.clone(), e.sectionname.clone()),
        None => (None, None, None),
    };

    let mut merged = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();

    for record in get_attendance_by_event(store, event_id).await? {
        seen.insert(record.scoutid);
        merged.push(MergedAttendance {
            record,
            source: AttendanceSource::Regular,
            synthetic_key: None,
            eventname: eventname.clone(),
            eventdate: eventdate.clone(),
            sectionname: sectionname.clone(),
        });
    }

    for record in get_shared_attendance_by_event(store, event_id).await? {
        if seen.contains(&record.scoutid) {
            continue;
        }
        let synthetic_key = Some(format!("{}-shared", record.scoutid));
        merged.push(MergedAttendance {
            record,
            source: AttendanceSource::Shared,
            synthetic_key,
            eventname: eventname.clone(),
            eventdate: eventdate.clone(),
            sectionname: sectionname.clone(),
        });
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::bulk_replace_events_for_section;
    use crate::model::Attending;

    fn row(scout: i64, attending: &str) -> Value {
        json!({"scoutid": scout, "attending": attending, "patrol": "Red"})
    }

    #[tokio::test]
    async fn normalization_applies_on_insert() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        bulk_replace_attendance_for_event(
            &store,
            "e1",
            &[row(1, "yes"), row(2, "0"), row(3, "invited"), row(4, "maybe")],
        )
        .await
        .unwrap();

        let roster = get_attendance_by_event(&store, "e1").await.unwrap();
        let by_scout = |id: i64| roster.iter().find(|r| r.scoutid == id).unwrap().attending;
        assert_eq!(by_scout(1), Attending::Yes);
        assert_eq!(by_scout(2), Attending::No);
        assert_eq!(by_scout(3), Attending::Invited);
        assert_eq!(by_scout(4), Attending::No);
    }

    #[tokio::test]
    async fn replace_is_scoped_per_event() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        bulk_replace_attendance_for_event(&store, "A", &[row(100, "yes")])
            .await
            .unwrap();
        bulk_replace_attendance_for_event(&store, "B", &[row(200, "no")])
            .await
            .unwrap();
        bulk_replace_attendance_for_event(&store, "A", &[row(300, "invited")])
            .await
            .unwrap();

        let a = get_attendance_by_event(&store, "A").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].scoutid, 300);
        let b = get_attendance_by_event(&store, "B").await.unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].scoutid, 200);
    }

    #[tokio::test]
    async fn lookup_by_scout_and_exact_record() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        bulk_replace_attendance_for_event(&store, "A", &[row(100, "yes")])
            .await
            .unwrap();
        bulk_replace_attendance_for_event(&store, "B", &[row(100, "no")])
            .await
            .unwrap();

        let history = get_attendance_by_scout(&store, 100).await.unwrap();
        assert_eq!(history.len(), 2);
        let exact = get_attendance_record(&store, "B", 100).await.unwrap().unwrap();
        assert_eq!(exact.attending, Attending::No);
        assert!(get_attendance_record(&store, "B", 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_scoutid_rejects_whole_batch() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        let err = bulk_replace_attendance_for_event(
            &store,
            "A",
            &[row(1, "yes"), json!({"attending": "yes"})],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), AppError::INVALID_INPUT);
        assert!(get_attendance_by_event(&store, "A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merged_read_dedupes_and_enriches() {
        let store = ObjectStore::open_in_memory().await.unwrap();
        bulk_replace_events_for_section(
            &store,
            7,
            &[from_value(json!({
                "eventid": "camp",
                "name": "Summer Camp",
                "startdate": "2025-07-01",
                "sectionname": "Cubs"
            }))
            .unwrap()],
        )
        .await
        .unwrap();

        bulk_replace_attendance_for_event(&store, "camp", &[row(100, "yes"), row(101, "no")])
            .await
            .unwrap();
        bulk_replace_shared_attendance(&store, "camp", 99, &[row(101, "yes"), row(102, "yes")])
            .await
            .unwrap();

        let merged = get_merged_attendance(&store, "camp").await.unwrap();
        assert_eq!(merged.len(), 3);

        // Regular wins for scout 101.
        let s101 = merged.iter().find(|m| m.record.scoutid == 101).unwrap();
        assert_eq!(s101.source, AttendanceSource::Regular);
        assert_eq!(s101.record.attending, Attending::No);
        assert!(s101.synthetic_key.is_none());

        // Shared-only scout carries the synthetic marker and the shared flag.
        let s102 = merged.iter().find(|m| m.record.scoutid == 102).unwrap();
        assert_eq!(s102.source, AttendanceSource::Shared);
        assert!(s102.record.is_shared_section);
        assert_eq!(s102.synthetic_key.as_deref(), Some("102-shared"));
        assert_eq!(s102.record.sectionid, Some(99));

        // Read-time enrichment from the owning event.
        assert_eq!(s102.eventname.as_deref(), Some("Summer Camp"));
        assert_eq!(s102.eventdate.as_deref(), Some("2025-07-01"));
        assert_eq!(s102.sectionname.as_deref(), Some("Cubs"));

        // Enrichment is never persisted into the attendance row.
        let stored = get_attendance_record(&store, "camp", 100).await.unwrap().unwrap();
        assert!(!stored.extra.contains_key("eventname"));
    }
}
