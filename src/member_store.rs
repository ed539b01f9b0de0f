//! Dual-table member storage: one canonical core row per person plus one
//! row per (person, section) membership.
//!
//! Writes split each incoming row: the core row is MERGED (mapping fields
//! deep-merge one level, scalars overwrite) so fields from earlier batches
//! survive, while the member-section row is REPLACED wholesale because the
//! per-section view is authoritative per fetch. Reads join the two back
//! into one UI-shaped row per person.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};

use crate::model::{as_i64, scout_id_of, section_id_of};
use crate::object_store::{IndexQuery, ObjectStore};
use crate::stores::{Key, StoreName};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Mapping fields that merge key-by-key instead of being overwritten.
const MERGE_FIELDS: &[&str] = &["contact_groups", "custom_data", "flattened_fields"];

/// Pure merge of an incoming member row onto the stored core row.
///
/// Top-level scalars (and arrays, e.g. `read_only`) overwrite. For the
/// mapping fields, merging is shallow at the top level of each mapping: new
/// keys add, existing keys overwrite, keys absent from the incoming row are
/// preserved. The stored record is never mutated in place.
pub fn merge_core_member(existing: Option<&Value>, incoming: &Value) -> Value {
    let mut out = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(fields) = incoming.as_object() {
        for (field, value) in fields {
            if MERGE_FIELDS.contains(&field.as_str()) {
                let merged = match (out.get(field).and_then(Value::as_object), value.as_object()) {
                    (Some(old), Some(new)) => {
                        let mut combined = old.clone();
                        for (k, v) in new {
                            combined.insert(k.clone(), v.clone());
                        }
                        Value::Object(combined)
                    }
                    _ => value.clone(),
                };
                out.insert(field.clone(), merged);
            } else {
                out.insert(field.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

/// Persists a batch of member rows for the given sections.
///
/// Fails fast on the first row without a usable `scoutid` (the `member_id`
/// alias is accepted); nothing is written in that case. Core and section
/// writes each run in a single transaction.
pub async fn save_members(
    store: &ObjectStore,
    section_ids: &[i64],
    members: &[Value],
) -> AppResult<usize> {
    // Merging needs the stored rows, and a batch can carry the same scout
    // several times (one row per section), so merges chain in memory first.
    let mut core_by_scout: HashMap<i64, Value> = HashMap::new();
    let mut core_order: Vec<i64> = Vec::new();
    let mut section_rows: Vec<Value> = Vec::new();
    let now = now_ms();

    for row in members {
        let scoutid = scout_id_of(row)?;

        let staged = core_by_scout.remove(&scoutid);
        let existing = match staged {
            Some(v) => Some(v),
            None => {
                store
                    .get(StoreName::MembersCore, &Key::Int(scoutid))
                    .await?
            }
        };
        let mut merged = merge_core_member(existing.as_ref(), row);
        if let Some(map) = merged.as_object_mut() {
            map.insert("scoutid".into(), json!(scoutid));
            map.remove("member_id");
            map.insert("updated_at".into(), json!(now));
        }
        if !core_order.contains(&scoutid) {
            core_order.push(scoutid);
        }
        core_by_scout.insert(scoutid, merged);

        // Rows without a section touch only the core record.
        if let Some(sectionid) = section_id_of(row) {
            let mut section_row = row.as_object().cloned().unwrap_or_default();
            section_row.insert("scoutid".into(), json!(scoutid));
            section_row.insert("sectionid".into(), json!(sectionid));
            section_row.remove("member_id");
            section_row.insert("updated_at".into(), json!(now));
            section_rows.push(Value::Object(section_row));
        }
    }

    let core_rows: Vec<Value> = core_order
        .iter()
        .filter_map(|id| core_by_scout.get(id).cloned())
        .collect();
    store.put_many(StoreName::MembersCore, &core_rows).await?;
    store
        .put_many(StoreName::MemberSections, &section_rows)
        .await?;

    tracing::info!(
        target = "vikingbase",
        event = "members_saved",
        sections = ?section_ids,
        core_rows = core_rows.len(),
        section_rows = section_rows.len()
    );
    Ok(core_rows.len())
}

pub async fn get_core_member(store: &ObjectStore, scoutid: i64) -> AppResult<Option<Value>> {
    store.get(StoreName::MembersCore, &Key::Int(scoutid)).await
}

pub async fn get_member_section(
    store: &ObjectStore,
    scoutid: i64,
    sectionid: i64,
) -> AppResult<Option<Value>> {
    store
        .get(StoreName::MemberSections, &Key::from((scoutid, sectionid)))
        .await
}

fn name_sort_key(row: &Value) -> (Option<String>, Option<String>) {
    let field = |name: &str| {
        row.get(name)
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase())
    };
    (field("lastname"), field("firstname"))
}

/// The projection fields lifted from the primary section row to the top
/// level of the joined row.
const PRIMARY_PROJECTION: &[&str] = &[
    "sectionid",
    "sectionname",
    "section",
    "person_type",
    "patrol",
    "active",
];

/// Read-time join: one UI-shaped row per person whose membership intersects
/// the requested sections.
///
/// The primary-section projection comes from the section row whose id
/// appears first in `section_ids` (argument order, deterministic). The
/// `sections` array contains every membership row for the person, each
/// exposing both `section_id` and `sectionid`. Orphaned section rows whose
/// core member is missing are skipped. Rows sort by `(lastname, firstname)`
/// with nulls first.
pub async fn get_members(store: &ObjectStore, section_ids: &[i64]) -> AppResult<Vec<Value>> {
    if section_ids.is_empty() {
        return Ok(Vec::new());
    }

    // Dedupe the requested sections, preserving argument order.
    let mut requested: Vec<i64> = Vec::new();
    for id in section_ids {
        if !requested.contains(id) {
            requested.push(*id);
        }
    }

    // Scouts appearing in any requested section, in discovery order.
    let mut scout_order: Vec<i64> = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();
    for sectionid in &requested {
        let rows = store
            .get_all_from_index(
                StoreName::MemberSections,
                "sectionid",
                IndexQuery::Equals(json!(sectionid)),
            )
            .await?;
        for row in rows {
            if let Some(scoutid) = row.get("scoutid").and_then(as_i64) {
                if seen.insert(scoutid) {
                    scout_order.push(scoutid);
                }
            }
        }
    }

    let mut result = Vec::with_capacity(scout_order.len());
    for scoutid in scout_order {
        let Some(core) = get_core_member(store, scoutid).await? else {
            tracing::warn!(
                target = "vikingbase",
                event = "member_join_orphan_skipped",
                scoutid
            );
            continue;
        };

        // Every membership row for this person, not only the requested ones.
        let all_sections = store
            .get_all_from_index(
                StoreName::MemberSections,
                "scoutid",
                IndexQuery::Equals(json!(scoutid)),
            )
            .await?;

        let primary = requested.iter().find_map(|wanted| {
            all_sections
                .iter()
                .find(|row| row.get("sectionid").and_then(as_i64) == Some(*wanted))
        });

        let mut joined: Map<String, Value> = core.as_object().cloned().unwrap_or_default();

        // Safely spread flattened_fields: only a mapping spreads; arrays
        // and nulls are ignored without throwing.
        if let Some(Value::Object(flattened)) = joined.get("flattened_fields").cloned() {
            for (k, v) in flattened {
                joined.insert(k, v);
            }
        }

        if let Some(primary) = primary {
            for field in PRIMARY_PROJECTION {
                match primary.get(*field) {
                    Some(v) => joined.insert((*field).to_string(), v.clone()),
                    None => joined.remove(*field),
                };
            }
        }

        let sections: Vec<Value> = all_sections
            .iter()
            .map(|row| {
                let mut entry = row.as_object().cloned().unwrap_or_default();
                if let Some(id) = entry.get("sectionid").cloned() {
                    entry.insert("section_id".into(), id);
                }
                Value::Object(entry)
            })
            .collect();
        joined.insert("sections".into(), Value::Array(sections));

        // Backward-compat aliases.
        joined.insert("member_id".into(), json!(scoutid));
        if let Some(dob) = joined.get("date_of_birth").cloned() {
            joined.insert("dateofbirth".into(), dob);
        }

        result.push(Value::Object(joined));
    }

    result.sort_by(|a, b| name_sort_key(a).cmp(&name_sort_key(b)));
    Ok(result)
}
