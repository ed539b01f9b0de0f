//! Typed records for the normalized stores.
//!
//! Field names follow the wire shape of the upstream membership service, so
//! several are camelCase or run-together lowercase. Unknown fields ride
//! along in `extra` rather than being dropped; the legacy data is full of
//! per-deployment additions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, AppResult};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Section {
    pub sectionid: i64,
    #[serde(default)]
    pub sectionname: Option<String>,
    #[serde(default)]
    pub sectiontype: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub eventid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub startdate: Option<String>,
    #[serde(default)]
    pub enddate: Option<String>,
    #[serde(default)]
    pub sectionid: Option<i64>,
    #[serde(default)]
    pub termid: Option<String>,
    #[serde(default)]
    pub sectionname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normalized attendance status. Anything unrecognized maps to `No` at the
/// validation layer; the store only ever holds these four.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attending {
    Yes,
    No,
    Invited,
    Shown,
}

impl Attending {
    pub fn as_str(self) -> &'static str {
        match self {
            Attending::Yes => "Yes",
            Attending::No => "No",
            Attending::Invited => "Invited",
            Attending::Shown => "Shown",
        }
    }
}

impl std::fmt::Display for Attending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AttendanceRecord {
    pub eventid: String,
    pub scoutid: i64,
    pub attending: Attending,
    #[serde(default)]
    pub sectionid: Option<i64>,
    #[serde(default)]
    pub patrol: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, rename = "isSharedSection")]
    pub is_shared_section: bool,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Provenance tag for merged attendance reads.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceSource {
    Regular,
    Shared,
}

/// One row of a merged regular + shared attendance read, enriched with the
/// owning event at read time. The enrichment fields are never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MergedAttendance {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub source: AttendanceSource,
    /// Synthetic marker for shared-only scouts, consumed by downstream
    /// rendering (`"{scoutid}-shared"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventdate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sectionname: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SharedEventMetadata {
    pub eventid: String,
    #[serde(default, rename = "isSharedEvent")]
    pub is_shared_event: bool,
    #[serde(default, rename = "ownerSectionId")]
    pub owner_section_id: Option<i64>,
    #[serde(default)]
    pub sections: Vec<Value>,
}

/// A candidate term as fetched from the remote, keyed by `termid`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Term {
    pub termid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub startdate: String,
    pub enddate: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The persisted "current active term" row, one per section.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CurrentActiveTerm {
    #[serde(rename = "sectionId")]
    pub section_id: String,
    #[serde(rename = "currentTermId")]
    pub current_term_id: String,
    #[serde(default, rename = "termName")]
    pub term_name: Option<String>,
    #[serde(default, rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
}

/// Reads a loose JSON row's scout id, accepting the `member_id` alias and
/// numeric strings.
pub fn scout_id_of(row: &Value) -> AppResult<i64> {
    let raw = row
        .get("scoutid")
        .or_else(|| row.get("member_id"))
        .ok_or_else(|| AppError::invalid_input("member row is missing scoutid"))?;
    as_i64(raw).ok_or_else(|| AppError::invalid_input("scoutid is not an integer"))
}

/// Reads a loose JSON row's section id, if present.
pub fn section_id_of(row: &Value) -> Option<i64> {
    row.get("sectionid")
        .or_else(|| row.get("section_id"))
        .and_then(as_i64)
}

/// Integer coercion across the number/numeric-string mix in OSM payloads.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn to_value<T: Serialize>(record: &T) -> AppResult<Value> {
    serde_json::to_value(record).map_err(AppError::from)
}

pub fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(AppError::from)
}
