//! Static registry of the named object stores and their secondary indexes.
//!
//! Every store the router, migration engine, and domain stores touch is
//! declared here. The schema migrators derive their DDL from this table, so
//! adding a store means adding a `StoreDef` with the version that introduces
//! it and bumping [`crate::migrate::DATABASE_VERSION`].

use serde_json::Value;

use crate::{AppError, AppResult};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StoreName {
    CacheData,
    Sections,
    StartupData,
    Terms,
    CurrentActiveTerms,
    FlexiLists,
    FlexiStructure,
    FlexiData,
    Events,
    Attendance,
    SharedAttendance,
    SharedEventMetadata,
    Members,
    MembersCore,
    MemberSections,
    MigrationLog,
    MigrationStatus,
}

impl StoreName {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::CacheData => "cache_data",
            StoreName::Sections => "sections",
            StoreName::StartupData => "startup_data",
            StoreName::Terms => "terms",
            StoreName::CurrentActiveTerms => "current_active_terms",
            StoreName::FlexiLists => "flexi_lists",
            StoreName::FlexiStructure => "flexi_structure",
            StoreName::FlexiData => "flexi_data",
            StoreName::Events => "events",
            StoreName::Attendance => "attendance",
            StoreName::SharedAttendance => "shared_attendance",
            StoreName::SharedEventMetadata => "shared_event_metadata",
            StoreName::Members => "members",
            StoreName::MembersCore => "members_core",
            StoreName::MemberSections => "member_sections",
            StoreName::MigrationLog => "migration_log",
            StoreName::MigrationStatus => "migration_status",
        }
    }

    /// SQL table backing the store.
    pub fn table(self) -> String {
        format!("os_{}", self.as_str())
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndexKind {
    Text,
    Integer,
}

#[derive(Clone, Copy, Debug)]
pub struct IndexDef {
    /// Index name used by `get_all_from_index`.
    pub name: &'static str,
    /// JSON field of the record the index value is extracted from.
    pub field: &'static str,
    pub kind: IndexKind,
}

#[derive(Clone, Copy, Debug)]
pub struct StoreDef {
    pub name: StoreName,
    /// Record fields forming the primary key, in order. More than one field
    /// means a compound key.
    pub key_path: &'static [&'static str],
    pub indexes: &'static [IndexDef],
    /// Schema version that introduces the store.
    pub added_in: i64,
}

pub const STORES: &[StoreDef] = &[
    StoreDef {
        name: StoreName::CacheData,
        key_path: &["key"],
        indexes: &[
            IndexDef {
                name: "type",
                field: "type",
                kind: IndexKind::Text,
            },
            IndexDef {
                name: "timestamp",
                field: "timestamp",
                kind: IndexKind::Integer,
            },
        ],
        added_in: 1,
    },
    StoreDef {
        name: StoreName::Sections,
        key_path: &["sectionid"],
        indexes: &[IndexDef {
            name: "sectiontype",
            field: "sectiontype",
            kind: IndexKind::Text,
        }],
        added_in: 1,
    },
    StoreDef {
        name: StoreName::StartupData,
        key_path: &["key"],
        indexes: &[],
        added_in: 1,
    },
    StoreDef {
        name: StoreName::Terms,
        key_path: &["key"],
        indexes: &[],
        added_in: 1,
    },
    StoreDef {
        name: StoreName::CurrentActiveTerms,
        key_path: &["sectionId"],
        indexes: &[IndexDef {
            name: "lastUpdated",
            field: "lastUpdated",
            kind: IndexKind::Integer,
        }],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::FlexiLists,
        key_path: &["key"],
        indexes: &[
            IndexDef {
                name: "sectionId",
                field: "sectionId",
                kind: IndexKind::Text,
            },
            IndexDef {
                name: "recordId",
                field: "recordId",
                kind: IndexKind::Text,
            },
        ],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::FlexiStructure,
        key_path: &["key"],
        indexes: &[
            IndexDef {
                name: "sectionId",
                field: "sectionId",
                kind: IndexKind::Text,
            },
            IndexDef {
                name: "recordId",
                field: "recordId",
                kind: IndexKind::Text,
            },
        ],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::FlexiData,
        key_path: &["key"],
        indexes: &[
            IndexDef {
                name: "sectionId",
                field: "sectionId",
                kind: IndexKind::Text,
            },
            IndexDef {
                name: "recordId",
                field: "recordId",
                kind: IndexKind::Text,
            },
        ],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::Events,
        key_path: &["eventid"],
        indexes: &[
            IndexDef {
                name: "sectionid",
                field: "sectionid",
                kind: IndexKind::Integer,
            },
            IndexDef {
                name: "termid",
                field: "termid",
                kind: IndexKind::Text,
            },
        ],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::Attendance,
        key_path: &["eventid", "scoutid"],
        indexes: &[
            IndexDef {
                name: "eventid",
                field: "eventid",
                kind: IndexKind::Text,
            },
            IndexDef {
                name: "scoutid",
                field: "scoutid",
                kind: IndexKind::Integer,
            },
        ],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::SharedAttendance,
        key_path: &["eventid", "scoutid"],
        indexes: &[
            IndexDef {
                name: "eventid",
                field: "eventid",
                kind: IndexKind::Text,
            },
            IndexDef {
                name: "sectionid",
                field: "sectionid",
                kind: IndexKind::Integer,
            },
        ],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::SharedEventMetadata,
        key_path: &["eventid"],
        indexes: &[],
        added_in: 2,
    },
    StoreDef {
        name: StoreName::Members,
        key_path: &["key"],
        indexes: &[],
        added_in: 3,
    },
    StoreDef {
        name: StoreName::MembersCore,
        key_path: &["scoutid"],
        indexes: &[],
        added_in: 3,
    },
    StoreDef {
        name: StoreName::MemberSections,
        key_path: &["scoutid", "sectionid"],
        indexes: &[
            IndexDef {
                name: "scoutid",
                field: "scoutid",
                kind: IndexKind::Integer,
            },
            IndexDef {
                name: "sectionid",
                field: "sectionid",
                kind: IndexKind::Integer,
            },
        ],
        added_in: 3,
    },
    StoreDef {
        name: StoreName::MigrationLog,
        key_path: &["key"],
        indexes: &[IndexDef {
            name: "phase",
            field: "phase",
            kind: IndexKind::Text,
        }],
        added_in: 3,
    },
    StoreDef {
        name: StoreName::MigrationStatus,
        key_path: &["phase"],
        indexes: &[],
        added_in: 3,
    },
];

pub fn store_def(name: StoreName) -> &'static StoreDef {
    STORES
        .iter()
        .find(|def| def.name == name)
        .unwrap_or_else(|| unreachable!("store {name} missing from registry"))
}

/// Separator for compound key components in the canonical encoding. An
/// unprintable byte keeps real key material from colliding with it.
const KEY_SEP: char = '\u{1f}';

/// A typed store key with a canonical string encoding.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Key {
    Int(i64),
    Str(String),
    Compound(Vec<Key>),
}

impl Key {
    pub fn canon(&self) -> String {
        match self {
            Key::Int(v) => v.to_string(),
            Key::Str(s) => s.clone(),
            Key::Compound(parts) => parts
                .iter()
                .map(Key::canon)
                .collect::<Vec<_>>()
                .join(&KEY_SEP.to_string()),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canon())
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

impl From<(i64, i64)> for Key {
    fn from((a, b): (i64, i64)) -> Self {
        Key::Compound(vec![Key::Int(a), Key::Int(b)])
    }
}

impl From<(&str, i64)> for Key {
    fn from((a, b): (&str, i64)) -> Self {
        Key::Compound(vec![Key::Str(a.to_string()), Key::Int(b)])
    }
}

/// Extracts one key component from a record field. Numbers and numeric
/// strings canonicalize to `Key::Int` so `"123"` and `123` address the same
/// row, matching how OSM payloads mix the two.
fn key_component(field: &str, value: &Value) -> AppResult<Key> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Key::Int)
            .ok_or_else(|| AppError::invalid_input(format!("key field {field} is not an integer"))),
        Value::String(s) if !s.is_empty() => match s.parse::<i64>() {
            Ok(v) => Ok(Key::Int(v)),
            Err(_) => Ok(Key::Str(s.clone())),
        },
        _ => Err(AppError::invalid_input(format!(
            "key field {field} is missing or empty"
        ))),
    }
}

/// Derives the primary key for a record from the store's key path.
pub fn derive_key(def: &StoreDef, record: &Value) -> AppResult<Key> {
    let mut parts = Vec::with_capacity(def.key_path.len());
    for field in def.key_path {
        let value = record.get(*field).ok_or_else(|| {
            AppError::invalid_input(format!("record is missing key field {field}"))
                .with_context("store", def.name.as_str())
        })?;
        parts.push(key_component(field, value)?);
    }
    if parts.len() == 1 {
        Ok(parts.remove(0))
    } else {
        Ok(Key::Compound(parts))
    }
}

/// Extracted value for a typed index column.
#[derive(Clone, PartialEq, Debug)]
pub enum IndexValue {
    Text(Option<String>),
    Integer(Option<i64>),
}

pub fn extract_index_value(index: &IndexDef, record: &Value) -> IndexValue {
    let raw = record.get(index.field);
    match index.kind {
        IndexKind::Integer => {
            let v = raw.and_then(|v| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            });
            IndexValue::Integer(v)
        }
        IndexKind::Text => {
            let v = raw.and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            });
            IndexValue::Text(v)
        }
    }
}
