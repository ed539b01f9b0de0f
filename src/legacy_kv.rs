//! The legacy flat key-value store.
//!
//! A synchronous string-to-string persistent map mirroring the browser
//! storage the legacy data lived in: bounded capacity, `None` for absent
//! keys, index scans over the keyspace, and a best-effort JSON layer on
//! top. Writes that would exceed the quota fail with a distinguished error
//! and never touch existing entries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("quota exceeded: writing {key} would use {attempted} of {quota} bytes")]
    QuotaExceeded {
        key: String,
        attempted: usize,
        quota: usize,
    },
    #[error("failed to persist legacy store: {0}")]
    Persist(String),
}

struct Inner {
    entries: BTreeMap<String, String>,
    used_bytes: usize,
}

pub struct LegacyKv {
    inner: Mutex<Inner>,
    quota_bytes: usize,
    persist_path: Option<PathBuf>,
}

fn entry_cost(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

impl LegacyKv {
    /// Volatile store, used by tests and migrations that stage data.
    pub fn in_memory(quota_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                used_bytes: 0,
            }),
            quota_bytes,
            persist_path: None,
        }
    }

    /// File-backed store. A missing file is an empty store; a corrupt file
    /// is reported and treated as empty rather than failing the open.
    pub fn open(path: impl Into<PathBuf>, quota_bytes: usize) -> Self {
        let path = path.into();
        let entries: BTreeMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        target = "vikingbase",
                        event = "legacy_kv_corrupt",
                        path = %path.display(),
                        error = %e
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        let used_bytes = entries.iter().map(|(k, v)| entry_cost(k, v)).sum();
        Self {
            inner: Mutex::new(Inner {
                entries,
                used_bytes,
            }),
            quota_bytes,
            persist_path: Some(path),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, inner: &Inner) -> Result<(), KvError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let raw = serde_json::to_string(&inner.entries)
            .map_err(|e| KvError::Persist(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(|e| KvError::Persist(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| KvError::Persist(e.to_string()))?;
        Ok(())
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).cloned()
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        let old_cost = inner
            .entries
            .get(key)
            .map(|v| entry_cost(key, v))
            .unwrap_or(0);
        let attempted = inner.used_bytes - old_cost + entry_cost(key, value);
        if attempted > self.quota_bytes {
            return Err(KvError::QuotaExceeded {
                key: key.to_string(),
                attempted,
                quota: self.quota_bytes,
            });
        }
        inner.entries.insert(key.to_string(), value.to_string());
        inner.used_bytes = attempted;
        self.persist(&inner)
    }

    pub fn remove_item(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        if let Some(value) = inner.entries.remove(key) {
            inner.used_bytes -= entry_cost(key, &value);
            self.persist(&inner)?;
        }
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.lock().entries.len()
    }

    /// Key at position `n` in the (sorted) keyspace, mirroring the legacy
    /// index-scan API.
    pub fn key(&self, n: usize) -> Option<String> {
        self.lock().entries.keys().nth(n).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    pub fn used_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    /// Parsed JSON for a key, or `None` when absent or unparseable. Parse
    /// failures are reported but not fatal; the raw value stays in place.
    pub fn get_json(&self, key: &str) -> Option<Value> {
        let raw = self.get_item(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    target = "vikingbase",
                    event = "legacy_kv_parse_failed",
                    key = %key,
                    error = %e
                );
                None
            }
        }
    }

    pub fn set_json(&self, key: &str, value: &Value) -> Result<(), KvError> {
        let raw = serde_json::to_string(value).map_err(|e| KvError::Persist(e.to_string()))?;
        self.set_item(key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn absent_keys_return_none() {
        let kv = LegacyKv::in_memory(1024);
        assert_eq!(kv.get_item("viking_last_sync"), None);
        assert_eq!(kv.get_json("viking_last_sync"), None);
    }

    #[test]
    fn set_get_remove_roundtrip() {
        let kv = LegacyKv::in_memory(1024);
        kv.set_item("a", "1").unwrap();
        kv.set_item("b", "2").unwrap();
        assert_eq!(kv.get_item("a").as_deref(), Some("1"));
        assert_eq!(kv.length(), 2);
        assert_eq!(kv.key(0).as_deref(), Some("a"));
        assert_eq!(kv.key(1).as_deref(), Some("b"));
        kv.remove_item("a").unwrap();
        assert_eq!(kv.get_item("a"), None);
        assert_eq!(kv.length(), 1);
    }

    #[test]
    fn quota_exceeded_leaves_existing_entries_intact() {
        let kv = LegacyKv::in_memory(16);
        kv.set_item("key1", "12345").unwrap();
        let err = kv.set_item("key2", "too-long-value").unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { .. }));
        assert_eq!(kv.get_item("key1").as_deref(), Some("12345"));
        assert_eq!(kv.length(), 1);
    }

    #[test]
    fn overwrite_accounts_for_freed_bytes() {
        let kv = LegacyKv::in_memory(16);
        kv.set_item("key1", "12345678901!").unwrap();
        // Replacing with a shorter value must succeed even near the quota.
        kv.set_item("key1", "x").unwrap();
        assert_eq!(kv.used_bytes(), 5);
    }

    #[test]
    fn json_helpers_tolerate_garbage() {
        let kv = LegacyKv::in_memory(1024);
        kv.set_item("bad", "{not json").unwrap();
        assert_eq!(kv.get_json("bad"), None);
        // Raw value untouched by the failed parse.
        assert_eq!(kv.get_item("bad").as_deref(), Some("{not json"));

        kv.set_json("good", &json!({"a": 1})).unwrap();
        assert_eq!(kv.get_json("good"), Some(json!({"a": 1})));
    }

    #[test]
    fn persists_and_reloads_from_disk() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("legacy_kv.json");
        {
            let kv = LegacyKv::open(&path, 1024);
            kv.set_item("viking_last_sync", "123456").unwrap();
        }
        let reloaded = LegacyKv::open(&path, 1024);
        assert_eq!(
            reloaded.get_item("viking_last_sync").as_deref(),
            Some("123456")
        );
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("legacy_kv.json");
        std::fs::write(&path, "!!!").unwrap();
        let kv = LegacyKv::open(&path, 1024);
        assert_eq!(kv.length(), 0);
    }
}
