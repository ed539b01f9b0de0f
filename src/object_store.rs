//! The versioned embedded object store.
//!
//! Records are JSON documents in per-store tables, addressed by a canonical
//! key derived from the store's key path. Secondary indexes are typed
//! columns extracted from the record at put time. Bulk mutations run in a
//! single transaction scoped to their store.

use serde_json::Value;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Arguments, Sqlite, SqlitePool, Transaction};

use crate::stores::{
    derive_key, extract_index_value, store_def, IndexValue, Key, StoreDef, StoreName,
};
use crate::{AppError, AppResult};

/// Query against a secondary index.
#[derive(Clone, Debug)]
pub enum IndexQuery {
    Equals(Value),
    /// Inclusive lower bound, for "updated since T" style scans.
    LowerBound(Value),
}

/// Scope predicate for [`ObjectStore::replace_where`]: equality on one or
/// more indexes of the same store.
pub type IndexScope<'a> = &'a [(&'a str, Value)];

#[derive(Clone)]
pub struct ObjectStore {
    pool: SqlitePool,
}

impl ObjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fresh in-memory store with the full schema applied. Test harnesses
    /// and ephemeral hosts use this; durable hosts go through `DbHandle`.
    pub async fn open_in_memory() -> AppResult<Self> {
        let pool = crate::db::open_memory_pool()
            .await
            .map_err(AppError::from)?;
        crate::migrate::apply_migrations(&pool)
            .await
            .map_err(AppError::from)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn def(store: StoreName) -> &'static StoreDef {
        store_def(store)
    }

    pub async fn get(&self, store: StoreName, key: &Key) -> AppResult<Option<Value>> {
        let sql = format!("SELECT data FROM {} WHERE key = ?", store.table());
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(key.canon())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::from(e).with_store_context("get", store.as_str(), key.canon()))?;
        match row {
            Some((data,)) => {
                let value = serde_json::from_str(&data).map_err(|e| {
                    AppError::from(e).with_store_context("get", store.as_str(), key.canon())
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Inserts or overwrites one record; returns the derived key.
    pub async fn put(&self, store: StoreName, record: &Value) -> AppResult<Key> {
        let def = Self::def(store);
        let key = derive_key(def, record)?;
        let (sql, args) = upsert_statement(def, &key, record)?;
        sqlx::query_with(&sql, args)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from(e).with_store_context("put", store.as_str(), key.canon()))?;
        Ok(key)
    }

    /// Writes a batch of records in one transaction. Fails fast: the first
    /// invalid record aborts the whole batch.
    pub async fn put_many(&self, store: StoreName, records: &[Value]) -> AppResult<usize> {
        let def = Self::def(store);
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let written = put_all_in_tx(&mut tx, def, records).await?;
        tx.commit().await.map_err(AppError::from)?;
        tracing::debug!(
            target = "vikingbase",
            event = "store_put_many",
            store = %store,
            count = written
        );
        Ok(written)
    }

    /// Deletes one record; returns whether a row existed.
    pub async fn delete(&self, store: StoreName, key: &Key) -> AppResult<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?", store.table());
        let result = sqlx::query(&sql)
            .bind(key.canon())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::from(e).with_store_context("delete", store.as_str(), key.canon())
            })?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes every record in the store; returns the number deleted.
    pub async fn clear(&self, store: StoreName) -> AppResult<u64> {
        let sql = format!("DELETE FROM {}", store.table());
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from(e).with_store_context("clear", store.as_str(), ""))?;
        Ok(result.rows_affected())
    }

    pub async fn get_all(&self, store: StoreName) -> AppResult<Vec<Value>> {
        let sql = format!("SELECT data FROM {} ORDER BY key", store.table());
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::from(e).with_store_context("get_all", store.as_str(), ""))?;
        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_str(&data).map_err(|e| {
                    AppError::from(e).with_store_context("get_all", store.as_str(), "")
                })
            })
            .collect()
    }

    pub async fn get_all_keys(&self, store: StoreName) -> AppResult<Vec<String>> {
        let sql = format!("SELECT key FROM {} ORDER BY key", store.table());
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::from(e).with_store_context("get_all_keys", store.as_str(), "")
            })?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    pub async fn count(&self, store: StoreName) -> AppResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", store.table());
        let (count,): (i64,) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::from(e).with_store_context("count", store.as_str(), ""))?;
        Ok(count as u64)
    }

    /// Reads every record whose index matches the query.
    pub async fn get_all_from_index(
        &self,
        store: StoreName,
        index: &str,
        query: IndexQuery,
    ) -> AppResult<Vec<Value>> {
        let def = Self::def(store);
        let idx = def
            .indexes
            .iter()
            .find(|i| i.name == index)
            .ok_or_else(|| {
                AppError::invalid_input(format!("store {store} has no index {index}"))
            })?;

        let op = match query {
            IndexQuery::Equals(_) => "=",
            IndexQuery::LowerBound(_) => ">=",
        };
        let sql = format!(
            "SELECT data FROM {} WHERE idx_{} {} ? ORDER BY key",
            store.table(),
            idx.name,
            op
        );
        let value = match query {
            IndexQuery::Equals(v) | IndexQuery::LowerBound(v) => v,
        };
        let probe = extract_index_value(idx, &serde_json::json!({ idx.field: value }));

        let q = sqlx::query_as::<_, (String,)>(&sql);
        let rows = match probe {
            IndexValue::Integer(v) => q.bind(v).fetch_all(&self.pool).await,
            IndexValue::Text(v) => q.bind(v).fetch_all(&self.pool).await,
        }
        .map_err(|e| {
            AppError::from(e).with_store_context("get_all_from_index", store.as_str(), index)
        })?;

        rows.into_iter()
            .map(|(data,)| {
                serde_json::from_str(&data).map_err(|e| {
                    AppError::from(e).with_store_context(
                        "get_all_from_index",
                        store.as_str(),
                        index,
                    )
                })
            })
            .collect()
    }

    /// Atomically replaces the entire contents of a store in one
    /// transaction.
    pub async fn replace_all(&self, store: StoreName, records: &[Value]) -> AppResult<usize> {
        let def = Self::def(store);
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        sqlx::query(&format!("DELETE FROM {}", store.table()))
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::from(e).with_store_context("replace_all", store.as_str(), ""))?;
        let written = put_all_in_tx(&mut tx, def, records).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(written)
    }

    /// Atomically deletes every record matching the index scope and inserts
    /// the replacement set, in one transaction. Rows outside the scope are
    /// untouched. This backs the section-scoped and event-scoped replaces.
    pub async fn replace_where(
        &self,
        store: StoreName,
        scope: IndexScope<'_>,
        records: &[Value],
    ) -> AppResult<usize> {
        let def = Self::def(store);
        let mut conditions = Vec::with_capacity(scope.len());
        let mut probes = Vec::with_capacity(scope.len());
        for (index, value) in scope {
            let idx = def
                .indexes
                .iter()
                .find(|i| i.name == *index)
                .ok_or_else(|| {
                    AppError::invalid_input(format!("store {store} has no index {index}"))
                })?;
            conditions.push(format!("idx_{} = ?", idx.name));
            probes.push(extract_index_value(
                idx,
                &serde_json::json!({ idx.field: value }),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let delete_sql = format!(
            "DELETE FROM {} WHERE {}",
            store.table(),
            conditions.join(" AND ")
        );
        let mut q = sqlx::query(&delete_sql);
        for probe in probes {
            q = match probe {
                IndexValue::Integer(v) => q.bind(v),
                IndexValue::Text(v) => q.bind(v),
            };
        }
        let deleted = q
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::from(e).with_store_context("replace_where", store.as_str(), "")
            })?
            .rows_affected();

        let written = put_all_in_tx(&mut tx, def, records).await?;
        tx.commit().await.map_err(AppError::from)?;
        tracing::debug!(
            target = "vikingbase",
            event = "store_replace_scope",
            store = %store,
            deleted,
            written
        );
        Ok(written)
    }
}

async fn put_all_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    def: &StoreDef,
    records: &[Value],
) -> AppResult<usize> {
    let mut written = 0usize;
    for record in records {
        let key = derive_key(def, record)?;
        let (sql, args) = upsert_statement(def, &key, record)?;
        sqlx::query_with(&sql, args)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                AppError::from(e).with_store_context("put", def.name.as_str(), key.canon())
            })?;
        written += 1;
    }
    Ok(written)
}

fn upsert_statement<'q>(
    def: &StoreDef,
    key: &Key,
    record: &Value,
) -> AppResult<(String, SqliteArguments<'q>)> {
    let mut columns = vec!["key".to_string(), "data".to_string()];
    let mut updates = vec!["data = excluded.data".to_string()];
    let mut args = SqliteArguments::default();

    let data = serde_json::to_string(record)
        .map_err(|e| AppError::from(e).with_store_context("put", def.name.as_str(), key.canon()))?;
    args.add(key.canon()).map_err(arg_error)?;
    args.add(data).map_err(arg_error)?;

    for index in def.indexes {
        columns.push(format!("idx_{}", index.name));
        updates.push(format!("idx_{0} = excluded.idx_{0}", index.name));
        match extract_index_value(index, record) {
            IndexValue::Integer(v) => args.add(v).map_err(arg_error)?,
            IndexValue::Text(v) => args.add(v).map_err(arg_error)?,
        }
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(key) DO UPDATE SET {}",
        def.name.table(),
        columns.join(", "),
        placeholders,
        updates.join(", ")
    );
    Ok((sql, args))
}

fn arg_error(e: sqlx::error::BoxDynError) -> AppError {
    AppError::new("SQLX/ENCODE", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> ObjectStore {
        ObjectStore::open_in_memory().await.expect("store")
    }

    #[tokio::test]
    async fn put_get_roundtrip_with_int_key() {
        let store = memory_store().await;
        let record = json!({"sectionid": 101, "sectionname": "Cubs", "sectiontype": "cubs"});
        let key = store.put(StoreName::Sections, &record).await.unwrap();
        assert_eq!(key, Key::Int(101));
        let loaded = store.get(StoreName::Sections, &key).await.unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn put_overwrites_existing_row() {
        let store = memory_store().await;
        store
            .put(StoreName::Sections, &json!({"sectionid": 1, "sectionname": "A"}))
            .await
            .unwrap();
        store
            .put(StoreName::Sections, &json!({"sectionid": 1, "sectionname": "B"}))
            .await
            .unwrap();
        let loaded = store
            .get(StoreName::Sections, &Key::Int(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded["sectionname"], "B");
        assert_eq!(store.count(StoreName::Sections).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn compound_keys_address_distinct_rows() {
        let store = memory_store().await;
        for (scout, section) in [(1, 10), (1, 11), (2, 10)] {
            store
                .put(
                    StoreName::MemberSections,
                    &json!({"scoutid": scout, "sectionid": section, "patrol": "Red"}),
                )
                .await
                .unwrap();
        }
        assert_eq!(store.count(StoreName::MemberSections).await.unwrap(), 3);
        let row = store
            .get(StoreName::MemberSections, &Key::from((1, 11)))
            .await
            .unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn index_query_equals_and_lower_bound() {
        let store = memory_store().await;
        for (id, ts) in [("a", 100), ("b", 200), ("c", 300)] {
            store
                .put(
                    StoreName::CacheData,
                    &json!({"key": id, "data": {}, "timestamp": ts, "type": "cache"}),
                )
                .await
                .unwrap();
        }
        let all = store
            .get_all_from_index(
                StoreName::CacheData,
                "type",
                IndexQuery::Equals(json!("cache")),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let recent = store
            .get_all_from_index(
                StoreName::CacheData,
                "timestamp",
                IndexQuery::LowerBound(json!(200)),
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn put_many_is_atomic_on_invalid_record() {
        let store = memory_store().await;
        let records = vec![
            json!({"eventid": "e1", "name": "Camp", "sectionid": 1}),
            json!({"name": "missing key"}),
        ];
        let err = store.put_many(StoreName::Events, &records).await.unwrap_err();
        assert_eq!(err.code(), AppError::INVALID_INPUT);
        assert_eq!(store.count(StoreName::Events).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_where_only_touches_scope() {
        let store = memory_store().await;
        store
            .put_many(
                StoreName::Events,
                &[
                    json!({"eventid": "e1", "sectionid": 1, "name": "A"}),
                    json!({"eventid": "e2", "sectionid": 2, "name": "B"}),
                ],
            )
            .await
            .unwrap();
        store
            .replace_where(
                StoreName::Events,
                &[("sectionid", json!(1))],
                &[json!({"eventid": "e3", "sectionid": 1, "name": "C"})],
            )
            .await
            .unwrap();
        let section1 = store
            .get_all_from_index(StoreName::Events, "sectionid", IndexQuery::Equals(json!(1)))
            .await
            .unwrap();
        assert_eq!(section1.len(), 1);
        assert_eq!(section1[0]["eventid"], "e3");
        let section2 = store
            .get_all_from_index(StoreName::Events, "sectionid", IndexQuery::Equals(json!(2)))
            .await
            .unwrap();
        assert_eq!(section2.len(), 1);
    }

    #[tokio::test]
    async fn clear_and_get_all_keys() {
        let store = memory_store().await;
        store
            .put_many(
                StoreName::Terms,
                &[json!({"key": "t1", "data": []}), json!({"key": "t2", "data": []})],
            )
            .await
            .unwrap();
        assert_eq!(
            store.get_all_keys(StoreName::Terms).await.unwrap(),
            vec!["t1", "t2"]
        );
        assert_eq!(store.clear(StoreName::Terms).await.unwrap(), 2);
        assert!(store.get_all(StoreName::Terms).await.unwrap().is_empty());
    }
}
