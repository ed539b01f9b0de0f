//! Process-wide memoized database handles.
//!
//! One pool per database name, acquired lazily. Switching demo mode selects
//! a different name, and `invalidate` drops a cached pool so the next
//! acquire transparently re-opens (the recovery path for a terminated
//! connection).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::object_store::ObjectStore;
use crate::{AppError, AppResult};

pub struct DbHandle {
    pools: Mutex<HashMap<String, SqlitePool>>,
}

static GLOBAL: Lazy<DbHandle> = Lazy::new(|| DbHandle {
    pools: Mutex::new(HashMap::new()),
});

impl DbHandle {
    pub fn global() -> &'static DbHandle {
        &GLOBAL
    }

    /// Standalone handle for tests that must not share global state.
    pub fn isolated() -> DbHandle {
        DbHandle {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the memoized pool for the configured database, opening and
    /// migrating it on first use.
    pub async fn acquire(&self, config: &StoreConfig) -> AppResult<SqlitePool> {
        let name = config.database_name();
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&name) {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
            // A closed pool behaves like a terminated connection: forget it
            // and re-open below.
            tracing::warn!(
                target = "vikingbase",
                event = "db_handle_reopen",
                database = %name
            );
            pools.remove(&name);
        }

        let pool = crate::db::open_sqlite_pool(&config.database_path())
            .await
            .map_err(AppError::from)?;
        crate::migrate::apply_migrations(&pool)
            .await
            .map_err(AppError::from)?;
        pools.insert(name, pool.clone());
        Ok(pool)
    }

    pub async fn object_store(&self, config: &StoreConfig) -> AppResult<ObjectStore> {
        Ok(ObjectStore::new(self.acquire(config).await?))
    }

    /// Drops the cached pool for a database name. The next `acquire`
    /// re-opens it.
    pub async fn invalidate(&self, database_name: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.remove(database_name) {
            pool.close().await;
            tracing::info!(
                target = "vikingbase",
                event = "db_handle_invalidated",
                database = %database_name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_memoizes_per_database_name() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let handle = DbHandle::isolated();
        let config = StoreConfig::new(tmp.path());

        let a = handle.acquire(&config).await?;
        let b = handle.acquire(&config).await?;
        // Both handles point at the same database: a write through one is
        // visible through the other.
        sqlx::query("CREATE TABLE memo_probe (id INTEGER)")
            .execute(&a)
            .await?;
        let seen: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE name = 'memo_probe'")
                .fetch_optional(&b)
                .await?;
        assert!(seen.is_some());

        let demo = handle.acquire(&config.clone().with_demo_mode(true)).await?;
        assert!(!demo.is_closed());
        assert!(tmp.path().join("vikingbase.sqlite3").exists());
        assert!(tmp.path().join("vikingbase-demo.sqlite3").exists());
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_forces_reopen() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let handle = DbHandle::isolated();
        let config = StoreConfig::new(tmp.path());

        let pool = handle.acquire(&config).await?;
        handle.invalidate(&config.database_name()).await;
        assert!(pool.is_closed());

        let reopened = handle.acquire(&config).await?;
        assert!(!reopened.is_closed());
        Ok(())
    }
}
