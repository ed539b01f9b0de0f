//! Versioned schema upgrades for the object store.
//!
//! The on-disk version lives in `PRAGMA user_version`. Upgrades are a
//! sequence of idempotent migrators keyed by version: each one only creates
//! the stores and indexes its version introduced, never drops anything, and
//! is invoked only when the on-disk version is lower. DDL is derived from
//! the store registry so the schema and the registry cannot drift.

use sqlx::SqlitePool;
use tracing::info;

use crate::stores::{IndexKind, StoreDef, STORES};

/// Current schema version. Bump when the registry gains stores or indexes.
pub const DATABASE_VERSION: i64 = 3;

fn create_table_sql(def: &StoreDef) -> String {
    let mut columns = vec![
        "key TEXT PRIMARY KEY".to_string(),
        "data TEXT NOT NULL".to_string(),
    ];
    for index in def.indexes {
        let ty = match index.kind {
            IndexKind::Text => "TEXT",
            IndexKind::Integer => "INTEGER",
        };
        columns.push(format!("idx_{} {}", index.name, ty));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        def.name.table(),
        columns.join(", ")
    )
}

fn create_index_sql(def: &StoreDef) -> Vec<String> {
    def.indexes
        .iter()
        .map(|index| {
            format!(
                "CREATE INDEX IF NOT EXISTS ix_{}_{} ON {} (idx_{})",
                def.name.as_str(),
                index.name,
                def.name.table(),
                index.name
            )
        })
        .collect()
}

async fn current_version(pool: &SqlitePool) -> anyhow::Result<i64> {
    let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

/// Applies every pending schema migrator. Safe to call on every open.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let on_disk = current_version(pool).await?;
    if on_disk >= DATABASE_VERSION {
        info!(
            target = "vikingbase",
            event = "schema_up_to_date",
            version = on_disk
        );
        return Ok(());
    }

    for version in (on_disk + 1)..=DATABASE_VERSION {
        let mut tx = pool.begin().await?;
        for def in STORES.iter().filter(|d| d.added_in == version) {
            let ddl = create_table_sql(def);
            info!(target = "vikingbase", event = "schema_create_store", store = %def.name, version);
            sqlx::query(&ddl).execute(&mut *tx).await?;
            for ddl in create_index_sql(def) {
                sqlx::query(&ddl).execute(&mut *tx).await?;
            }
        }
        // PRAGMA does not accept bind parameters.
        sqlx::query(&format!("PRAGMA user_version = {version}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(
            target = "vikingbase",
            event = "schema_version_applied",
            version
        );
    }

    Ok(())
}
