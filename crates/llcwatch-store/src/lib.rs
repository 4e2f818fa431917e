//! SQLite record store for llcwatch.
//!
//! Wraps a [`sqlx::SqlitePool`] and enforces the `(name, filing_date)`
//! uniqueness invariant at the storage layer, so repeated or concurrent
//! ingestion runs cannot create duplicate keys.

mod migrations;

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use llcwatch_core::EntityRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

pub const CRATE_NAME: &str = "llcwatch-store";

/// Dates are stored ISO so lexicographic ordering in SQL is chronological.
const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration v{version} failed: {source}")]
    Migration { version: i64, source: sqlx::Error },
    #[error("creating database directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

/// Handle to the llcs table. Cheap to clone; clones share one pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open or create the database at `path` and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let current = self.schema_version().await?;
        for migration in migrations::all_migrations() {
            if migration.version > current {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                sqlx::raw_sql(migration.sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|source| StoreError::Migration {
                        version: migration.version,
                        source,
                    })?;
                sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                    .bind(migration.version)
                    .bind(Utc::now().to_rfc3339())
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn schema_version(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("version")?)
    }

    /// Insert `record` unless its `(name, filing_date)` key already exists.
    /// Returns whether a new row was created; a duplicate key is a defined
    /// non-error outcome.
    pub async fn upsert_if_new(&self, record: &EntityRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO llcs (name, filing_date, link, ingested_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(name, filing_date) DO NOTHING",
        )
        .bind(&record.name)
        .bind(record.filing_date.format(STORED_DATE_FORMAT).to_string())
        .bind(record.link.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records with `filing_date >= cutoff`, newest filing first, ties broken
    /// by insertion order (latest insert first), sliced by `offset`/`limit`.
    pub async fn query_recent(
        &self,
        cutoff: NaiveDate,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, filing_date, link FROM llcs
             WHERE filing_date >= ?
             ORDER BY filing_date DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(cutoff.format(STORED_DATE_FORMAT).to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let stored_date: String = row.try_get("filing_date")?;
            let link: Option<String> = row.try_get("link")?;
            let filing_date = NaiveDate::parse_from_str(&stored_date, STORED_DATE_FORMAT)
                .map_err(|_| {
                    StoreError::Corrupt(format!("filing_date {stored_date:?} is not ISO"))
                })?;
            records.push(EntityRecord {
                name,
                filing_date,
                link,
            });
        }
        Ok(records)
    }

    /// Number of stored records with `filing_date >= cutoff`.
    pub async fn count_since(&self, cutoff: NaiveDate) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM llcs WHERE filing_date >= ?")
            .bind(cutoff.format(STORED_DATE_FORMAT).to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(name: &str, filing_date: NaiveDate) -> EntityRecord {
        EntityRecord {
            name: name.to_string(),
            filing_date,
            link: None,
        }
    }

    async fn test_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("llcs.db")).await.expect("open store")
    }

    #[tokio::test]
    async fn open_and_migrate_is_idempotent() {
        let dir = tempdir().unwrap();
        let first = test_store(&dir).await;
        assert_eq!(first.schema_version().await.unwrap(), 1);
        drop(first);

        let second = test_store(&dir).await;
        assert_eq!(second.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_key_insert_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        let rec = EntityRecord {
            name: "Saguaro Trading LLC".to_string(),
            filing_date: date(2026, 8, 4),
            link: Some("https://registry.example/entity/9".to_string()),
        };

        assert!(store.upsert_if_new(&rec).await.unwrap());
        assert!(!store.upsert_if_new(&rec).await.unwrap());
        assert_eq!(store.count_since(date(2026, 1, 1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_name_different_date_is_a_new_row() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        assert!(store
            .upsert_if_new(&record("Mesa Foods LLC", date(2026, 8, 1)))
            .await
            .unwrap());
        assert!(store
            .upsert_if_new(&record("Mesa Foods LLC", date(2026, 8, 2)))
            .await
            .unwrap());
        assert_eq!(store.count_since(date(2026, 1, 1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_store_queries_to_empty() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        let records = store.query_recent(date(2026, 7, 30), 0, 10).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn query_orders_date_desc_then_insertion_desc() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        store.upsert_if_new(&record("Older LLC", date(2026, 8, 1))).await.unwrap();
        store.upsert_if_new(&record("First Tie LLC", date(2026, 8, 5))).await.unwrap();
        store.upsert_if_new(&record("Second Tie LLC", date(2026, 8, 5))).await.unwrap();

        let records = store.query_recent(date(2026, 1, 1), 0, 10).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["Second Tie LLC", "First Tie LLC", "Older LLC"]
        );
    }

    #[tokio::test]
    async fn cutoff_excludes_older_filings() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        store.upsert_if_new(&record("Recent LLC", date(2026, 8, 3))).await.unwrap();
        store.upsert_if_new(&record("Ancient LLC", date(2025, 12, 1))).await.unwrap();

        let records = store.query_recent(date(2026, 7, 30), 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Recent LLC");
    }

    #[tokio::test]
    async fn offset_and_limit_slice_the_ordering() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        for day in 1..=5u32 {
            store
                .upsert_if_new(&record(&format!("Batch {day} LLC"), date(2026, 8, day)))
                .await
                .unwrap();
        }

        let page1 = store.query_recent(date(2026, 1, 1), 0, 2).await.unwrap();
        let page2 = store.query_recent(date(2026, 1, 1), 2, 2).await.unwrap();
        let page3 = store.query_recent(date(2026, 1, 1), 4, 2).await.unwrap();

        assert_eq!(
            page1.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["Batch 5 LLC", "Batch 4 LLC"]
        );
        assert_eq!(
            page2.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["Batch 3 LLC", "Batch 2 LLC"]
        );
        // Last page is short.
        assert_eq!(
            page3.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["Batch 1 LLC"]
        );
    }

    #[tokio::test]
    async fn link_column_round_trips_including_absent() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir).await;
        store
            .upsert_if_new(&EntityRecord {
                name: "Linked LLC".to_string(),
                filing_date: date(2026, 8, 2),
                link: Some("https://registry.example/entity/77".to_string()),
            })
            .await
            .unwrap();
        store.upsert_if_new(&record("Linkless LLC", date(2026, 8, 1))).await.unwrap();

        let records = store.query_recent(date(2026, 1, 1), 0, 10).await.unwrap();
        assert_eq!(
            records[0].link.as_deref(),
            Some("https://registry.example/entity/77")
        );
        assert_eq!(records[1].link, None);
    }
}
