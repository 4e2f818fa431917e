//! Ingestion pipeline orchestration: fetch, filter, persist for a recency
//! window. Scheduling lives outside the pipeline; the `watch` entry point
//! arms a cron collaborator that calls back into [`IngestionPipeline::run_once`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use llcwatch_core::{cutoff_for_days_back, filter_recent};
use llcwatch_fetch::{
    BackoffPolicy, FetchConfig, FetchContext, FetchError, RegistryFetcher, RowSource,
    DEFAULT_SEARCH_URL,
};
use llcwatch_store::{Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "llcwatch-ingest";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub db_path: PathBuf,
    pub fetch: FetchConfig,
    /// Default recency window for triggered and scheduled runs.
    pub scrape_days: u32,
    /// Cron expression (with seconds field) for the `watch` mode.
    pub scrape_cron: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let fetch = FetchConfig {
            search_url: std::env::var("LLCWATCH_SEARCH_URL")
                .unwrap_or_else(|_| DEFAULT_SEARCH_URL.to_string()),
            user_agent: std::env::var("LLCWATCH_USER_AGENT")
                .unwrap_or_else(|_| "llcwatch-bot/0.1".to_string()),
            timeout: Duration::from_secs(
                std::env::var("LLCWATCH_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            max_pages: std::env::var("LLCWATCH_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            page_delay: Duration::from_millis(
                std::env::var("LLCWATCH_PAGE_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
            backoff: BackoffPolicy::default(),
        };

        Self {
            db_path: std::env::var("LLCWATCH_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./llcs.db")),
            fetch,
            scrape_days: std::env::var("LLCWATCH_SCRAPE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            scrape_cron: std::env::var("LLCWATCH_SCRAPE_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rows that survived the recency filter, independent of dedupe outcome.
    pub scraped: usize,
    /// Rows whose natural key was novel and created a stored record.
    pub inserted: usize,
}

pub struct IngestionPipeline {
    store: Store,
    source: Arc<dyn RowSource>,
    max_pages: u32,
}

impl IngestionPipeline {
    pub fn new(store: Store, source: Arc<dyn RowSource>, max_pages: u32) -> Self {
        Self {
            store,
            source,
            max_pages,
        }
    }

    /// One fetch -> filter -> persist pass. Idempotent: re-running against
    /// the same fetch result inserts each distinct key at most once.
    pub async fn run_once(&self, days_back: u32) -> Result<IngestSummary, IngestError> {
        let started_at = Utc::now();
        let ctx = FetchContext::new();
        let cutoff = cutoff_for_days_back(started_at.date_naive(), days_back);
        info!(run_id = %ctx.run_id, days_back, %cutoff, "starting ingestion run");

        let raw_rows = self.source.fetch_rows(&ctx, self.max_pages).await?;
        let fetched = raw_rows.len();
        let records = filter_recent(raw_rows, cutoff);
        let scraped = records.len();

        let mut inserted = 0usize;
        for record in &records {
            if self.store.upsert_if_new(record).await? {
                inserted += 1;
            }
        }

        let finished_at = Utc::now();
        info!(
            run_id = %ctx.run_id,
            fetched,
            scraped,
            inserted,
            "ingestion run complete"
        );

        Ok(IngestSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at,
            scraped,
            inserted,
        })
    }
}

/// Open the store and run one ingestion pass with `days_back`.
pub async fn run_ingestion(config: &IngestConfig, days_back: u32) -> anyhow::Result<IngestSummary> {
    let store = Store::open(&config.db_path)
        .await
        .context("opening record store")?;
    let fetcher = RegistryFetcher::new(config.fetch.clone());
    let pipeline = IngestionPipeline::new(store, Arc::new(fetcher), config.fetch.max_pages);
    Ok(pipeline.run_once(days_back).await?)
}

/// Build the cron collaborator that triggers ingestion runs. The scheduler
/// owns the cadence; the pipeline itself never self-schedules.
pub async fn build_scheduler(
    pipeline: Arc<IngestionPipeline>,
    cron: &str,
    days_back: u32,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once(days_back).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    scraped = summary.scraped,
                    inserted = summary.inserted,
                    "scheduled ingestion complete"
                ),
                Err(err) => warn!(error = %err, "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run scheduled ingestion until interrupted.
pub async fn watch_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let store = Store::open(&config.db_path)
        .await
        .context("opening record store")?;
    let fetcher = RegistryFetcher::new(config.fetch.clone());
    let pipeline = Arc::new(IngestionPipeline::new(
        store,
        Arc::new(fetcher),
        config.fetch.max_pages,
    ));

    let sched = build_scheduler(pipeline, &config.scrape_cron, config.scrape_days).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.scrape_cron, "watching registry on schedule, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Days;
    use llcwatch_core::{RawRow, SOURCE_DATE_FORMAT};
    use tempfile::tempdir;

    struct FixtureSource {
        rows: Vec<RawRow>,
    }

    #[async_trait]
    impl RowSource for FixtureSource {
        async fn fetch_rows(
            &self,
            _ctx: &FetchContext,
            _max_pages: u32,
        ) -> Result<Vec<RawRow>, FetchError> {
            Ok(self.rows.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl RowSource for FailingSource {
        async fn fetch_rows(
            &self,
            _ctx: &FetchContext,
            _max_pages: u32,
        ) -> Result<Vec<RawRow>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 504,
                url: "https://registry.example/EntitySearch/Index".to_string(),
            })
        }
    }

    fn source_date(days_ago: u64) -> String {
        let date = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(days_ago))
            .unwrap();
        date.format(SOURCE_DATE_FORMAT).to_string()
    }

    fn row(name: &str, days_ago: u64) -> RawRow {
        RawRow {
            name: name.to_string(),
            filing_date: source_date(days_ago),
            link: None,
        }
    }

    async fn pipeline_with(
        dir: &tempfile::TempDir,
        source: Arc<dyn RowSource>,
    ) -> (IngestionPipeline, Store) {
        let store = Store::open(dir.path().join("llcs.db")).await.unwrap();
        let pipeline = IngestionPipeline::new(store.clone(), source, 5);
        (pipeline, store)
    }

    #[tokio::test]
    async fn window_filters_then_persists_then_serves_newest_first() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FixtureSource {
            rows: vec![
                row("Today LLC", 0),
                row("Three Days LLC", 3),
                row("Ten Days LLC", 10),
            ],
        });
        let (pipeline, store) = pipeline_with(&dir, source).await;

        let summary = pipeline.run_once(7).await.unwrap();
        assert_eq!(summary.scraped, 2);
        assert_eq!(summary.inserted, 2);

        let cutoff = cutoff_for_days_back(Utc::now().date_naive(), 7);
        let records = store.query_recent(cutoff, 0, 10).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["Today LLC", "Three Days LLC"]
        );
    }

    #[tokio::test]
    async fn rerunning_the_same_ingestion_is_idempotent() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FixtureSource {
            rows: vec![row("Repeat LLC", 1), row("Encore LLC", 2)],
        });
        let (pipeline, store) = pipeline_with(&dir, source).await;

        let first = pipeline.run_once(7).await.unwrap();
        assert_eq!((first.scraped, first.inserted), (2, 2));

        let second = pipeline.run_once(7).await.unwrap();
        // Scraped count still reports the filtered rows; nothing new lands.
        assert_eq!((second.scraped, second.inserted), (2, 0));

        let cutoff = cutoff_for_days_back(Utc::now().date_naive(), 7);
        assert_eq!(store.count_since(cutoff).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unparseable_rows_are_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FixtureSource {
            rows: vec![
                row("Valid LLC", 0),
                RawRow {
                    name: "Pending LLC".to_string(),
                    filing_date: "pending".to_string(),
                    link: None,
                },
            ],
        });
        let (pipeline, _store) = pipeline_with(&dir, source).await;

        let summary = pipeline.run_once(7).await.unwrap();
        assert_eq!(summary.scraped, 1);
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_run() {
        let dir = tempdir().unwrap();
        let (pipeline, store) = pipeline_with(&dir, Arc::new(FailingSource)).await;

        let err = pipeline.run_once(7).await.unwrap_err();
        assert!(matches!(err, IngestError::Fetch(_)));

        let cutoff = cutoff_for_days_back(Utc::now().date_naive(), 365);
        assert_eq!(store.count_since(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_days_back_keeps_only_today() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FixtureSource {
            rows: vec![row("Today LLC", 0), row("Yesterday LLC", 1)],
        });
        let (pipeline, _store) = pipeline_with(&dir, source).await;

        let summary = pipeline.run_once(0).await.unwrap();
        assert_eq!(summary.scraped, 1);
    }
}
