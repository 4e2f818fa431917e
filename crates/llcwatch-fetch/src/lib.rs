//! Source fetcher: paginated HTTP sessions against the registry search page
//! with selector-driven row extraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llcwatch_core::RawRow;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "llcwatch-fetch";

/// Entry point of the registry's entity search.
pub const DEFAULT_SEARCH_URL: &str = "https://ecorp.azcc.gov/EntitySearch/Index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub search_url: String,
    pub user_agent: String,
    /// Bounded wait for any single page load; a page that never reaches a
    /// loaded state within this window is a fetch failure, not a hang.
    pub timeout: Duration,
    pub max_pages: u32,
    /// Pause between successive result-page requests.
    pub page_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            user_agent: "llcwatch-bot/0.1".to_string(),
            timeout: Duration::from_secs(20),
            max_pages: 5,
            page_delay: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid search url {url:?}: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
}

/// Per-run identity carried into fetch spans and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Seam between the pipeline and the live registry; test doubles implement
/// this to feed fixture rows through the same path.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch_rows(
        &self,
        ctx: &FetchContext,
        max_pages: u32,
    ) -> Result<Vec<RawRow>, FetchError>;
}

/// Live fetcher. Each `fetch_rows` call builds its own HTTP session and
/// drops it on every exit path; nothing is pooled between calls.
#[derive(Debug, Clone)]
pub struct RegistryFetcher {
    config: FetchConfig,
}

impl RegistryFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn build_client(&self) -> Result<reqwest::Client, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(client)
    }

    fn page_url(&self, page: u32) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.config.search_url).map_err(|source| FetchError::Url {
            url: self.config.search_url.clone(),
            source,
        })?;
        if page > 1 {
            url.query_pairs_mut().append_pair("page", &page.to_string());
        }
        Ok(url)
    }

    async fn get_page(&self, client: &reqwest::Client, url: &Url) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            match client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    async fn fetch_all(&self, max_pages: u32) -> Result<Vec<RawRow>, FetchError> {
        let client = self.build_client()?;
        let mut rows = Vec::new();

        for page in 1..=max_pages {
            let url = self.page_url(page)?;
            if page > 1 && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }

            // Entry-page failures are fatal; later pages degrade to
            // "no more data" and keep what was gathered.
            let html = match self.get_page(&client, &url).await {
                Ok(html) => html,
                Err(err) if page == 1 => return Err(err),
                Err(err) => {
                    warn!(page, error = %err, "result page fetch failed, stopping pagination");
                    break;
                }
            };

            let page_rows = extract_rows(&html, &url);
            if page_rows.is_empty() {
                debug!(page, "no recognizable result rows, treating as end of data");
                break;
            }
            debug!(page, rows = page_rows.len(), "extracted result rows");
            rows.extend(page_rows);
        }

        Ok(rows)
    }
}

#[async_trait]
impl RowSource for RegistryFetcher {
    async fn fetch_rows(
        &self,
        ctx: &FetchContext,
        max_pages: u32,
    ) -> Result<Vec<RawRow>, FetchError> {
        let span = info_span!("registry_fetch", run_id = %ctx.run_id, url = %self.config.search_url);
        self.fetch_all(max_pages).instrument(span).await
    }
}

/// Extract raw rows from one result page. The registry renders results as a
/// table whose rows carry the entity name (with an optional detail anchor)
/// in the first cell and the filing date in the second.
fn extract_rows(html: &str, base_url: &Url) -> Vec<RawRow> {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse("table tbody tr").unwrap();
    let cell_sel = Selector::parse("td").unwrap();
    let anchor_sel = Selector::parse("a[href]").unwrap();

    let mut rows = Vec::new();
    for tr in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = tr.select(&cell_sel).collect();
        if cells.len() < 2 {
            continue;
        }
        let name = cell_text(&cells[0]);
        if name.is_empty() {
            continue;
        }
        let filing_date = cell_text(&cells[1]);
        let link = cells[0]
            .select(&anchor_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_link(base_url, href));
        rows.push(RawRow {
            name,
            filing_date,
            link,
        });
    }
    rows
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn resolve_link(base_url: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut resolved = base_url.join(href).ok()?;
    resolved.set_fragment(None);
    Some(resolved.to_string())
}
