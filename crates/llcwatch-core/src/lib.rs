//! Core domain model and recency filtering for llcwatch.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "llcwatch-core";

/// Date format the registry renders filing dates in.
pub const SOURCE_DATE_FORMAT: &str = "%m/%d/%Y";

/// Raw triple scraped from one result row, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub name: String,
    pub filing_date: String,
    pub link: Option<String>,
}

/// Canonical persisted record: one filing observed at the registry.
///
/// `(name, filing_date)` is the natural key; a second observation of the
/// same pair is a no-op at the store layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    pub filing_date: NaiveDate,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unparseable filing date {raw:?}, expected MM/DD/YYYY")]
pub struct DateParseError {
    pub raw: String,
}

/// Parse a filing date as the registry renders it (`MM/DD/YYYY`).
pub fn parse_filing_date(raw: &str) -> Result<NaiveDate, DateParseError> {
    NaiveDate::parse_from_str(raw.trim(), SOURCE_DATE_FORMAT).map_err(|_| DateParseError {
        raw: raw.to_string(),
    })
}

/// Earliest filing date still considered recent for a `days_back` window.
/// The cutoff is inclusive: a record filed exactly on it is retained.
pub fn cutoff_for_days_back(today: NaiveDate, days_back: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(days_back)))
        .unwrap_or(NaiveDate::MIN)
}

/// Map raw rows to canonical records, keeping only rows whose date parses
/// and falls on or after `cutoff`. Rows with a blank name or an unparseable
/// date are dropped, never errors.
pub fn filter_recent(rows: Vec<RawRow>, cutoff: NaiveDate) -> Vec<EntityRecord> {
    rows.into_iter()
        .filter_map(|row| {
            let name = row.name.trim();
            if name.is_empty() {
                return None;
            }
            let filing_date = parse_filing_date(&row.filing_date).ok()?;
            if filing_date < cutoff {
                return None;
            }
            Some(EntityRecord {
                name: name.to_string(),
                filing_date,
                link: row.link,
            })
        })
        .collect()
}
