//! SQL migration definitions for the llcwatch database.
//!
//! Migrations are applied in ascending version order on store open.

pub(crate) struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: llcs table with natural-key uniqueness",
        sql: r#"
-- One row per observed filing. (name, filing_date) is the natural key;
-- id orders ties by insertion.
CREATE TABLE IF NOT EXISTS llcs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    filing_date TEXT NOT NULL,
    link        TEXT,
    ingested_at TEXT NOT NULL,
    UNIQUE(name, filing_date)
);

CREATE INDEX IF NOT EXISTS idx_llcs_filing_date ON llcs(filing_date);
"#,
    }]
}
