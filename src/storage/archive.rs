//! SQLite cycle archive.
//!
//! Append-only history of completed cycles for later analysis. One row
//! per cycle; decimals are stored as text to avoid float drift.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

use crate::types::{ArchiveRecord, WardenError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cycle_archive (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle_number INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    risk_score REAL,
    risk_multiplier_pct REAL,
    intents_approved INTEGER NOT NULL,
    intents_rejected INTEGER NOT NULL,
    closes_issued INTEGER NOT NULL,
    available_funds TEXT NOT NULL,
    allocated_notional TEXT NOT NULL
)
"#;

pub struct CycleArchive {
    pool: SqlitePool,
}

impl CycleArchive {
    /// Open (creating if missing) the archive database at `path`.
    /// `:memory:` yields an ephemeral archive for tests.
    pub async fn open(path: &str) -> Result<Self, WardenError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| WardenError::Storage(format!("Bad archive path {path}: {e}")))?
            .create_if_missing(true);

        // Single connection: the archive is written by one leader and the
        // in-memory test database is per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| WardenError::Storage(format!("Failed to open archive {path}: {e}")))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| WardenError::Storage(format!("Failed to init archive schema: {e}")))?;

        Ok(Self { pool })
    }

    /// Append records. Each record is one completed cycle.
    pub async fn append(&self, records: &[ArchiveRecord]) -> Result<(), WardenError> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO cycle_archive (
                    cycle_number, started_at, duration_ms, outcome,
                    risk_score, risk_multiplier_pct,
                    intents_approved, intents_rejected, closes_issued,
                    available_funds, allocated_notional
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.cycle_number as i64)
            .bind(record.started_at.to_rfc3339())
            .bind(record.duration_ms as i64)
            .bind(&record.outcome)
            .bind(record.risk_score)
            .bind(record.risk_multiplier_pct)
            .bind(record.intents_approved as i64)
            .bind(record.intents_rejected as i64)
            .bind(record.closes_issued as i64)
            .bind(record.available_funds.to_string())
            .bind(record.allocated_notional.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| WardenError::Storage(format!("Archive insert failed: {e}")))?;
        }

        debug!(count = records.len(), "Archive records appended");
        Ok(())
    }

    /// Most recent archived cycles, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ArchiveRecord>, WardenError> {
        let rows = sqlx::query(
            r#"
            SELECT cycle_number, started_at, duration_ms, outcome,
                   risk_score, risk_multiplier_pct,
                   intents_approved, intents_rejected, closes_issued,
                   available_funds, allocated_notional
            FROM cycle_archive
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WardenError::Storage(format!("Archive query failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let started_at: String = row
                    .try_get("started_at")
                    .map_err(|e| WardenError::Storage(format!("Archive row read failed: {e}")))?;
                let started_at = DateTime::parse_from_rfc3339(&started_at)
                    .map_err(|e| WardenError::Storage(format!("Bad archive timestamp: {e}")))?
                    .with_timezone(&Utc);

                let decimal = |name: &str| -> Result<Decimal, WardenError> {
                    let text: String = row.try_get(name).map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })?;
                    Decimal::from_str(&text)
                        .map_err(|e| WardenError::Storage(format!("Bad archive decimal: {e}")))
                };

                Ok(ArchiveRecord {
                    cycle_number: row.try_get::<i64, _>("cycle_number").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })? as u64,
                    started_at,
                    duration_ms: row.try_get::<i64, _>("duration_ms").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })? as u64,
                    outcome: row.try_get("outcome").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })?,
                    risk_score: row.try_get("risk_score").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })?,
                    risk_multiplier_pct: row.try_get("risk_multiplier_pct").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })?,
                    intents_approved: row.try_get::<i64, _>("intents_approved").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })? as u32,
                    intents_rejected: row.try_get::<i64, _>("intents_rejected").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })? as u32,
                    closes_issued: row.try_get::<i64, _>("closes_issued").map_err(|e| {
                        WardenError::Storage(format!("Archive row read failed: {e}"))
                    })? as u32,
                    available_funds: decimal("available_funds")?,
                    allocated_notional: decimal("allocated_notional")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
