use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skein_core::usage::AggregatedMetrics;

use crate::metrics::MetricsAggregator;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One persisted per-model row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshotRow {
    pub id: i64,
    pub timestamp: String,
    pub model: String,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_duration_ms: u64,
    pub cost_usd: f64,
}

#[derive(Clone, Debug, Default)]
pub struct HistoryQuery {
    pub model: Option<String>,
    /// RFC 3339 lower bound.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Periodic snapshots of the aggregated per-model counters in SQLite.
pub struct MetricsHistory {
    db: Mutex<Connection>,
}

impl MetricsHistory {
    pub fn open(db_path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 model TEXT NOT NULL,
                 calls INTEGER NOT NULL,
                 input_tokens INTEGER NOT NULL,
                 output_tokens INTEGER NOT NULL,
                 total_duration_ms INTEGER NOT NULL,
                 cost_usd REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_usage_model ON usage_snapshots(model, timestamp);",
        )?;
        Ok(Self { db: Mutex::new(conn) })
    }

    /// Persist one row per model. Returns the number of rows written.
    pub fn record(&self, metrics: &AggregatedMetrics) -> Result<usize, HistoryError> {
        let now = metrics.captured_at.unwrap_or_else(Utc::now).to_rfc3339();
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let mut count = 0;
        for (model, usage) in &metrics.by_model {
            tx.execute(
                "INSERT INTO usage_snapshots
                     (timestamp, model, calls, input_tokens, output_tokens, total_duration_ms, cost_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    now,
                    model,
                    usage.calls as i64,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.total_duration_ms as i64,
                    usage.cost_usd
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn query(&self, q: &HistoryQuery) -> Result<Vec<UsageSnapshotRow>, HistoryError> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, model, calls, input_tokens, output_tokens, total_duration_ms, cost_usd
             FROM usage_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(model) = &q.model {
            sql.push_str(&format!(" AND model = ?{}", params.len() + 1));
            params.push(Box::new(model.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(" ORDER BY id DESC");
        sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(UsageSnapshotRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                model: row.get(2)?,
                calls: row.get::<_, i64>(3)? as u64,
                input_tokens: row.get::<_, i64>(4)? as u64,
                output_tokens: row.get::<_, i64>(5)? as u64,
                total_duration_ms: row.get::<_, i64>(6)? as u64,
                cost_usd: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete rows older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, HistoryError> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(retention_days as i64))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        let db = self.db.lock();
        Ok(db.execute("DELETE FROM usage_snapshots WHERE timestamp < ?1", rusqlite::params![cutoff])?)
    }
}

/// Snapshot the aggregator into `history` every `interval` and prune once a
/// cycle, until `cancel` fires.
pub fn spawn_history_task(
    aggregator: Arc<MetricsAggregator>,
    history: Arc<MetricsHistory>,
    interval: Duration,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = aggregator.snapshot();
                    match history.record(&snapshot) {
                        Ok(rows) => tracing::debug!(rows, "usage history snapshot"),
                        Err(e) => tracing::warn!(error = %e, "usage history snapshot failed"),
                    }
                    if let Err(e) = history.prune(retention_days) {
                        tracing::warn!(error = %e, "usage history prune failed");
                    }
                }
            }
        }
    })
}
