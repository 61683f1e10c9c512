use chrono::{TimeZone, Utc};

use crate::db::Database;
use crate::error::EngineError;
use crate::models::execution::{LogLine, LogStream};

/// Durable archive for execution log lines.
///
/// The coordinator flushes here once, at execution completion; per-line
/// writes would serialize the hot path on the database lock.
#[derive(Clone)]
pub struct LogStore {
    db: Database,
}

impl LogStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn flush(&self, lines: Vec<LogLine>) -> Result<(), EngineError> {
        if lines.is_empty() {
            return Ok(());
        }
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "INSERT OR IGNORE INTO execution_logs (execution_id, seq, stream, ts, text) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for line in &lines {
                    stmt.execute(rusqlite::params![
                        line.execution_id,
                        line.seq as i64,
                        line.stream.as_str(),
                        line.ts.timestamp_millis(),
                        line.text,
                    ])?;
                }
                Ok(())
            })
            .await
    }

    pub async fn list(&self, execution_id: &str) -> Result<Vec<LogLine>, EngineError> {
        let execution_id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, seq, stream, ts, text FROM execution_logs \
                     WHERE execution_id = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![execution_id], |row| {
                        Ok(LogLine {
                            execution_id: row.get(0).unwrap_or_default(),
                            seq: row.get::<_, i64>(1).unwrap_or(0) as u64,
                            stream: match row.get::<_, String>(2).unwrap_or_default().as_str() {
                                "stderr" => LogStream::Stderr,
                                _ => LogStream::Stdout,
                            },
                            ts: Utc
                                .timestamp_millis_opt(row.get::<_, i64>(3).unwrap_or(0))
                                .single()
                                .unwrap_or_else(Utc::now),
                            text: row.get(4).unwrap_or_default(),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}
