//! SQLite catalog of accepted images.
//!
//! The catalog is the single source of truth. Uniqueness of
//! `(provider, provider_native_id)` and of `content_hash` is enforced by the
//! schema, and [`Catalog::insert_if_absent`] is one statement, so concurrent
//! writers can never create duplicate rows.

mod query;
mod schema;

pub use query::{RecordFilter, RecordIter};
pub use schema::{MIGRATIONS, MIGRATIONS_TABLE};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::model::{ImageRecord, Label, QualityFlag, RunCounts, RunSummary};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_BATCH_SIZE: usize = 256;

const RECORD_COLUMNS: &str = r#"
    record_id, provider, provider_native_id, content_hash, perceptual_hash,
    storage_path, width, height, label, quality_flags, ingested_at,
    source_url, content_type, byte_size, search_query, query_tags
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same native id or content hash already exists.
    AlreadyPresent,
}

/// A stored run, as reported by `fretlog stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub summary: RunSummary,
    pub state: String,
    pub error_message: Option<String>,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn read_record(row: &Row) -> rusqlite::Result<ImageRecord> {
    let label: String = row.get(8)?;
    let flags: String = row.get(9)?;
    let ingested_at: String = row.get(10)?;
    let byte_size: Option<i64> = row.get(13)?;
    let tags: String = row.get(15)?;

    Ok(ImageRecord {
        record_id: row.get(0)?,
        provider: row.get(1)?,
        provider_native_id: row.get(2)?,
        content_hash: row.get(3)?,
        perceptual_hash: row.get(4)?,
        storage_path: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        label: label.parse().unwrap_or_default(),
        quality_flags: parse_json::<Vec<QualityFlag>>(9, &flags)?,
        ingested_at: parse_timestamp(10, &ingested_at)?,
        source_url: row.get(11)?,
        content_type: row.get(12)?,
        byte_size: byte_size.and_then(|b| u64::try_from(b).ok()),
        search_query: row.get(14)?,
        query_tags: parse_json::<Vec<String>>(15, &tags)?,
    })
}

fn read_run(row: &Row) -> rusqlite::Result<RunRow> {
    let started_at: String = row.get(1)?;
    let finished_at: String = row.get(2)?;
    let count = |idx: usize| row.get::<_, i64>(idx).map(|v| v.max(0) as u64);

    Ok(RunRow {
        summary: RunSummary {
            run_id: row.get(0)?,
            started_at: parse_timestamp(1, &started_at)?,
            finished_at: parse_timestamp(2, &finished_at)?,
            counts: RunCounts {
                fetched: count(5)?,
                rejected_duplicate: count(6)?,
                rejected_quality: count(7)?,
                rejected_error: count(8)?,
                accepted: count(9)?,
            },
            cancelled: row.get(4)?,
        },
        state: row.get(3)?,
        error_message: row.get(10)?,
    })
}

impl Catalog {
    /// Open (creating if needed) and migrate the catalog at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`Catalog::open`], with writes waiting at most `busy_timeout` on a
    /// locked database before failing with [`StorageError::Busy`].
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            StorageError::Unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_connection(conn, busy_timeout)?;
        info!(path = %path.display(), "Catalog opened");
        Ok(catalog)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Self::from_connection(conn, DEFAULT_BUSY_TIMEOUT)
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self, StorageError> {
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Catalog journal mode");

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("catalog connection lock poisoned".to_string()))
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        conn.execute_batch(MIGRATIONS_TABLE)?;

        for (version, name, sql) in MIGRATIONS {
            let applied: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?)",
                [version],
                |row| row.get(0),
            )?;
            if applied {
                continue;
            }

            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name) VALUES (?, ?)",
                params![version, name],
            )?;
            tx.commit()?;
            info!(version, name, "Applied catalog migration");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Cheap liveness check used at run start.
    pub fn ping(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Insert unless a row with the same native id or content hash exists.
    pub fn insert_if_absent(&self, record: &ImageRecord) -> Result<InsertOutcome, StorageError> {
        let flags = serde_json::to_string(&record.quality_flags)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let tags = serde_json::to_string(&record.query_tags)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let byte_size = record.byte_size.and_then(|b| i64::try_from(b).ok());

        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            INSERT INTO images (
                record_id, provider, provider_native_id, content_hash, perceptual_hash,
                storage_path, width, height, label, quality_flags, ingested_at,
                source_url, content_type, byte_size, search_query, query_tags
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
            params![
                record.record_id,
                record.provider,
                record.provider_native_id,
                record.content_hash,
                record.perceptual_hash,
                record.storage_path,
                i64::from(record.width),
                i64::from(record.height),
                record.label.as_str(),
                flags,
                format_timestamp(&record.ingested_at),
                record.source_url,
                record.content_type,
                byte_size,
                record.search_query,
                tags,
            ],
        )?;

        Ok(if changed == 0 {
            InsertOutcome::AlreadyPresent
        } else {
            InsertOutcome::Inserted
        })
    }

    pub fn get(&self, record_id: &str) -> Result<Option<ImageRecord>, StorageError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM images WHERE record_id = ?", RECORD_COLUMNS);
        let record = conn.query_row(&sql, [record_id], read_record).optional()?;
        Ok(record)
    }

    pub fn contains_content_hash(&self, content_hash: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM images WHERE content_hash = ?)",
            [content_hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn contains_native(&self, provider: &str, provider_native_id: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM images WHERE provider = ? AND provider_native_id = ?)",
            params![provider, provider_native_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// `(record_id, perceptual_hash)` for every record, used to seed the near-duplicate index.
    pub fn perceptual_hashes(&self) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT record_id, perceptual_hash FROM images")?;
        let hashes = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hashes)
    }

    /// Lazily stream records matching `filter`, oldest `record_id` first.
    pub fn query(&self, filter: RecordFilter) -> RecordIter<'_> {
        RecordIter::new(self, filter, QUERY_BATCH_SIZE)
    }

    pub fn query_batched(&self, filter: RecordFilter, batch_size: usize) -> RecordIter<'_> {
        RecordIter::new(self, filter, batch_size)
    }

    pub(crate) fn fetch_batch(
        &self,
        filter: &RecordFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageRecord>, StorageError> {
        let (mut conditions, mut values) = filter.conditions();
        if let Some(after) = after {
            conditions.push("record_id > ?");
            values.push(rusqlite::types::Value::Text(after.to_string()));
        }
        values.push(rusqlite::types::Value::Integer(limit as i64));

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM images {} ORDER BY record_id LIMIT ?",
            RECORD_COLUMNS, where_clause
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        let (conditions, values) = filter.conditions();
        let mut sql = "SELECT COUNT(*) FROM images".to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let conn = self.lock()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn counts_by_provider_and_label(&self) -> Result<Vec<(String, Label, u64)>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT provider, label, COUNT(*)
            FROM images
            GROUP BY provider, label
            ORDER BY provider, label
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                let label: String = row.get(1)?;
                Ok((
                    row.get::<_, String>(0)?,
                    label.parse::<Label>().unwrap_or_default(),
                    row.get::<_, i64>(2)?.max(0) as u64,
                ))
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Write hook for the external labeling process. Returns whether the record exists.
    pub fn set_label(&self, record_id: &str, label: Label) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE images SET label = ? WHERE record_id = ?",
            params![label.as_str(), record_id],
        )?;
        Ok(changed > 0)
    }

    pub fn record_run(
        &self,
        summary: &RunSummary,
        state: &str,
        error_message: Option<&str>,
    ) -> Result<(), StorageError> {
        let c = &summary.counts;
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO runs (
                run_id, started_at, finished_at, state, cancelled,
                fetched, rejected_duplicate, rejected_quality, rejected_error, accepted,
                error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                summary.run_id,
                format_timestamp(&summary.started_at),
                format_timestamp(&summary.finished_at),
                state,
                summary.cancelled,
                as_i64(c.fetched),
                as_i64(c.rejected_duplicate),
                as_i64(c.rejected_quality),
                as_i64(c.rejected_error),
                as_i64(c.accepted),
                error_message,
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRow>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, started_at, finished_at, state, cancelled,
                   fetched, rejected_duplicate, rejected_quality, rejected_error, accepted,
                   error_message
            FROM runs
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )?;
        let runs = stmt
            .query_map([limit as i64], read_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
