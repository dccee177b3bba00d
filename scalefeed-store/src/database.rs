//! SQLite-backed record store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::models::{NewRecord, StoredRecord};
use crate::store::RecordStore;

/// Thread-safe SQLite database of measurement records
pub struct SqliteRecordStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Schema version for migrations
    const SCHEMA_VERSION: i32 = 1;

    /// Open (or create) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = scalefeed_paths::expand_home(db_path)?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(&db_path).context("Failed to open record database")?;

        let db = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        info!("Record store opened at {}", db.db_path.display());
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                weight REAL NOT NULL,
                volume REAL NOT NULL,
                price REAL NOT NULL,
                fee_type TEXT NOT NULL,
                source TEXT,
                timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_timestamp ON records(timestamp)",
            [],
        )?;

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;

        Ok(())
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<StoredRecord> {
        let timestamp_ms: i64 = row.get("timestamp")?;
        let timestamp = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                row.as_ref().column_index("timestamp").unwrap_or_default(),
                Type::Integer,
                format!("timestamp {} ms is out of range", timestamp_ms).into(),
            )
        })?;
        Ok(StoredRecord {
            id: row.get("id")?,
            weight: row.get("weight")?,
            volume: row.get("volume")?,
            price: row.get("price")?,
            fee_type: row.get("fee_type")?,
            source: row.get("source")?,
            timestamp,
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn create(&self, record: &NewRecord) -> Result<StoredRecord> {
        let conn = self.conn.lock();

        // Stored with millisecond precision; the returned record matches what
        // a later read yields.
        let timestamp_ms = record.timestamp.timestamp_millis();

        conn.execute(
            "INSERT INTO records (weight, volume, price, fee_type, source, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.weight,
                record.volume,
                record.price,
                record.fee_type,
                record.source,
                timestamp_ms,
                Utc::now().timestamp_millis(),
            ],
        )
        .context("Failed to insert record")?;

        let mut stored = StoredRecord::from_new(conn.last_insert_rowid(), record);
        stored.timestamp = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or(record.timestamp);
        Ok(stored)
    }

    fn find_latest(&self) -> Result<Option<StoredRecord>> {
        let conn = self.conn.lock();

        let record = conn
            .query_row(
                "SELECT id, weight, volume, price, fee_type, source, timestamp
                 FROM records ORDER BY timestamp DESC, id DESC LIMIT 1",
                [],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query latest record")?;

        Ok(record)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
