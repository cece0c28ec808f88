//! SQLite-backed reliability store.
//!
//! One row per source in the `reliability` table. Timestamps are RFC 3339
//! text with nanosecond precision so a record read back compares equal to
//! the one written. Every read-modify-write runs inside an IMMEDIATE
//! transaction, which takes the database write lock up front; a second
//! process holding that lock past `busy_timeout` surfaces as
//! [`StoreError::StoreContention`]. `peek` on a file-backed store reads
//! through its own connection and is not held up by a stalled writer.

use super::{check_accuracy, check_identifier, ReliabilityStore, StoreError};
use crate::locks::{KeyGuard, KeyedMutex};
use augur_core::{ReliabilityParams, ReliabilityRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const SCHEMA_USER_VERSION: i64 = 1;

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS reliability (
        source_id         TEXT PRIMARY KEY NOT NULL,
        reliability       REAL NOT NULL,
        last_updated      TEXT NOT NULL,
        observation_count INTEGER NOT NULL DEFAULT 0
    );
";

/// Durable reliability store.
///
/// Writes go through one connection. File-backed stores also hold a
/// read-only connection for `peek`, which under WAL never waits on the
/// writer. In-memory databases are private to their connection, so there
/// `peek` shares the writer.
pub struct SqliteReliabilityStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    locks: KeyedMutex,
    params: ReliabilityParams,
    lock_timeout: Duration,
}

impl std::fmt::Debug for SqliteReliabilityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReliabilityStore")
            .field("params", &self.params)
            .field("lock_timeout", &self.lock_timeout)
            .field("read_connection", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteReliabilityStore {
    /// Open (or create) a database file.
    pub fn open(
        path: impl AsRef<Path>,
        params: ReliabilityParams,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        params.validate()?;
        let path = path.as_ref();
        let writer = Connection::open(path).map_err(backend)?;
        configure_writer(&writer, lock_timeout)?;

        // Opened after the writer so the schema and WAL files exist.
        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(backend)?;
        reader.busy_timeout(lock_timeout).map_err(backend)?;

        tracing::debug!(path = %path.display(), "Opened reliability database");
        Ok(Self::from_parts(writer, Some(reader), params, lock_timeout))
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(
        params: ReliabilityParams,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        params.validate()?;
        let writer = Connection::open_in_memory().map_err(backend)?;
        configure_writer(&writer, lock_timeout)?;
        Ok(Self::from_parts(writer, None, params, lock_timeout))
    }

    fn from_parts(
        writer: Connection,
        reader: Option<Connection>,
        params: ReliabilityParams,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            reader: reader.map(Mutex::new),
            locks: KeyedMutex::new(),
            params,
            lock_timeout,
        }
    }

    fn contention(&self, source_id: &str) -> StoreError {
        StoreError::StoreContention {
            source_id: source_id.to_string(),
            waited: self.lock_timeout,
        }
    }

    /// Take the per-source lock, then `conn`.
    fn acquire<'a>(
        &'a self,
        source_id: &str,
        conn: &'a Mutex<Connection>,
    ) -> Result<(KeyGuard<'a>, MutexGuard<'a, Connection>), StoreError> {
        let key = self
            .locks
            .acquire(source_id, self.lock_timeout)
            .ok_or_else(|| self.contention(source_id))?;
        let conn = conn
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| self.contention(source_id))?;
        Ok((key, conn))
    }

    fn map_sql(&self, source_id: &str, err: rusqlite::Error) -> StoreError {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                self.contention(source_id)
            }
            _ => backend(err),
        }
    }

    /// Read without creating a missing record.
    fn read_only(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReliabilityRecord, StoreError> {
        check_identifier(source_id)?;
        let conn = self.reader.as_ref().unwrap_or(&self.writer);
        let (_key, conn) = self.acquire(source_id, conn)?;

        let record = load(&conn, source_id)
            .map_err(|e| self.map_sql(source_id, e))?
            .map(|row| row.into_record(source_id))
            .transpose()?
            .unwrap_or_else(|| ReliabilityRecord::fresh(source_id, self.params.prior, now));
        Ok(self.params.snapshot(&record, now))
    }

    /// Read, persisting a fresh record if the source is unseen.
    fn read_or_create(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReliabilityRecord, StoreError> {
        check_identifier(source_id)?;
        let (_key, mut conn) = self.acquire(source_id, &self.writer)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.map_sql(source_id, e))?;

        let record = match load(&tx, source_id).map_err(|e| self.map_sql(source_id, e))? {
            Some(row) => row.into_record(source_id)?,
            None => {
                let fresh = ReliabilityRecord::fresh(source_id, self.params.prior, now);
                store(&tx, &fresh).map_err(|e| self.map_sql(source_id, e))?;
                tracing::debug!(source_id = %source_id, prior = fresh.reliability, "Created reliability record");
                fresh
            }
        };
        tx.commit().map_err(|e| self.map_sql(source_id, e))?;

        Ok(self.params.snapshot(&record, now))
    }
}

impl ReliabilityStore for SqliteReliabilityStore {
    fn params(&self) -> &ReliabilityParams {
        &self.params
    }

    fn get(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError> {
        self.read_or_create(source_id, now)
    }

    fn peek(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError> {
        self.read_only(source_id, now)
    }

    fn update(
        &self,
        source_id: &str,
        accuracy: f64,
        now: DateTime<Utc>,
    ) -> Result<ReliabilityRecord, StoreError> {
        check_identifier(source_id)?;
        check_accuracy(source_id, accuracy)?;
        let (_key, mut conn) = self.acquire(source_id, &self.writer)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.map_sql(source_id, e))?;

        let current = match load(&tx, source_id).map_err(|e| self.map_sql(source_id, e))? {
            Some(row) => row.into_record(source_id)?,
            None => ReliabilityRecord::fresh(source_id, self.params.prior, now),
        };
        let updated = self.params.apply_feedback(&current, accuracy, now);

        store(&tx, &updated).map_err(|e| self.map_sql(source_id, e))?;
        tx.commit().map_err(|e| self.map_sql(source_id, e))?;

        tracing::debug!(
            source_id = %source_id,
            accuracy,
            reliability = updated.reliability,
            observations = updated.observation_count,
            "Reliability updated"
        );
        Ok(updated)
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn configure_writer(conn: &Connection, lock_timeout: Duration) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )
    .map_err(backend)?;
    conn.busy_timeout(lock_timeout).map_err(backend)?;
    migrate(conn)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(backend)?;

    if version > SCHEMA_USER_VERSION {
        return Err(StoreError::Backend(format!(
            "database schema version {version} is newer than supported version {SCHEMA_USER_VERSION}"
        )));
    }
    if version < SCHEMA_USER_VERSION {
        conn.execute_batch(CREATE_TABLE).map_err(backend)?;
        conn.pragma_update(None, "user_version", SCHEMA_USER_VERSION)
            .map_err(backend)?;
        tracing::debug!(from = version, to = SCHEMA_USER_VERSION, "Migrated reliability schema");
    }
    Ok(())
}

/// A row as stored, before timestamp and count are checked.
struct StoredRow {
    reliability: f64,
    last_updated: String,
    observation_count: i64,
}

impl StoredRow {
    fn into_record(self, source_id: &str) -> Result<ReliabilityRecord, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRecord {
            source_id: source_id.to_string(),
            reason,
        };

        let last_updated = DateTime::parse_from_rfc3339(&self.last_updated)
            .map_err(|e| corrupt(format!("bad last_updated {:?}: {e}", self.last_updated)))?
            .with_timezone(&Utc);
        let observation_count = u64::try_from(self.observation_count)
            .map_err(|_| corrupt(format!("negative observation_count {}", self.observation_count)))?;
        if !self.reliability.is_finite() {
            return Err(corrupt(format!("non-finite reliability {}", self.reliability)));
        }

        Ok(ReliabilityRecord {
            source_id: source_id.to_string(),
            reliability: self.reliability,
            last_updated,
            observation_count,
        })
    }
}

fn load(conn: &Connection, source_id: &str) -> rusqlite::Result<Option<StoredRow>> {
    conn.query_row(
        "SELECT reliability, last_updated, observation_count
         FROM reliability WHERE source_id = ?1",
        params![source_id],
        |row| {
            Ok(StoredRow {
                reliability: row.get(0)?,
                last_updated: row.get(1)?,
                observation_count: row.get(2)?,
            })
        },
    )
    .optional()
}

fn store(conn: &Connection, record: &ReliabilityRecord) -> rusqlite::Result<()> {
    // Counts beyond i64::MAX are not reachable in practice; saturate rather than wrap.
    let count = i64::try_from(record.observation_count).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO reliability (source_id, reliability, last_updated, observation_count)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source_id) DO UPDATE SET
             reliability = excluded.reliability,
             last_updated = excluded.last_updated,
             observation_count = excluded.observation_count",
        params![
            record.source_id,
            record.reliability,
            record.last_updated.to_rfc3339_opts(SecondsFormat::Nanos, true),
            count,
        ],
    )?;
    Ok(())
}
