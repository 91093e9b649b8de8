//! SQLite stack store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::schema::SCHEMA;
use super::{Precondition, StackKey, StackStore, StoreError, StoreResult, Version, Versioned};
use crate::fiber::FiberSnapshot;

/// Thread-safe SQLite handle storing one row per stack
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn current_version(conn: &Connection, key: &StackKey) -> StoreResult<Option<Version>> {
        let version = conn.query_row(
            "SELECT version FROM dialog_stacks WHERE address = ?1 AND stack_id = ?2",
            params![key.address, key.stack],
            |row| row.get::<_, i64>(0),
        );
        match version {
            Ok(version) => Ok(Some(from_sql_version(version))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }
}

#[async_trait]
impl StackStore for SqliteStore {
    async fn load(&self, key: &StackKey) -> StoreResult<Option<Versioned>> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT snapshot, version, updated_at FROM dialog_stacks
                 WHERE address = ?1 AND stack_id = ?2",
                params![key.address, key.stack],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
        };
        let (json, version, updated_at) = match row {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(other) => return Err(StoreError::Sqlite(other)),
        };
        Ok(Some(Versioned {
            snapshot: serde_json::from_str(&json)?,
            version: from_sql_version(version),
            updated_at: parse_datetime(&updated_at),
        }))
    }

    async fn save(
        &self,
        key: &StackKey,
        snapshot: &FiberSnapshot,
        precondition: Precondition,
    ) -> StoreResult<Version> {
        let json = serde_json::to_string(snapshot)?;
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = Self::current_version(&tx, key)?;
        let version = precondition.check(key, current)?;

        tx.execute(
            "INSERT INTO dialog_stacks (address, stack_id, snapshot, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(address, stack_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![key.address, key.stack, json, to_sql_version(version), now],
        )?;
        tx.commit()?;
        Ok(version)
    }

    async fn delete(&self, key: &StackKey) -> StoreResult<()> {
        self.lock()?.execute(
            "DELETE FROM dialog_stacks WHERE address = ?1 AND stack_id = ?2",
            params![key.address, key.stack],
        )?;
        Ok(())
    }

    async fn list(&self, address: &str) -> StoreResult<Vec<StackKey>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT stack_id FROM dialog_stacks WHERE address = ?1 ORDER BY stack_id",
        )?;
        let keys = stmt
            .query_map(params![address], |row| row.get::<_, String>(0))?
            .map(|stack| stack.map(|stack| StackKey::new(address, stack)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

fn from_sql_version(version: i64) -> Version {
    Version::try_from(version).unwrap_or_default()
}

fn to_sql_version(version: Version) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
