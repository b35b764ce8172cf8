//! Shared SQLite-backed persistence primitives.
//!
//! Both [`crate::message::MessageStore`] and [`crate::friend::FriendStore`]
//! are thin wrappers over one of these: a single writer connection guarded
//! by a mutex (so every mutation is serialized and wrapped in a
//! transaction — a partial write cannot corrupt the index, spec §4.2), and
//! a small pool of read-only connections that can run concurrently with
//! each other and with the writer under WAL mode (spec §4.2 "multi-reader,
//! exclusive writer").

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

const DEFAULT_READ_POOL_SIZE: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A crash-safe SQLite handle shared by a single store.
pub struct Db {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: RwLock<Vec<Connection>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Self::new_connection(&path)?;
        let mut readers = Vec::with_capacity(DEFAULT_READ_POOL_SIZE);
        for _ in 0..DEFAULT_READ_POOL_SIZE {
            readers.push(Self::new_connection(&path)?);
        }
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            readers: RwLock::new(readers),
        })
    }

    /// In-memory database, useful for tests: each store keeps its own
    /// private, non-shared in-memory file.
    pub fn open_in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            writer: Mutex::new(writer),
            readers: RwLock::new(Vec::new()),
        })
    }

    fn new_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(conn)
    }

    /// Run `f` inside a transaction on the single writer connection.
    /// Mutations are serialized; an error inside `f` rolls back.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<R>,
    {
        let mut conn = self.writer.lock().await;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `f` against a read-only connection from the pool. Falls back to
    /// the writer connection when the store was opened in-memory (which
    /// keeps no separate reader pool, since `:memory:` connections cannot
    /// be shared across handles).
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let mut readers = self.readers.write().await;
        if let Some(conn) = readers.pop() {
            let result = f(&conn);
            readers.push(conn);
            return result;
        }
        drop(readers);
        let conn = self.writer.lock().await;
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("path", &self.path).finish()
    }
}

pub(crate) fn map_sqlite(e: rusqlite::Error) -> Error {
    Error::StoreFailure(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let db = Db::open_in_memory().unwrap();
        db.write(|tx| {
            tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", [])
                .map_err(map_sqlite)?;
            tx.execute("INSERT INTO t (id) VALUES (1)", [])
                .map_err(map_sqlite)?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = db
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(map_sqlite)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn failed_write_rolls_back() {
        let db = Db::open_in_memory().unwrap();
        db.write(|tx| {
            tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY UNIQUE)", [])
                .map_err(map_sqlite)?;
            tx.execute("INSERT INTO t (id) VALUES (1)", [])
                .map_err(map_sqlite)?;
            Ok(())
        })
        .await
        .unwrap();

        let err = db
            .write(|tx| {
                tx.execute("INSERT INTO t (id) VALUES (1)", [])
                    .map_err(map_sqlite)?; // duplicate id -> fails
                Ok(())
            })
            .await;
        assert!(err.is_err());

        let count: i64 = db
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(map_sqlite)
            })
            .await
            .unwrap();
        assert_eq!(count, 1, "the failed second insert must not have persisted");
    }
}
