mod migrations;

use crate::prelude::*;
use r2d2::Pool;
use rusqlite::{Connection, Params, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_QUERY: Duration = Duration::from_millis(500);

struct SqliteConnectionManager {
    file: PathBuf,
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = rusqlite::Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let connection = rusqlite::Connection::open(&self.file)?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        // SQLite serializes writers; waiting on the busy handler keeps
        // concurrent worker upserts from surfacing as SQLITE_BUSY failures.
        connection.busy_timeout(BUSY_TIMEOUT)?;
        Ok(connection)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.query_row("select 1", [], |_| Ok(()))
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.is_valid(conn).is_err()
    }
}

#[derive(Debug)]
struct PoolErrorLogger;

impl<E: std::error::Error> r2d2::HandleError<E> for PoolErrorLogger {
    fn handle_error(&self, error: E) {
        error!("connection pool error: {:?}", error);
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    // Keeps the backing file of a test database alive until the last
    // connection is gone.
    _tempfile: Option<Arc<NamedTempFile>>,
}

impl Database {
    pub fn open(path: &Path) -> Fallible<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Database::new(
            SqliteConnectionManager {
                file: path.to_owned(),
            },
            None,
        )
    }

    #[cfg(test)]
    pub fn temp() -> Fallible<Self> {
        let tempfile = NamedTempFile::new()?;
        Database::new(
            SqliteConnectionManager {
                file: tempfile.path().to_owned(),
            },
            Some(tempfile),
        )
    }

    fn new(manager: SqliteConnectionManager, tempfile: Option<NamedTempFile>) -> Fallible<Self> {
        let pool = Pool::builder()
            .error_handler(Box::new(PoolErrorLogger))
            .build(manager)?;

        let mut connection = pool.get()?;
        let journal_mode: String =
            connection.pragma_query_value(None, "journal_mode", |r| r.get(0))?;
        if journal_mode != "wal" && journal_mode != "memory" {
            connection.pragma_update(None, "journal_mode", "WAL")?;
        }
        // NORMAL still guards against corruption under WAL; only the very
        // last commits before a power loss can go missing.
        connection.pragma_update(None, "synchronous", "NORMAL")?;

        migrations::execute(&mut connection)?;

        Ok(Database {
            pool,
            _tempfile: tempfile.map(Arc::new),
        })
    }

    /// Runs `f` inside an immediate-mode write transaction: the write lock is
    /// taken up front, so concurrent writers queue on the busy handler
    /// instead of failing at commit. An error from `f` drops the transaction,
    /// which rolls it back.
    pub fn write_transaction<T, F>(&self, f: F) -> Fallible<T>
    where
        F: FnOnce(&TransactionHandle) -> Fallible<T>,
    {
        let mut conn = self.pool.get()?;
        let handle = TransactionHandle {
            tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
        };
        let value = f(&handle)?;
        handle.tx.commit()?;
        Ok(value)
    }
}

pub struct TransactionHandle<'a> {
    tx: Transaction<'a>,
}

fn timed<T, F: FnOnce() -> Fallible<T>>(sql: &str, run: F) -> Fallible<T> {
    let start = Instant::now();
    let result = run();
    let elapsed = start.elapsed();
    if elapsed >= SLOW_QUERY {
        debug!("slow sql ({:?}): {}", elapsed, sql);
    } else {
        trace!("sql ({:?}): {}", elapsed, sql);
    }
    result
}

/// Query helpers available on both pooled connections and open transactions;
/// everything goes through `with_connection`, which is the only method the
/// two implementors differ in.
pub trait Queries {
    fn with_connection<T, F: FnOnce(&Connection) -> Fallible<T>>(&self, f: F) -> Fallible<T>;

    /// Runs a statement, returning how many rows it touched.
    fn execute<P: Params>(&self, sql: &str, params: P) -> Fallible<usize> {
        self.with_connection(|conn| {
            timed(sql, || Ok(conn.prepare_cached(sql)?.execute(params)?))
        })
    }

    /// Runs an INSERT and hands back the fresh rowid.
    fn insert<P: Params>(&self, sql: &str, params: P) -> Fallible<i64> {
        self.with_connection(|conn| {
            timed(sql, || {
                conn.prepare_cached(sql)?.execute(params)?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    /// Maps the first row of the result set, if there is one.
    fn first<T, P, F>(&self, sql: &str, params: P, map: F) -> Fallible<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row) -> rusqlite::Result<T>,
    {
        self.with_connection(|conn| {
            timed(sql, || {
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query(params)?;
                match rows.next()? {
                    Some(row) => Ok(Some(map(row)?)),
                    None => Ok(None),
                }
            })
        })
    }

    /// Maps every row of the result set.
    fn select<T, P, F>(&self, sql: &str, params: P, map: F) -> Fallible<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        self.with_connection(|conn| {
            timed(sql, || {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(params, map)?;
                Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
            })
        })
    }
}

impl Queries for Database {
    fn with_connection<T, F: FnOnce(&Connection) -> Fallible<T>>(&self, f: F) -> Fallible<T> {
        f(&*self.pool.get()?)
    }
}

impl Queries for TransactionHandle<'_> {
    fn with_connection<T, F: FnOnce(&Connection) -> Fallible<T>>(&self, f: F) -> Fallible<T> {
        f(&self.tx)
    }
}
