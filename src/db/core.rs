use std::{path::Path, time::Duration};

use anyhow::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Params, Transaction, TransactionBehavior};
use rusqlite_migration::Migrations;

use crate::db::Entity;

pub const DEFAULT_POOL_SIZE: u32 = 8;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Cheap to clone handle to a pooled SQLite database. Safe to use from many
/// threads at once; each operation checks out its own connection.
#[derive(Clone)]
pub struct Db {
    pool: Pool<SqliteConnectionManager>,
}

impl Db {
    /// Private in-memory database. Every pooled connection to `:memory:` would
    /// be a separate database, so the pool holds exactly one long-lived
    /// connection and callers take turns on it.
    pub fn open_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| init_connection(conn));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Ok(Db { pool })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, DEFAULT_POOL_SIZE, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with<P: AsRef<Path>>(path: P, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            init_connection(conn)
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
        log::debug!("Opened {} with a pool of {}", path.as_ref().display(), pool_size.max(1));
        Ok(Db { pool })
    }

    pub fn connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    pub fn migrate(&self, migrations: &Migrations) -> Result<()> {
        let mut conn = self.connection()?;
        migrations.to_latest(&mut conn)?;
        Ok(())
    }

    /// Runs the query and maps each row onto `E` by column name.
    pub fn query<E: Entity, P: Params>(&self, sql: &str, params: P) -> Result<Vec<E>> {
        let conn = self.connection()?;
        query_rows(&conn, sql, params)
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        let conn = self.connection()?;
        execute(&conn, sql, params)
    }

    /// Calls the supplied closure with a database transaction. Commits
    /// if the closure returns Ok, otherwise rolls back.
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let mut conn = self.connection()?;
        let txn = conn.transaction()?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }

    /// Like [`Db::transaction`], but takes the write lock before the closure
    /// runs, so rows it reads cannot change before its writes commit.
    pub fn write_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let mut conn = self.connection()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

pub fn query_rows<E: Entity, P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<E>> {
    log::debug!("SQL QUERY: {}", sql);
    let mut stmt = conn.prepare(sql)?;
    let entities = serde_rusqlite::from_rows::<E>(stmt.query(params)?).collect::<Result<Vec<_>, _>>()?;
    log::debug!("SQL QUERY RESULT: {} rows", entities.len());
    Ok(entities)
}

pub fn execute<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<usize> {
    log::debug!("SQL EXECUTE: {}", sql);
    let affected = conn.execute(sql, params)?;
    log::debug!("SQL EXECUTE RESULT: {} rows affected", affected);
    Ok(affected)
}

/// True if the single-column query yields a non-zero value, e.g.
/// `SELECT EXISTS(SELECT 1 FROM ...)`.
pub fn exists<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<bool> {
    log::debug!("SQL QUERY: {}", sql);
    let found = conn.query_row(sql, params, |row| row.get::<_, i64>(0))?;
    Ok(found != 0)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_millis() as i64)
}
