use rusqlite::{types::FromSql, Connection, TransactionBehavior};
use std::cell::UnsafeCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thread_local::ThreadLocal;
use tokio::task;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info, instrument, warn};

static DB_SETTINGS: &[(&str, &str)] = &[
    ("journal_mode", "delete"),
    ("synchronous", "full"),
    ("cache_size", "-8192"),
    ("busy_timeout", "5000"),
    ("temp_store", "memory"),
    ("foreign_keys", "on"),
];

/// Migrations, as `<version>-<name>.sql`, applied in version order.
static MIGRATIONS: &[(&str, &str)] = &[(
    "0001-job_queue.sql",
    include_str!("../../migrations/0001-job_queue.sql"),
)];

const DB_TIMEOUT: Duration = Duration::from_secs(10);
const CACHED_QUERIES: usize = 64;

/// One SQLite connection per thread, all pointing at the same file.
pub struct Database {
    connections: ThreadLocal<UnsafeCell<Connection>>,
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        debug!("detected sqlite library version: {}", rusqlite::version());
        let path = path.as_ref().to_path_buf();
        info!("connecting to database at {}...", path.display());

        let db = Arc::new(Self {
            connections: ThreadLocal::new(),
            path,
        });
        // open eagerly so a bad path or a failed migration surfaces here
        db.acquire_conn()?;
        Ok(db)
    }

    fn acquire_conn(&self) -> Result<&UnsafeCell<Connection>> {
        self.connections.get_or_try(|| {
            let mut conn = Connection::open(&self.path)?;
            conn.set_prepared_statement_cache_capacity(CACHED_QUERIES);
            apply_pragmas(&conn)?;
            apply_migrations(&mut conn)?;
            Ok(UnsafeCell::new(conn))
        })
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    for (pragma, value) in DB_SETTINGS {
        conn.pragma_update(None, pragma, value)?;
    }

    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let current_version: i32 =
        tx.query_row("SELECT user_version FROM pragma_user_version", [], |row| {
            row.get(0)
        })?;

    for (name, migration) in load_migrations(current_version)? {
        let version = migration_version(name)?;
        info!("applying migration: {}...", name);
        tx.execute_batch(migration)?;
        tx.pragma_update(None, "user_version", version)?;
    }

    tx.commit()?;
    Ok(())
}

fn load_migrations(above: i32) -> Result<Vec<(&'static str, &'static str)>> {
    let mut migrations = Vec::new();
    for &(name, sql) in MIGRATIONS {
        if migration_version(name)? > above {
            migrations.push((name, sql));
        }
    }

    migrations.sort_by_key(|(name, _)| migration_version(name).unwrap_or_default());
    Ok(migrations)
}

fn migration_version(name: &str) -> Result<i32> {
    let num = name
        .split('-')
        .next()
        .ok_or_else(|| anyhow!("missing number in migration name"))?
        .parse()?;

    Ok(num)
}

trait QueryMode {
    type Handle<'conn>;

    fn handle(connection: &mut rusqlite::Connection) -> rusqlite::Result<Self::Handle<'_>>;
}

struct NoTx;

impl QueryMode for NoTx {
    type Handle<'conn> = &'conn rusqlite::Connection;

    fn handle(connection: &mut rusqlite::Connection) -> rusqlite::Result<Self::Handle<'_>> {
        Ok(connection)
    }
}

struct Tx;

impl QueryMode for Tx {
    type Handle<'conn> = rusqlite::Transaction<'conn>;

    fn handle(connection: &mut rusqlite::Connection) -> rusqlite::Result<Self::Handle<'_>> {
        connection.transaction_with_behavior(TransactionBehavior::Immediate)
    }
}

fn is_busy(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .and_then(|e| e.sqlite_error_code())
        .is_some_and(|code| {
            code == rusqlite::ErrorCode::DatabaseBusy || code == rusqlite::ErrorCode::DatabaseLocked
        })
}

#[instrument(skip(db, query), err)]
fn query_inner<M, F, T>(db: &Database, mut query: F) -> Result<T>
where
    T: Send,
    M: QueryMode,
    F: FnMut(M::Handle<'_>) -> Result<T> + Send,
{
    let mut run = move || -> Result<T> {
        let start = Instant::now();
        let end = start + DB_TIMEOUT;
        // SAFETY: the connection is thread-local and never handed out across an await
        let conn = unsafe { &mut *db.acquire_conn()?.get() };

        let ret = loop {
            let attempt = match M::handle(conn) {
                Ok(handle) => query(handle),
                Err(err) => Err(err.into()),
            };

            match attempt {
                Ok(item) => break Ok(item),
                Err(err) if is_busy(&err) => {
                    warn!("database is busy, retrying");

                    if Instant::now() > end {
                        bail!("database busy, timed out");
                    }
                    thread::yield_now();
                }
                Err(err) => break Err(err),
            }
        };

        debug!("transaction took {:?}", start.elapsed());
        ret
    };

    // block_in_place panics on a current-thread runtime
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            task::block_in_place(run)
        }
        _ => run(),
    }
}

pub fn query<F, T>(db: &Database, query: F) -> Result<T>
where
    T: Send,
    F: FnMut(&rusqlite::Connection) -> Result<T> + Send,
{
    query_inner::<NoTx, _, _>(db, query)
}

/// Like [`query`], inside an immediate transaction. The closure must commit.
pub fn query_tx<F, T>(db: &Database, query: F) -> Result<T>
where
    T: Send,
    F: FnMut(rusqlite::Transaction) -> Result<T> + Send,
{
    query_inner::<Tx, _, _>(db, query)
}

pub fn row_extract<T: FromRow>(row: &rusqlite::Row) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub trait FromRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self>
    where
        Self: Sized;
}

impl<A> FromRow for (A,)
where
    A: FromSql,
{
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok((row.get(0)?,))
    }
}

impl<A, B> FromRow for (A, B)
where
    A: FromSql,
    B: FromSql,
{
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok((row.get(0)?, row.get(1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_set_user_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("q.db")).unwrap();

        let (version,): (i32,) = query(&db, |conn| {
            Ok(conn.query_row(
                "SELECT user_version FROM pragma_user_version",
                [],
                row_extract,
            )?)
        })
        .unwrap();
        assert_eq!(version, 1);

        // reopening applies nothing new
        drop(db);
        let db = Database::new(dir.path().join("q.db")).unwrap();
        let (count,): (i64,) = query(&db, |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM job_queue", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn transactions_roll_back_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("q.db")).unwrap();

        query_tx(&db, |tx| {
            tx.execute(
                "INSERT INTO job_queue (scheduled, state, args, job_type) VALUES (0, 'queued', '{}', 't')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let (count,): (i64,) = query(&db, |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM job_queue", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn queries_run_on_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("q.db")).unwrap();

        let mut calls = 0;
        let (count,): (i64,) = query(&db, |conn| {
            calls += 1;
            Ok(conn.query_row("SELECT COUNT(*) FROM job_queue", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(count, 0);
        assert_eq!(calls, 1);
    }

    #[test]
    fn migration_names_carry_versions() {
        assert_eq!(migration_version("0001-job_queue.sql").unwrap(), 1);
        assert!(migration_version("job_queue.sql").is_err());
    }
}
