use sqlx::{
    Sqlite,
    migrate::Migrator,
    pool::PoolConnection,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use tokio::{
    fs as async_fs,
    sync::{RwLock, RwLockReadGuard},
};

use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
};
use anyhow::Context;
use tracing::{debug, warn};

pub(crate) static STORE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/store");
pub(crate) static QUEUE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/queue");

/// One on-device SQLite database file behind a pool.
pub(crate) struct DbState {
    db_file: PathBuf,
    pool: RwLock<SqlitePool>,
}

impl std::fmt::Debug for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbState")
            .field("db_file", &self.db_file)
            .finish()
    }
}

impl DbState {
    pub(crate) async fn open(db_file: &Path, migrator: &Migrator) -> anyhow::Result<Self> {
        if let Some(parent) = db_file.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let pool = connect(db_file).await?;
        migrator
            .run(&pool)
            .await
            .with_context(|| format!("Failed to migrate database {:?}", db_file))?;
        debug!(db_file = %db_file.display(), "opened database");
        Ok(Self {
            db_file: db_file.to_path_buf(),
            pool: RwLock::new(pool),
        })
    }

    pub(crate) fn db_file(&self) -> &Path {
        &self.db_file
    }

    /// Acquire a pooled connection and hold the pool read lock for the entire lifetime
    /// of the returned guard.
    pub(crate) async fn conn(&self) -> anyhow::Result<DbConnGuard<'_>> {
        let pool_guard = self.pool.read().await;

        // Acquire while the read lock is held so close() cannot race us.
        let conn = pool_guard.acquire().await?;

        Ok(DbConnGuard {
            _pool_guard: pool_guard,
            conn,
        })
    }

    /// Exclusive close:
    /// - waits for all in-flight queries (because it takes a WRITE lock)
    /// - checkpoints WAL so the main file is current
    /// - closes the pool to release file handles
    pub(crate) async fn close(&self) -> anyhow::Result<()> {
        let pool_guard = self.pool.write().await;
        if pool_guard.is_closed() {
            return Ok(());
        }
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&*pool_guard)
            .await?;
        pool_guard.close().await;
        Ok(())
    }
}

async fn connect(db_file: &Path) -> anyhow::Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::new()
        .filename(db_file)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_opts)
        .await
        .with_context(|| format!("Failed to open database {:?}", db_file))
}

/// Remove a database file together with its WAL and shared-memory files.
/// Missing files are fine; any other failure is returned after every file
/// has been attempted.
pub(crate) async fn delete_db_files(db_file: &Path) -> anyhow::Result<()> {
    let mut first_err = None;
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db_file.as_os_str().to_owned();
        name.push(suffix);
        let path = PathBuf::from(name);
        match async_fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "deleted database file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to delete database file");
                if first_err.is_none() {
                    first_err = Some(anyhow::Error::new(e).context(format!(
                        "Failed to delete database file {:?}",
                        path
                    )));
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub(crate) struct DbConnGuard<'a> {
    _pool_guard: RwLockReadGuard<'a, SqlitePool>,
    conn: PoolConnection<Sqlite>,
}

impl<'a> Deref for DbConnGuard<'a> {
    type Target = PoolConnection<Sqlite>;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<'a> DerefMut for DbConnGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
