//! SQLite connection pooling and pragmas.

use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

use crate::errors::Result;

/// Pool of SQLite connections.
pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
/// One pooled connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and timeout knobs.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Maximum pooled connections.
    pub max_size: u32,
    /// How long `get()` waits for a free connection.
    pub connection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

fn apply_pragmas(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
}

/// Open a file-backed pool.
pub fn new_file(path: &Path, config: &ConnectionConfig) -> Result<ConnectionPool> {
    let manager = SqliteConnectionManager::file(path).with_init(apply_pragmas);
    Ok(r2d2::Pool::builder()
        .max_size(config.max_size)
        .connection_timeout(config.connection_timeout)
        .build(manager)?)
}

/// Open a shared in-memory pool (tests).
///
/// Pool size is pinned to 1 so every handle sees the same database.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let manager = SqliteConnectionManager::memory().with_init(apply_pragmas);
    Ok(r2d2::Pool::builder()
        .max_size(1)
        .connection_timeout(config.connection_timeout)
        .build(manager)?)
}
