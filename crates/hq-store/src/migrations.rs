//! Schema creation and versioned migrations.

use rusqlite::Connection;

use crate::errors::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations on a connection.
///
/// Idempotent: safe to run at every startup.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            worker_id TEXT,
            status TEXT NOT NULL,
            startup_phase TEXT NOT NULL,
            initial_prompt TEXT NOT NULL,
            worker_context TEXT NOT NULL DEFAULT '{}',
            capabilities TEXT,
            error TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            stopped_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

        CREATE TABLE IF NOT EXISTS session_messages (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            sequence INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (session_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_questions (
            id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            options TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            asked_at TEXT NOT NULL,
            answered_at TEXT,
            answer TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_one_pending_per_worker
            ON pending_questions(worker_id) WHERE status = 'pending';
        CREATE INDEX IF NOT EXISTS idx_questions_worker
            ON pending_questions(worker_id);

        CREATE TABLE IF NOT EXISTS api_keys (
            prefix TEXT PRIMARY KEY,
            hash TEXT NOT NULL,
            name TEXT NOT NULL,
            rate_limit INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS shares (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            paths TEXT NOT NULL,
            permissions TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_shares_owner ON shares(owner_id);
        CREATE INDEX IF NOT EXISTS idx_shares_recipient ON shares(recipient_id);",
    )?;

    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = ?1",
        rusqlite::params![SCHEMA_VERSION.to_string()],
    )
    .map(|_| ())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, new_in_memory};

    #[test]
    fn migrations_are_idempotent() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: String = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }
}
