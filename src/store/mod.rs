//! SQLite persistence for agents, tasks, embeddings, conversations, the
//! relay queue, reports and registration quotas.
//!
//! A single connection sits behind a mutex, so every closure passed to
//! [`Store::with_connection`] or [`Store::with_transaction`] runs serialized
//! against all other store work in the process. Read-modify-write sequences
//! (quota counters, report thresholds, state flips) go through
//! `with_transaction` to stay atomic across processes as well.

pub mod models;

pub use models::{
    find_agent, find_agent_by_token_hash, find_conversation, find_task, list_tasks_for_agent,
    resolve_task_ref, Agent, AgentStatus, Conversation, ConversationState, QueuedMessage, Task,
    TaskMode, TaskStatus,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT_SECS: u64 = 5;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        id              TEXT PRIMARY KEY,
        token_hash      TEXT NOT NULL UNIQUE,
        display_name    TEXT NOT NULL,
        public_bio      TEXT NOT NULL DEFAULT '',
        ip_address      TEXT NOT NULL,
        mac_address     TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'active'
                        CHECK (status IN ('active', 'inactive', 'banned')),
        report_count    INTEGER NOT NULL DEFAULT 0,
        last_heartbeat  TEXT,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

    CREATE TABLE IF NOT EXISTS tasks (
        id          TEXT PRIMARY KEY,
        agent_id    TEXT NOT NULL REFERENCES agents(id),
        task_id     TEXT NOT NULL,
        mode        TEXT NOT NULL CHECK (mode IN ('beacon', 'radar')),
        type        TEXT NOT NULL,
        title       TEXT NOT NULL,
        keywords    TEXT NOT NULL DEFAULT '[]',
        status      TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'paused', 'completed', 'inactive')),
        created_at  TEXT NOT NULL,
        UNIQUE (agent_id, task_id)
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id);
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

    CREATE TABLE IF NOT EXISTS task_embeddings (
        task_id     TEXT PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
        embedding   BLOB NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS conversations (
        id               TEXT PRIMARY KEY,
        initiator_agent  TEXT NOT NULL,
        target_agent     TEXT NOT NULL,
        initiator_task   TEXT NOT NULL,
        target_task      TEXT NOT NULL,
        state            TEXT NOT NULL DEFAULT 'pending_acceptance',
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_target ON conversations(target_agent, state);
    CREATE INDEX IF NOT EXISTS idx_conversations_initiator ON conversations(initiator_agent);
    CREATE INDEX IF NOT EXISTS idx_conversations_state ON conversations(state, created_at);

    CREATE TABLE IF NOT EXISTS message_queue (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        from_agent       TEXT NOT NULL,
        to_agent         TEXT NOT NULL,
        content          TEXT NOT NULL,
        created_at       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_message_queue_to ON message_queue(to_agent, created_at);

    CREATE TABLE IF NOT EXISTS reports (
        id              TEXT PRIMARY KEY,
        reporter_agent  TEXT NOT NULL,
        reported_agent  TEXT NOT NULL,
        reason          TEXT NOT NULL,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_reports_reported ON reports(reported_agent);

    CREATE TABLE IF NOT EXISTS registration_limits (
        fingerprint      TEXT PRIMARY KEY,
        daily_count      INTEGER NOT NULL DEFAULT 0,
        last_reset_date  TEXT NOT NULL
    );
";

pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .context("Failed to configure database journal")?;
        initialize(&conn)?;

        tracing::debug!(path = %path.display(), "Store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn with_connection<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside one immediate transaction. An `Err` from `f` rolls back.
    pub fn with_transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("Failed to enable foreign keys")?;
    conn.execute_batch(SCHEMA)
        .context("Failed to initialize database schema")?;
    add_column_if_missing(conn, "tasks", "updated_at", "TEXT NOT NULL DEFAULT ''")?;
    // Rows written before `updated_at` existed inherit their creation time.
    conn.execute(
        "UPDATE tasks SET updated_at = created_at WHERE updated_at = ''",
        [],
    )
    .context("Failed to backfill tasks.updated_at")?;
    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, name: &str, sql_type: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    drop(rows);
    drop(stmt);

    // Another process may add the column between the PRAGMA check and ALTER.
    match conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {name} {sql_type}"),
        [],
    ) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, Some(ref message)))
            if message.contains("duplicate column name") =>
        {
            tracing::debug!("{table}.{name} already added concurrently ({err})");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to add {table}.{name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tempfile::TempDir;

    fn table_columns(store: &Store, table: &str) -> Vec<String> {
        store
            .with_connection(|conn| -> rusqlite::Result<Vec<String>> {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
                let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
                names.collect()
            })
            .unwrap()
    }

    #[test]
    fn open_creates_parent_directories_and_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("agentsocial.db");
        let store = Store::open(&path).unwrap();

        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(table_columns(&store, "tasks").contains(&"updated_at".to_string()));
        assert!(table_columns(&store, "registration_limits").contains(&"last_reset_date".into()));
    }

    #[test]
    fn reopening_an_existing_database_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.sqlite");
        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        let count = table_columns(&store, "tasks")
            .iter()
            .filter(|c| c.as_str() == "updated_at")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn legacy_tasks_table_gains_updated_at() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    id TEXT PRIMARY KEY, agent_id TEXT NOT NULL, task_id TEXT NOT NULL,
                    mode TEXT NOT NULL, type TEXT NOT NULL, title TEXT NOT NULL,
                    keywords TEXT NOT NULL DEFAULT '[]', status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL
                );
                INSERT INTO tasks VALUES
                    ('t1', 'a1', 'x', 'beacon', 'job', 'Title', '[]', 'active',
                     '2026-01-01T00:00:00.000000Z');",
            )
            .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let updated: String = store
            .with_connection(|conn| {
                conn.query_row("SELECT updated_at FROM tasks WHERE id = 't1'", [], |r| {
                    r.get(0)
                })
            })
            .unwrap();
        assert_eq!(updated, "2026-01-01T00:00:00.000000Z");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), rusqlite::Error> = store.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO registration_limits (fingerprint, daily_count, last_reset_date)
                 VALUES ('fp', 1, '2026-01-01')",
                [],
            )?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());

        let rows: i64 = store
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM registration_limits", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn committed_transaction_is_visible() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_transaction(|tx| {
                tx.execute(
                    "INSERT INTO registration_limits (fingerprint, daily_count, last_reset_date)
                     VALUES (?1, ?2, ?3)",
                    params!["fp", 2, "2026-01-01"],
                )
            })
            .unwrap();
        let count: i64 = store
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT daily_count FROM registration_limits WHERE fingerprint = 'fp'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn mode_check_constraint_rejects_unknown_modes() {
        let store = Store::open_in_memory().unwrap();
        let err = store.with_connection(|conn| {
            conn.execute(
                "INSERT INTO agents (id, token_hash, display_name, ip_address, mac_address, created_at)
                 VALUES ('a', 'h', 'A', 'ip', 'mac', '2026-01-01T00:00:00.000000Z')",
                [],
            )?;
            conn.execute(
                "INSERT INTO tasks (id, agent_id, task_id, mode, type, title, created_at, updated_at)
                 VALUES ('t', 'a', 'x', 'lighthouse', 'job', 'T', 'now', 'now')",
                [],
            )
        });
        assert!(err.is_err());
    }
}
