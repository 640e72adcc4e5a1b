//! SQLite DDL for the ledger store.
//!
//! Every statement uses `IF NOT EXISTS`, so `apply_schema` can run on each open.

use rusqlite::{params, Connection, OptionalExtension};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub(crate) const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- rowid order doubles as the leaderboard tie-break.
CREATE TABLE IF NOT EXISTS users (
    username      TEXT PRIMARY KEY COLLATE NOCASE,
    full_name     TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    email         TEXT NOT NULL DEFAULT '',
    points        INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
    level         INTEGER NOT NULL DEFAULT 1 CHECK (level >= 1),
    is_admin      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS goals (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    label  TEXT NOT NULL,
    points INTEGER NOT NULL CHECK (points >= 0)
);

CREATE TABLE IF NOT EXISTS user_goals (
    username    TEXT NOT NULL COLLATE NOCASE REFERENCES users(username),
    goal_id     INTEGER NOT NULL REFERENCES goals(id),
    status      TEXT NOT NULL DEFAULT 'available',
    approved_at TEXT,
    PRIMARY KEY (username, goal_id),
    CHECK (status <> 'approved' OR approved_at IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL,
    points      INTEGER NOT NULL CHECK (points >= 0),
    assigned_to TEXT NOT NULL COLLATE NOCASE REFERENCES users(username),
    status      TEXT NOT NULL DEFAULT 'available',
    assigned_at TEXT NOT NULL,
    approved_at TEXT,
    CHECK (status <> 'approved' OR approved_at IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_tasks_assigned_to ON tasks(assigned_to);
CREATE INDEX IF NOT EXISTS idx_tasks_status      ON tasks(status);

CREATE TABLE IF NOT EXISTS daily_points (
    username      TEXT NOT NULL COLLATE NOCASE REFERENCES users(username),
    date          TEXT NOT NULL,
    points_earned INTEGER NOT NULL,
    PRIMARY KEY (username, date)
);
"#;

pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|value| value.parse().ok()))
}
