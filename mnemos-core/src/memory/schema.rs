//! SQLite schema and migrations for the reference stores.
//!
//! The vector index, graph index and lease table each track their own
//! schema version so they can live in one database file or in separate ones.

use rusqlite::{params, Connection, Result as SqliteResult};
use std::time::Duration;

/// Current schema version for every component.
pub const SCHEMA_VERSION: i32 = 1;

/// Busy timeout applied to every connection we open.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A group of tables managed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaComponent {
    Vector,
    Graph,
    Lease,
}

impl SchemaComponent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Graph => "graph",
            Self::Lease => "lease",
        }
    }

    fn marker_table(&self) -> &'static str {
        match self {
            Self::Vector => "vectors",
            Self::Graph => "entities",
            Self::Lease => "leases",
        }
    }
}

/// Apply connection pragmas shared by all components.
pub fn configure_connection(conn: &Connection) -> SqliteResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // WAL keeps readers off the writer's back across processes
    let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Pragmas for a handle that must never write.
pub fn configure_read_only(conn: &Connection) -> SqliteResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(())
}

/// Initialize the schema for one component.
pub fn initialize_schema(conn: &Connection, component: SchemaComponent) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            component TEXT NOT NULL,
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (component, version)
        )",
        [],
    )?;

    let current_version = get_schema_version(conn, component)?;

    if current_version < 1 {
        let tx = conn.unchecked_transaction()?;
        match component {
            SchemaComponent::Vector => apply_vector_v1(&tx)?,
            SchemaComponent::Graph => apply_graph_v1(&tx)?,
            SchemaComponent::Lease => apply_lease_v1(&tx)?,
        }
        tx.execute(
            "INSERT OR IGNORE INTO schema_version (component, version) VALUES (?1, 1)",
            params![component.as_str()],
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn apply_vector_v1(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS vectors (
            id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            dimension INTEGER NOT NULL,
            metadata TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    Ok(())
}

fn apply_graph_v1(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            properties TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            properties TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (source_id) REFERENCES entities(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES entities(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_name_key ON entities(name_key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_unique
            ON relationships(source_id, target_id, relationship_type)",
        [],
    )?;
    Ok(())
}

fn apply_lease_v1(conn: &Connection) -> SqliteResult<()> {
    // Timestamps are epoch milliseconds so expiry checks are plain integer compares
    conn.execute(
        "CREATE TABLE IF NOT EXISTS leases (
            resource_key TEXT PRIMARY KEY,
            holder_id TEXT NOT NULL,
            holder_pid INTEGER NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version for a component.
pub fn get_schema_version(conn: &Connection, component: SchemaComponent) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version WHERE component = ?1",
        params![component.as_str()],
        |row| row.get(0),
    )
}

/// Check if a component's schema is initialized.
pub fn is_initialized(conn: &Connection, component: SchemaComponent) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        params![component.marker_table()],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
