//! Graph index: a single-writer property graph with pattern queries.
//!
//! Mutations must only be issued while the caller holds the graph write
//! lease (see [`crate::lock`]). Reads go through a separate read-only handle
//! so they never contend with the writer.

use crate::error::{Error, Result};
use crate::memory::schema::{
    configure_connection, configure_read_only, initialize_schema, SchemaComponent,
};
use crate::memory::types::{Entity, Metadata, Relationship};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Constraint on one end of a pattern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMatch {
    pub id: Option<String>,
    pub entity_type: Option<String>,
    /// Case-insensitive name alternatives
    pub names: Vec<String>,
}

impl NodeMatch {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Default::default()
        }
    }

    pub fn named<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.names
            .extend(names.into_iter().map(|n| name_key(n.as_ref())));
        self
    }
}

/// `(source)-[relationship]->(target)` pattern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern {
    pub source: NodeMatch,
    pub relationship_type: Option<String>,
    pub target: NodeMatch,
    pub limit: Option<usize>,
}

impl Pattern {
    pub fn new(source: NodeMatch, target: NodeMatch) -> Self {
        Self {
            source,
            target,
            relationship_type: None,
            limit: None,
        }
    }

    pub fn via(mut self, relationship_type: impl Into<String>) -> Self {
        self.relationship_type = Some(relationship_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One matched edge with both endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternRow {
    pub source: Entity,
    pub relationship: Relationship,
    pub target: Entity,
}

/// Entity and relationship counts.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphStats {
    pub entities: u64,
    pub relationships: u64,
}

/// Property graph store.
pub trait GraphIndex: Send + Sync {
    /// Insert or replace an entity.
    fn create_entity(&self, entity: &Entity) -> Result<()>;

    /// Insert a relationship; both endpoints must exist. Re-creating the same
    /// (source, target, type) edge updates its properties.
    fn create_relationship(&self, relationship: &Relationship) -> Result<()>;

    /// Remove edges of one type between two entities.
    fn delete_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: &str,
    ) -> Result<bool>;

    /// Remove an entity and every edge touching it.
    fn delete_entity(&self, id: &str) -> Result<bool>;

    /// Match edges against a pattern.
    fn query_pattern(&self, pattern: &Pattern) -> Result<Vec<PatternRow>>;

    fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    /// Entities matching a node constraint.
    fn find_entities(&self, node: &NodeMatch, limit: usize) -> Result<Vec<Entity>>;

    fn stats(&self) -> Result<GraphStats>;
}

/// SQLite-backed graph index.
pub struct SqliteGraphIndex {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl SqliteGraphIndex {
    /// Open or create a graph at the given path with a writer and a read-only handle.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = Connection::open(path).map_err(|e| Error::unavailable(e.to_string()))?;
        configure_connection(&writer)?;
        initialize_schema(&writer, SchemaComponent::Graph)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::unavailable(e.to_string()))?;
        configure_read_only(&reader)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Create an in-memory graph (for testing). Both handles share one connection.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::unavailable(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_schema(&conn, SchemaComponent::Graph)?;
        let shared = Arc::new(Mutex::new(conn));

        Ok(Self {
            writer: Arc::clone(&shared),
            reader: shared,
        })
    }

    fn with_writer<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock graph writer: {}", e)))?;
        f(&conn)
    }

    fn with_reader<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .reader
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock graph reader: {}", e)))?;
        f(&conn)
    }

    fn entity_exists(conn: &Connection, id: &str) -> Result<bool> {
        let found = conn
            .query_row("SELECT 1 FROM entities WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn row_to_entity(row: &rusqlite::Row, offset: usize) -> rusqlite::Result<Entity> {
        Ok(Entity {
            id: row.get(offset)?,
            name: row.get(offset + 1)?,
            entity_type: row.get(offset + 2)?,
            properties: parse_properties(row.get::<_, Option<String>>(offset + 3)?),
        })
    }
}

impl GraphIndex for SqliteGraphIndex {
    fn create_entity(&self, entity: &Entity) -> Result<()> {
        let properties = serde_json::to_string(&entity.properties)?;
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO entities (id, name, name_key, entity_type, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    name_key = excluded.name_key,
                    entity_type = excluded.entity_type,
                    properties = excluded.properties",
                params![
                    entity.id,
                    entity.name,
                    name_key(&entity.name),
                    entity.entity_type,
                    properties,
                ],
            )?;
            Ok(())
        })
    }

    fn create_relationship(&self, relationship: &Relationship) -> Result<()> {
        let properties = serde_json::to_string(&relationship.properties)?;
        self.with_writer(|conn| {
            for endpoint in [&relationship.source_id, &relationship.target_id] {
                if !Self::entity_exists(conn, endpoint)? {
                    return Err(Error::validation(format!(
                        "relationship endpoint '{}' does not exist",
                        endpoint
                    )));
                }
            }
            conn.execute(
                "INSERT INTO relationships (id, source_id, target_id, relationship_type, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_id, target_id, relationship_type) DO UPDATE SET
                    properties = excluded.properties",
                params![
                    relationship.id,
                    relationship.source_id,
                    relationship.target_id,
                    relationship.relationship_type,
                    properties,
                ],
            )?;
            Ok(())
        })
    }

    fn delete_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: &str,
    ) -> Result<bool> {
        self.with_writer(|conn| {
            let rows = conn.execute(
                "DELETE FROM relationships
                 WHERE source_id = ?1 AND target_id = ?2 AND relationship_type = ?3",
                params![source_id, target_id, relationship_type],
            )?;
            Ok(rows > 0)
        })
    }

    fn delete_entity(&self, id: &str) -> Result<bool> {
        self.with_writer(|conn| {
            conn.execute(
                "DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1",
                params![id],
            )?;
            let rows = conn.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
    }

    fn query_pattern(&self, pattern: &Pattern) -> Result<Vec<PatternRow>> {
        let mut sql = String::from(
            "SELECT s.id, s.name, s.entity_type, s.properties,
                    t.id, t.name, t.entity_type, t.properties,
                    r.id, r.relationship_type, r.properties
             FROM relationships r
             JOIN entities s ON s.id = r.source_id
             JOIN entities t ON t.id = r.target_id
             WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        push_node_clauses(&mut sql, &mut params_vec, "s", &pattern.source);
        push_node_clauses(&mut sql, &mut params_vec, "t", &pattern.target);

        if let Some(ref rel_type) = pattern.relationship_type {
            sql.push_str(" AND r.relationship_type = ?");
            params_vec.push(Box::new(rel_type.clone()));
        }

        sql.push_str(" ORDER BY r.created_at, r.id");

        if let Some(limit) = pattern.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.with_reader(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_refs.as_slice(), |row| {
                let source = Self::row_to_entity(row, 0)?;
                let target = Self::row_to_entity(row, 4)?;
                let relationship = Relationship {
                    id: row.get(8)?,
                    source_id: source.id.clone(),
                    target_id: target.id.clone(),
                    relationship_type: row.get(9)?,
                    properties: parse_properties(row.get::<_, Option<String>>(10)?),
                };
                Ok(PatternRow {
                    source,
                    relationship,
                    target,
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.with_reader(|conn| {
            let entity = conn
                .query_row(
                    "SELECT id, name, entity_type, properties FROM entities WHERE id = ?1",
                    params![id],
                    |row| Self::row_to_entity(row, 0),
                )
                .optional()?;
            Ok(entity)
        })
    }

    fn find_entities(&self, node: &NodeMatch, limit: usize) -> Result<Vec<Entity>> {
        let mut sql = String::from(
            "SELECT e.id, e.name, e.entity_type, e.properties FROM entities e WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        push_node_clauses(&mut sql, &mut params_vec, "e", node);
        sql.push_str(&format!(" ORDER BY e.name_key, e.id LIMIT {}", limit));

        self.with_reader(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_refs.as_slice(), |row| Self::row_to_entity(row, 0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn stats(&self) -> Result<GraphStats> {
        self.with_reader(|conn| {
            let entities: i64 =
                conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
            let relationships: i64 =
                conn.query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))?;
            Ok(GraphStats {
                entities: entities as u64,
                relationships: relationships as u64,
            })
        })
    }
}

fn push_node_clauses(
    sql: &mut String,
    params_vec: &mut Vec<Box<dyn rusqlite::ToSql>>,
    alias: &str,
    node: &NodeMatch,
) {
    if let Some(ref id) = node.id {
        sql.push_str(&format!(" AND {}.id = ?", alias));
        params_vec.push(Box::new(id.clone()));
    }
    if let Some(ref entity_type) = node.entity_type {
        sql.push_str(&format!(" AND {}.entity_type = ?", alias));
        params_vec.push(Box::new(entity_type.clone()));
    }
    if !node.names.is_empty() {
        let placeholders: Vec<&str> = node.names.iter().map(|_| "?").collect();
        sql.push_str(&format!(
            " AND {}.name_key IN ({})",
            alias,
            placeholders.join(",")
        ));
        for name in &node.names {
            params_vec.push(Box::new(name.clone()));
        }
    }
}

/// Case- and whitespace-insensitive lookup key for entity names.
pub fn name_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn parse_properties(json: Option<String>) -> Metadata {
    json.and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}
