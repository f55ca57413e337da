//! Vector index: embeddings plus metadata with filtered nearest-neighbor lookup.

use crate::error::{Error, Result};
use crate::memory::embedding::cosine_similarity;
use crate::memory::schema::{configure_connection, initialize_schema, SchemaComponent};
use crate::memory::types::{MemoryFilters, MemoryId, Metadata, RecordState};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A nearest-neighbor match.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: MemoryId,
    /// Cosine similarity to the query embedding
    pub similarity: f32,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A stored entry fetched by id.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: MemoryId,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// A single metadata condition.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    Eq(String, Value),
    Ne(String, Value),
    Gte(String, f64),
}

impl FilterCondition {
    fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::Eq(key, value) => metadata.get(key) == Some(value),
            Self::Ne(key, value) => metadata.get(key) != Some(value),
            Self::Gte(key, min) => metadata
                .get(key)
                .and_then(Value::as_f64)
                .map_or(false, |v| v >= *min),
        }
    }
}

/// Conjunction of metadata conditions. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub conditions: Vec<FilterCondition>,
}

impl VectorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(FilterCondition::Eq(key.into(), value.into()));
        self
    }

    pub fn ne(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(FilterCondition::Ne(key.into(), value.into()));
        self
    }

    pub fn gte(mut self, key: impl Into<String>, min: f64) -> Self {
        self.conditions.push(FilterCondition::Gte(key.into(), min));
        self
    }

    /// Only records still in a live state.
    pub fn live() -> Self {
        Self::new().ne("state", RecordState::Consolidated.as_str())
    }

    /// Translate retrieval filters; consolidated records are always excluded.
    pub fn from_filters(filters: &MemoryFilters) -> Self {
        let mut filter = Self::live();
        if let Some(ref t) = filters.memory_type {
            filter = filter.eq("category", t.as_str());
        }
        if let Some(ref d) = filters.domain {
            filter = filter.eq("domain", d.as_str());
        }
        if let Some(min) = filters.min_importance {
            filter = filter.gte("importance", min as f64);
        }
        if let Some(layer) = filters.layer {
            filter = filter.eq("layer", layer.as_str());
        }
        filter
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions.iter().all(|c| c.matches(metadata))
    }
}

/// Embedding store with nearest-neighbor search.
///
/// Calls are blocking; the orchestrator dispatches them off the async runtime.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace an entry.
    fn upsert(&self, id: &MemoryId, embedding: &[f32], metadata: &Metadata) -> Result<()>;

    /// Top-`k` entries by similarity that pass `filter`, best first.
    fn query(&self, embedding: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>>;

    /// Every entry, unfiltered.
    fn get_all(&self) -> Result<Vec<(MemoryId, Metadata)>>;

    /// Entries for the given ids; missing ids are skipped.
    fn get(&self, ids: &[MemoryId]) -> Result<Vec<VectorEntry>>;

    /// Hard delete. Returns whether an entry existed.
    fn delete(&self, id: &MemoryId) -> Result<bool>;

    /// Number of stored entries.
    fn count(&self) -> Result<usize>;
}

/// SQLite-backed vector index with brute-force cosine search.
pub struct SqliteVectorIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorIndex {
    /// Open or create an index at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::unavailable(e.to_string()))?;
        configure_connection(&conn)?;
        initialize_schema(&conn, SchemaComponent::Vector)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory index (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::unavailable(e.to_string()))?;
        initialize_schema(&conn, SchemaComponent::Vector)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn)
    }

    /// Every row. Rows with corrupt metadata are logged and skipped.
    fn load_rows(conn: &Connection) -> Result<Vec<VectorEntry>> {
        let mut stmt = conn.prepare("SELECT id, embedding, metadata FROM vectors ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, blob, metadata) = row?;
            let Some(metadata) = readable_metadata(&id, &metadata) else {
                continue;
            };
            entries.push(VectorEntry {
                id: MemoryId::from(id),
                embedding: decode_embedding(&blob),
                metadata,
            });
        }
        Ok(entries)
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn upsert(&self, id: &MemoryId, embedding: &[f32], metadata: &Metadata) -> Result<()> {
        let metadata_json = serde_json::to_string(metadata)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vectors (id, embedding, dimension, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                    embedding = excluded.embedding,
                    dimension = excluded.dimension,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at",
                params![
                    id.as_str(),
                    encode_embedding(embedding),
                    embedding.len() as i64,
                    metadata_json,
                ],
            )?;
            Ok(())
        })
    }

    fn query(&self, embedding: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.with_conn(Self::load_rows)?;

        let mut hits: Vec<VectorHit> = entries
            .into_iter()
            .filter(|e| filter.matches(&e.metadata))
            .map(|e| VectorHit {
                similarity: cosine_similarity(embedding, &e.embedding),
                id: e.id,
                metadata: e.metadata,
                embedding: e.embedding,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn get_all(&self) -> Result<Vec<(MemoryId, Metadata)>> {
        let entries = self.with_conn(Self::load_rows)?;
        Ok(entries.into_iter().map(|e| (e.id, e.metadata)).collect())
    }

    fn get(&self, ids: &[MemoryId]) -> Result<Vec<VectorEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, embedding, metadata FROM vectors WHERE id = ?1")?;
            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                let mut rows = stmt.query(params![id.as_str()])?;
                if let Some(row) = rows.next()? {
                    let blob: Vec<u8> = row.get(1)?;
                    let metadata: String = row.get(2)?;
                    let Some(metadata) = readable_metadata(id.as_str(), &metadata) else {
                        continue;
                    };
                    entries.push(VectorEntry {
                        id: id.clone(),
                        embedding: decode_embedding(&blob),
                        metadata,
                    });
                }
            }
            Ok(entries)
        })
    }

    fn delete(&self, id: &MemoryId) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM vectors WHERE id = ?1", params![id.as_str()])?;
            Ok(rows > 0)
        })
    }

    fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn decode_metadata(json: &str) -> Result<Metadata> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::unavailable(format!(
            "corrupt metadata: expected object, found {}",
            other
        ))),
    }
}

fn readable_metadata(id: &str, json: &str) -> Option<Metadata> {
    match decode_metadata(json) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(memory = %id, error = %e, "Skipping vector row with corrupt metadata");
            None
        }
    }
}
