//! Memory records and the stores that hold them.
//!
//! - [`types`]: records, layer tags, entities, sessions and filters
//! - [`vector`]: embedding index with filtered nearest-neighbor queries
//! - [`graph`]: single-writer property graph with a read-only query handle
//! - [`embedding`]: the [`Embedder`] seam and a deterministic hashing embedder
//!
//! ## Example
//!
//! ```rust,ignore
//! use mnemos_core::memory::{MemoryRecord, SqliteVectorIndex, VectorFilter, VectorIndex};
//!
//! let index = SqliteVectorIndex::in_memory()?;
//! let record = MemoryRecord::new("The API uses JWT for auth").with_importance(8);
//! index.upsert(&record.id, &embedding, &record.to_metadata()?)?;
//!
//! let hits = index.query(&query_embedding, 5, &VectorFilter::live())?;
//! ```

pub mod embedding;
mod graph;
pub(crate) mod schema;
mod types;
mod vector;

pub use embedding::{cosine_similarity, Embedder, HashingEmbedder, DEFAULT_DIMENSION};
pub use graph::{
    name_key, GraphIndex, GraphStats, NodeMatch, Pattern, PatternRow, SqliteGraphIndex,
};
pub use schema::{
    configure_connection, configure_read_only, get_schema_version, initialize_schema,
    is_initialized, SchemaComponent, BUSY_TIMEOUT, SCHEMA_VERSION,
};
pub use types::{
    content_hash, validate_importance, Entity, Layer, LayerTag, MemoryFilters, MemoryId,
    MemoryRecord, Metadata, Provenance, RecordState, Relationship, RetrievalMode, Session,
    Sublayer, MAX_IMPORTANCE, MIN_IMPORTANCE,
};
pub use vector::{FilterCondition, SqliteVectorIndex, VectorEntry, VectorFilter, VectorHit, VectorIndex};
