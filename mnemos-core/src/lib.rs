//! # mnemos-core
//!
//! A memory orchestration engine for AI assistants: persistent, layered
//! memory recalled by meaning and by entity relationships, shared safely by
//! several processes over the same on-disk stores.
//!
//! ## Core Components
//!
//! - **Memory**: Records, the vector and graph stores, the embedding seam
//! - **Classifier**: Deterministic layer/sublayer tagging
//! - **Dedup**: New / redundant / related / contradictory decisions
//! - **Scoring**: Temporal decay and hybrid result ranking
//! - **Lock**: Cross-process write leases with stale-holder reclamation
//! - **Orchestrator**: The [`MemoryEngine`] façade tying them together
//! - **Tools**: JSON tool surface for assistant clients
//!
//! ## Example
//!
//! ```rust,ignore
//! use mnemos_core::{EngineConfig, IngestRequest, MemoryEngine, SearchRequest, StoreHandles};
//!
//! let config = EngineConfig::from_env();
//! let stores = StoreHandles::open("/var/lib/mnemos", config.lease.clone())?;
//! let engine = MemoryEngine::new(stores, config)?;
//!
//! let added = engine.ingest(IngestRequest::new("I prefer dark mode").with_importance(7)).await?;
//! let found = engine.search(SearchRequest::new("editor theme preferences")).await;
//! ```

pub mod classifier;
pub mod config;
pub mod consolidate;
pub mod dedup;
pub mod error;
pub mod links;
pub mod lock;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod router;
pub mod scoring;
pub mod tools;

#[cfg(test)]
mod proptest;

// Re-exports for convenience
pub use classifier::{Classification, Classify, RuleClassifier};
pub use config::{ConsolidationConfig, EngineConfig, RetrievalConfig, StoreTimeouts};
pub use consolidate::{ConsolidationGroup, ConsolidationReport};
pub use dedup::{
    ContradictionDetector, DedupConfig, DedupDecision, DedupEngine, DedupOutcome,
    NegationPolarityDetector,
};
pub use error::{Error, ErrorKind, Result};
pub use lock::{HolderIdentity, Lease, LeaseConfig, LeaseGuard, LeaseManager, STORE_RESOURCE};
pub use logging::init_logging;
pub use memory::{
    Embedder, Entity, GraphIndex, HashingEmbedder, Layer, LayerTag, MemoryFilters, MemoryId,
    MemoryRecord, Provenance, RecordState, Relationship, RetrievalMode, Session,
    SqliteGraphIndex, SqliteVectorIndex, Sublayer, VectorIndex,
};
pub use orchestrator::{
    ContextBundle, EngineStats, IngestRequest, IngestResult, IngestStatus, MemoryEngine,
    SearchRequest, SearchResponse, StoreHandles,
};
pub use scoring::{RouteWeights, ScoredMemory, ScoringConfig};
pub use tools::{ToolDefinition, ToolRegistry};
