//! The memory engine façade.
//!
//! [`MemoryEngine`] coordinates the two stores:
//!
//! 1. INGEST: classify, embed, then under the store lease dedupe against
//!    nearest neighbors, write the vector index, project into the graph
//! 2. SEARCH: route the query, run the semantic and structural paths
//!    concurrently, merge and rank with temporal decay
//! 3. CONSOLIDATE: fold near-duplicates into canonical records and repair
//!    graph nodes the vector index has but the graph lost
//!
//! Store calls are blocking and run on tokio's blocking pool, each bounded
//! by a timeout. Every mutation holds the cross-process store lease for the
//! span of one write and releases it on every exit path.

use crate::classifier::{Classification, Classify, RuleClassifier};
use crate::config::EngineConfig;
use crate::consolidate::{self, ConsolidationReport};
use crate::dedup::{self, ContradictionDetector, DedupDecision, DedupEngine, Neighbor};
use crate::error::{Error, ErrorKind, Result};
use crate::links::{self, CONFLICTS_WITH, RELATED_TO, SUPERSEDES};
use crate::lock::{HolderIdentity, LeaseConfig, LeaseManager, STORE_RESOURCE};
use crate::memory::{
    Embedder, Entity, GraphIndex, HashingEmbedder, Layer, LayerTag, MemoryFilters, MemoryId,
    MemoryRecord, Metadata, NodeMatch, RecordState, Relationship, RetrievalMode, Session,
    SqliteGraphIndex, SqliteVectorIndex, Sublayer, VectorFilter, VectorIndex,
};
use crate::router;
use crate::scoring::{self, Candidate, RouteWeights, ScoredMemory};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Importance given to memories ingested without one.
pub const DEFAULT_IMPORTANCE: u8 = 5;

/// Explicit handles to every collaborator the engine uses.
#[derive(Clone)]
pub struct StoreHandles {
    pub vector: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn GraphIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub leases: Arc<LeaseManager>,
}

impl StoreHandles {
    /// SQLite-backed stores under `dir` (`vectors.db`, `graph.db`, `leases.db`).
    pub fn open(dir: impl AsRef<Path>, lease: LeaseConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        Ok(Self {
            vector: Arc::new(SqliteVectorIndex::open(dir.join("vectors.db"))?),
            graph: Arc::new(SqliteGraphIndex::open(dir.join("graph.db"))?),
            embedder: Arc::new(HashingEmbedder::default()),
            leases: Arc::new(LeaseManager::open(dir.join("leases.db"), lease)?),
        })
    }

    /// Isolated in-memory stores (for testing).
    pub fn in_memory(lease: LeaseConfig) -> Result<Self> {
        Ok(Self {
            vector: Arc::new(SqliteVectorIndex::in_memory()?),
            graph: Arc::new(SqliteGraphIndex::in_memory()?),
            embedder: Arc::new(HashingEmbedder::default()),
            leases: Arc::new(LeaseManager::in_memory(lease)?),
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }
}

/// A memory to ingest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub content: String,
    #[serde(default)]
    pub importance: Option<u8>,
    /// Overrides classification; must agree with `sublayer` when both are set
    #[serde(default)]
    pub layer: Option<Layer>,
    #[serde(default)]
    pub sublayer: Option<Sublayer>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Entity names the memory is about
    #[serde(default)]
    pub entities: Vec<String>,
    /// Caller judged this to contradict its closest existing memory
    #[serde(default)]
    pub contradicts: bool,
}

impl IngestRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_sublayer(mut self, sublayer: Sublayer) -> Self {
        self.sublayer = Some(sublayer);
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn mentioning<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities.extend(entities.into_iter().map(Into::into));
        self
    }

    pub fn contradicting(mut self) -> Self {
        self.contradicts = true;
        self
    }
}

/// Whether ingestion produced a record or reinforced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Created,
    Reinforced,
}

/// Result of [`MemoryEngine::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub id: MemoryId,
    pub status: IngestStatus,
    pub decision: DedupDecision,
    pub title: String,
    pub layer: Layer,
    pub sublayer: Sublayer,
    /// Similarity to the closest existing memory
    pub similarity: f32,
    /// Existing memory this one was folded into, linked to, or conflicts with
    pub matched: Option<MemoryId>,
    /// The write lease was taken over from a stale holder
    pub lease_reclaimed: bool,
}

/// A retrieval query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub filters: MemoryFilters,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: RetrievalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filters(mut self, filters: MemoryFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Ranked results. Failures degrade instead of raising.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredMemory>,
    pub total: usize,
    pub mode: RetrievalMode,
    pub weights: RouteWeights,
    /// A retrieval path failed or timed out; results may be incomplete
    pub degraded: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SearchResponse {
    fn empty(mode: RetrievalMode, weights: RouteWeights) -> Self {
        Self {
            results: Vec::new(),
            total: 0,
            mode,
            weights,
            degraded: false,
            warnings: Vec::new(),
        }
    }

    fn degrade(&mut self, path: &str, error: &Error) {
        warn!(path, error = %error, "Retrieval path failed");
        self.degraded = true;
        self.warnings.push(format!("{} path: {}", path, error));
    }
}

/// Query-independent context for a session.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub session_id: String,
    pub session: Option<Session>,
    /// The session's live memories, newest first
    pub recent: Vec<MemoryRecord>,
    /// High-importance self-layer memories from any session
    pub standing: Vec<MemoryRecord>,
}

/// Store-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub records: usize,
    pub live: usize,
    pub consolidated: usize,
    pub conflicted: usize,
    pub by_layer: BTreeMap<String, usize>,
    pub entities: u64,
    pub relationships: u64,
    pub active_leases: usize,
}

/// Coordinates classification, dedup, leases, both stores and ranking.
#[derive(Clone)]
pub struct MemoryEngine {
    stores: StoreHandles,
    config: Arc<EngineConfig>,
    classifier: Arc<dyn Classify>,
    dedup: DedupEngine,
}

impl MemoryEngine {
    /// Build an engine over explicit stores. Rejects inconsistent config.
    pub fn new(stores: StoreHandles, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dedup: DedupEngine::new(config.dedup.clone()),
            stores,
            config: Arc::new(config),
            classifier: Arc::new(RuleClassifier::new()),
        })
    }

    /// In-memory stores with default configuration.
    pub fn in_memory() -> Result<Self> {
        let config = EngineConfig::default();
        Self::new(StoreHandles::in_memory(config.lease.clone())?, config)
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classify>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_contradiction_detector(mut self, detector: Arc<dyn ContradictionDetector>) -> Self {
        self.dedup = self.dedup.with_detector(detector);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreHandles {
        &self.stores
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Classify, dedupe and store a memory.
    ///
    /// Identical content always converges on one record. Contention that
    /// outlasts the lease wait surfaces as a retryable error.
    ///
    /// An [`Error::Timeout`] does not mean nothing was written: the store
    /// call keeps running in the background and may still commit. Retrying
    /// the same content is safe and reports the record as reinforced.
    #[instrument(skip(self, request), fields(content_len = request.content.len()))]
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResult> {
        let classification = self.resolve_tag(&request)?;
        let tag = classification.tag;
        if let Some(importance) = request.importance {
            crate::memory::validate_importance(importance)?;
        }
        if request.content.trim().is_empty() {
            return Err(Error::validation("content must not be empty"));
        }

        let embedding = self.embed(&request.content).await?;

        let mut record = MemoryRecord::new(request.content.clone())
            .with_importance(request.importance.unwrap_or(DEFAULT_IMPORTANCE))
            .with_decay_rate(self.config.scoring.decay_base)
            .with_tag(tag)
            .with_embedding(embedding)
            .with_tags(
                request
                    .tags
                    .iter()
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty()),
            );
        record.domain = request.domain.clone();
        record.category = request.category.clone();
        record.source_session_id = request.session_id.clone();
        record.validate()?;

        debug!(
            layer = %tag.layer,
            sublayer = %tag.sublayer,
            rule = classification.rule.unwrap_or("fallback"),
            "Classified memory"
        );

        let dedup = self.dedup.clone();
        let entities = request.entities;
        let contradicts = request.contradicts;
        let (result, lease_reclaimed) = self
            .write("ingest", move |stores| {
                ingest_locked(stores, &dedup, record, &entities, contradicts)
            })
            .await?;

        let result = IngestResult {
            lease_reclaimed,
            ..result
        };
        info!(
            id = %result.id,
            decision = %result.decision,
            similarity = result.similarity,
            "Ingested memory"
        );
        Ok(result)
    }

    fn resolve_tag(&self, request: &IngestRequest) -> Result<Classification> {
        match (request.layer, request.sublayer) {
            (Some(layer), Some(sublayer)) => Ok(Classification {
                tag: LayerTag::new(layer, sublayer)?,
                rule: Some("explicit"),
            }),
            (None, Some(sublayer)) => Ok(Classification {
                tag: LayerTag::of(sublayer),
                rule: Some("explicit"),
            }),
            (Some(layer), None) => {
                let classified = self.classifier.classify(&request.content);
                if classified.tag.layer == layer {
                    Ok(classified)
                } else {
                    Ok(Classification {
                        tag: LayerTag::of(layer.sublayers()[0]),
                        rule: Some("explicit"),
                    })
                }
            }
            (None, None) => Ok(self.classifier.classify(&request.content)),
        }
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Hybrid retrieval. Never fails; path failures set `degraded`.
    #[instrument(skip(self, request), fields(mode = %request.mode))]
    pub async fn search(&self, request: SearchRequest) -> SearchResponse {
        let weights = router::weights_for(request.mode, &request.query);
        let mut response = SearchResponse::empty(request.mode, weights);
        let limit = request
            .limit
            .unwrap_or(self.config.retrieval.default_limit);
        if request.query.trim().is_empty() || limit == 0 {
            return response;
        }
        let pool = self.config.retrieval.candidate_pool.max(limit);

        let semantic = async {
            if weights.uses_vector() {
                self.semantic_candidates(&request.query, &request.filters, pool)
                    .await
            } else {
                Ok(Vec::new())
            }
        };
        let structural = async {
            if weights.uses_graph() {
                self.structural_candidates(&request.query, &request.filters, pool)
                    .await
            } else {
                Ok(Vec::new())
            }
        };
        let (semantic, structural) = tokio::join!(semantic, structural);

        let semantic = semantic.unwrap_or_else(|e| {
            response.degrade("semantic", &e);
            Vec::new()
        });
        let structural = structural.unwrap_or_else(|e| {
            response.degrade("structural", &e);
            Vec::new()
        });

        let ranked = scoring::merge_and_rank(
            semantic,
            structural,
            weights,
            Utc::now(),
            &self.config.scoring,
            limit,
        );
        response.total = ranked.len();
        response.results = ranked;

        if self.config.retrieval.reinforce_on_access && !response.results.is_empty() {
            let ids = response.results.iter().map(|m| m.record.id.clone()).collect();
            self.reinforce(ids).await;
        }

        debug!(
            total = response.total,
            degraded = response.degraded,
            "Search complete"
        );
        response
    }

    async fn semantic_candidates(
        &self,
        query: &str,
        filters: &MemoryFilters,
        pool: usize,
    ) -> Result<Vec<Candidate>> {
        let embedding = self.embed(query).await?;
        let vector = Arc::clone(&self.stores.vector);
        let filter = VectorFilter::from_filters(filters);
        let filters = filters.clone();

        blocking("vector query", self.config.timeouts.store_call, move || {
            let hits = vector.query(&embedding, pool, &filter)?;
            let mut candidates = Vec::with_capacity(hits.len());
            for hit in hits.into_iter().filter(|h| h.similarity > 0.0) {
                match MemoryRecord::from_metadata(&hit.metadata, hit.embedding) {
                    Ok(record) if filters.matches(&record) => {
                        candidates.push(Candidate::new(record, hit.similarity))
                    }
                    Ok(_) => {}
                    Err(e) => warn!(memory = %hit.id, error = %e, "Skipping unreadable record"),
                }
            }
            Ok(candidates)
        })
        .await
    }

    async fn structural_candidates(
        &self,
        query: &str,
        filters: &MemoryFilters,
        pool: usize,
    ) -> Result<Vec<Candidate>> {
        let graph = Arc::clone(&self.stores.graph);
        let vector = Arc::clone(&self.stores.vector);
        let query = query.to_string();
        let filters = filters.clone();

        blocking("graph query", self.config.timeouts.store_call, move || {
            links::structural_search(graph.as_ref(), vector.as_ref(), &query, &filters, pool)
        })
        .await
    }

    /// Count an access on each returned record. Skipped under contention.
    async fn reinforce(&self, ids: Vec<MemoryId>) {
        let stores = self.stores.clone();
        let outcome = blocking("reinforce", self.config.timeouts.store_call, move || {
            let holder = HolderIdentity::current("reinforce");
            let guard = match stores.leases.try_acquire_guard(STORE_RESOURCE, &holder) {
                Ok(guard) => guard,
                Err(e) if e.kind() == ErrorKind::Contention => return Ok(0),
                Err(e) => return Err(e),
            };
            let now = Utc::now();
            let mut touched = 0;
            for entry in stores.vector.get(&ids)? {
                let mut record = MemoryRecord::from_metadata(&entry.metadata, entry.embedding)?;
                if record.is_consolidated() {
                    continue;
                }
                record.touch(now);
                persist(stores.vector.as_ref(), &record)?;
                touched += 1;
            }
            guard.release()?;
            Ok(touched)
        })
        .await;

        match outcome {
            Ok(touched) => debug!(touched, "Reinforced retrieved memories"),
            Err(e) => warn!(error = %e, "Reinforcement skipped"),
        }
    }

    /// Recent memories of a session plus standing self-layer memories.
    #[instrument(skip(self))]
    pub async fn get_context(&self, session_id: &str) -> Result<ContextBundle> {
        let session_id = session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(Error::validation("session id must not be empty"));
        }
        let stores = self.stores.clone();
        let retrieval = self.config.retrieval.clone();

        blocking("context", self.config.timeouts.store_call, move || {
            let session = stores
                .graph
                .get_entity(&session_id)?
                .as_ref()
                .and_then(links::session_from_entity);
            let live: Vec<MemoryRecord> = load_records(stores.vector.as_ref())?
                .into_iter()
                .filter(|r| !r.is_consolidated())
                .collect();

            let mut recent: Vec<MemoryRecord> = live
                .iter()
                .filter(|r| r.source_session_id.as_deref() == Some(session_id.as_str()))
                .cloned()
                .collect();
            recent.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            recent.truncate(retrieval.context_recent);

            let in_recent: HashSet<&MemoryId> = recent.iter().map(|r| &r.id).collect();
            let mut standing: Vec<MemoryRecord> = live
                .iter()
                .filter(|r| {
                    r.layer == Layer::SelfLayer
                        && r.importance >= retrieval.context_min_importance
                        && !in_recent.contains(&r.id)
                })
                .cloned()
                .collect();
            standing.sort_by(|a, b| {
                b.importance
                    .cmp(&a.importance)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            });

            Ok(ContextBundle {
                session_id,
                session,
                recent,
                standing,
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------

    /// Plan a consolidation pass; apply it only when `force` is set.
    #[instrument(skip(self))]
    pub async fn consolidate(&self, force: bool) -> Result<ConsolidationReport> {
        let config = Arc::clone(&self.config);
        let report = if force {
            self.write("consolidate", move |stores| {
                consolidation_pass(stores, &config, true)
            })
            .await?
            .0
        } else {
            let stores = self.stores.clone();
            blocking("consolidate", self.config.timeouts.store_call, move || {
                consolidation_pass(&stores, &config, false)
            })
            .await?
        };

        info!(
            dry_run = report.dry_run,
            groups = report.groups.len(),
            merged = report.merged_records,
            repaired = report.repaired_graph_nodes,
            "Consolidation pass complete"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Sessions, entities, conflicts
    // ------------------------------------------------------------------

    /// Open a new session.
    pub async fn start_session(&self) -> Result<Session> {
        let session = Session::start();
        self.write("start_session", move |stores| {
            stores.graph.create_entity(&links::session_node(&session))?;
            Ok(session)
        })
        .await
        .map(|(session, _)| session)
    }

    /// Close a session. Closing twice keeps the first end time.
    pub async fn end_session(&self, session_id: &str) -> Result<Session> {
        let session_id = session_id.to_string();
        self.write("end_session", move |stores| {
            let entity = stores
                .graph
                .get_entity(&session_id)?
                .ok_or_else(|| Error::NotFound(format!("session '{}'", session_id)))?;
            let mut session = links::session_from_entity(&entity).ok_or_else(|| {
                Error::validation(format!("'{}' is not a session", session_id))
            })?;
            if session.is_open() {
                session.end_time = Some(Utc::now());
                stores.graph.create_entity(&links::session_node(&session))?;
            }
            Ok(session)
        })
        .await
        .map(|(session, _)| session)
    }

    /// Create an entity, or update the properties of one with the same
    /// name and type.
    pub async fn add_entity(
        &self,
        name: &str,
        entity_type: &str,
        properties: Metadata,
    ) -> Result<Entity> {
        let name = name.trim().to_string();
        let entity_type = entity_type.trim().to_string();
        if name.is_empty() || entity_type.is_empty() {
            return Err(Error::validation("entity name and type must not be empty"));
        }
        if links::is_reserved_type(&entity_type) {
            return Err(Error::validation(format!(
                "entity type '{}' is reserved",
                entity_type
            )));
        }

        self.write("add_entity", move |stores| {
            let same_name = NodeMatch::of_type(entity_type.as_str()).named([&name]);
            let existing = stores.graph.find_entities(&same_name, 1)?.into_iter().next();
            let mut entity = existing.unwrap_or_else(|| Entity::new(name, entity_type));
            entity.properties.extend(properties);
            stores.graph.create_entity(&entity)?;
            Ok(entity)
        })
        .await
        .map(|(entity, _)| entity)
    }

    /// Link two existing entities.
    pub async fn add_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: &str,
        properties: Metadata,
    ) -> Result<Relationship> {
        let relationship_type = relationship_type.trim();
        if relationship_type.is_empty() {
            return Err(Error::validation("relationship type must not be empty"));
        }
        let mut relationship = Relationship::new(source_id, target_id, relationship_type);
        relationship.properties = properties;

        self.write("add_relationship", move |stores| {
            stores.graph.create_relationship(&relationship)?;
            Ok(relationship)
        })
        .await
        .map(|(relationship, _)| relationship)
    }

    /// Settle a contradiction: `keep` supersedes `drop`. Neither record is
    /// deleted.
    #[instrument(skip(self))]
    pub async fn resolve_conflict(&self, keep: &MemoryId, drop: &MemoryId) -> Result<MemoryRecord> {
        if keep == drop {
            return Err(Error::validation("a memory cannot conflict with itself"));
        }
        let (keep_id, drop_id) = (keep.clone(), drop.clone());

        self.write("resolve_conflict", move |stores| {
            let mut keep = load_record(stores.vector.as_ref(), &keep_id)?;
            let mut drop = load_record(stores.vector.as_ref(), &drop_id)?;
            if !keep.conflict_ids.contains(&drop.id) && !drop.conflict_ids.contains(&keep.id) {
                return Err(Error::validation(format!(
                    "no conflict recorded between {} and {}",
                    keep.id, drop.id
                )));
            }

            dedup::clear_conflict(&mut keep, &mut drop);
            keep.supersedes_id = Some(drop.id.clone());
            persist(stores.vector.as_ref(), &keep)?;
            persist(stores.vector.as_ref(), &drop)?;

            let graph = stores.graph.as_ref();
            let relinked = (|| -> Result<()> {
                graph.delete_relationship(keep.id.as_str(), drop.id.as_str(), CONFLICTS_WITH)?;
                graph.delete_relationship(drop.id.as_str(), keep.id.as_str(), CONFLICTS_WITH)?;
                graph.create_entity(&links::memory_node(&drop))?;
                graph.create_entity(&links::memory_node(&keep))?;
                graph.create_relationship(&Relationship::new(
                    keep.id.as_str(),
                    drop.id.as_str(),
                    SUPERSEDES,
                ))
            })();
            if let Err(e) = relinked {
                warn!(keep = %keep.id, error = %e, "Graph update for resolution failed");
            }
            Ok(keep)
        })
        .await
        .map(|(record, _)| record)
    }

    /// Hard-delete a memory from both stores. Requires `privileged`.
    #[instrument(skip(self))]
    pub async fn delete_memory(&self, id: &MemoryId, privileged: bool) -> Result<bool> {
        if !privileged {
            return Err(Error::validation(
                "hard delete requires the privileged flag",
            ));
        }
        let id = id.clone();

        self.write("delete_memory", move |stores| {
            let existed = stores.vector.delete(&id)?;
            if let Err(e) = stores.graph.delete_entity(id.as_str()) {
                warn!(memory = %id, error = %e, "Graph node removal failed");
            }

            let referencing: Vec<MemoryId> = load_records(stores.vector.as_ref())?
                .into_iter()
                .filter(|r| r.related_memory_ids.contains(&id) || r.conflict_ids.contains(&id))
                .map(|r| r.id)
                .collect();
            for entry in stores.vector.get(&referencing)? {
                let mut record = MemoryRecord::from_metadata(&entry.metadata, entry.embedding)?;
                record.related_memory_ids.remove(&id);
                record.conflict_ids.remove(&id);
                persist(stores.vector.as_ref(), &record)?;
            }
            Ok(existed)
        })
        .await
        .map(|(existed, _)| existed)
    }

    /// Fetch one record, embedding included.
    pub async fn get_memory(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        let vector = Arc::clone(&self.stores.vector);
        let id = id.clone();
        blocking("get memory", self.config.timeouts.store_call, move || {
            match vector.get(std::slice::from_ref(&id))?.into_iter().next() {
                Some(entry) => Ok(Some(MemoryRecord::from_metadata(
                    &entry.metadata,
                    entry.embedding,
                )?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Store-wide counts.
    pub async fn stats(&self) -> Result<EngineStats> {
        let stores = self.stores.clone();
        blocking("stats", self.config.timeouts.store_call, move || {
            let records = load_records(stores.vector.as_ref())?;
            let graph = stores.graph.stats()?;
            let mut stats = EngineStats {
                records: records.len(),
                entities: graph.entities,
                relationships: graph.relationships,
                active_leases: stores.leases.active_count()?,
                ..Default::default()
            };
            for record in &records {
                if record.is_consolidated() {
                    stats.consolidated += 1;
                    continue;
                }
                stats.live += 1;
                if record.has_conflicts() {
                    stats.conflicted += 1;
                }
                *stats
                    .by_layer
                    .entry(record.layer.as_str().to_string())
                    .or_default() += 1;
            }
            Ok(stats)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let limit = self.config.timeouts.embed_call;
        match tokio::time::timeout(limit, self.stores.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("embed", limit.as_millis() as u64)),
        }
    }

    /// Run `f` on the blocking pool while holding the store lease.
    ///
    /// Returns `f`'s value and whether the lease was reclaimed from a stale
    /// holder.
    async fn write<F, T>(&self, operation: &'static str, f: F) -> Result<(T, bool)>
    where
        F: FnOnce(&StoreHandles) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let stores = self.stores.clone();
        let wait = self.config.lease.acquire_timeout;
        let budget = wait + self.config.timeouts.store_call;

        blocking(operation, budget, move || {
            let holder = HolderIdentity::current(operation);
            let guard = stores.leases.acquire_guard(STORE_RESOURCE, &holder, wait)?;
            let reclaimed = guard.lease().was_reclaimed();

            let value = f(&stores)?;

            if !guard.release()? {
                warn!(operation, "Write lease was reclaimed before the write finished");
            }
            Ok((value, reclaimed))
        })
        .await
    }
}

/// Dispatch a blocking call with a deadline.
///
/// On timeout the call keeps running to completion in the background; any
/// lease it holds is still released by its guard.
async fn blocking<F, T>(operation: &'static str, limit: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::Internal(format!("{} task failed: {}", operation, join))),
        Err(_) => Err(Error::timeout(operation, limit.as_millis() as u64)),
    }
}

fn persist(vector: &dyn VectorIndex, record: &MemoryRecord) -> Result<()> {
    vector.upsert(&record.id, &record.embedding, &record.to_metadata()?)
}

fn load_record(vector: &dyn VectorIndex, id: &MemoryId) -> Result<MemoryRecord> {
    let entry = vector
        .get(std::slice::from_ref(id))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("memory '{}'", id)))?;
    MemoryRecord::from_metadata(&entry.metadata, entry.embedding)
}

/// Every record (metadata only, no embeddings). Unreadable rows are skipped.
fn load_records(vector: &dyn VectorIndex) -> Result<Vec<MemoryRecord>> {
    let mut records = Vec::new();
    for (id, metadata) in vector.get_all()? {
        match MemoryRecord::from_metadata(&metadata, Vec::new()) {
            Ok(record) => records.push(record),
            Err(e) => warn!(memory = %id, error = %e, "Skipping unreadable record"),
        }
    }
    Ok(records)
}

/// Nearest live neighbors, plus any exact content match the similarity
/// ranking missed.
fn find_neighbors(vector: &dyn VectorIndex, record: &MemoryRecord, top_k: usize) -> Result<Vec<Neighbor>> {
    let mut hits = vector.query(&record.embedding, top_k, &VectorFilter::live())?;
    let exact_filter = VectorFilter::live().eq("content_hash", record.content_hash.as_str());
    for hit in vector.query(&record.embedding, 1, &exact_filter)? {
        if !hits.iter().any(|h| h.id == hit.id) {
            hits.push(hit);
        }
    }

    let mut neighbors = Vec::with_capacity(hits.len());
    for hit in hits {
        match MemoryRecord::from_metadata(&hit.metadata, hit.embedding) {
            Ok(existing) => neighbors.push(Neighbor {
                record: existing,
                similarity: hit.similarity,
            }),
            Err(e) => warn!(memory = %hit.id, error = %e, "Skipping unreadable neighbor"),
        }
    }
    Ok(neighbors)
}

/// The lease-guarded half of ingestion: decide, write vectors, link graph.
fn ingest_locked(
    stores: &StoreHandles,
    dedup: &DedupEngine,
    mut record: MemoryRecord,
    entities: &[String],
    contradicts: bool,
) -> Result<IngestResult> {
    let now = Utc::now();
    let vector = stores.vector.as_ref();
    let graph = stores.graph.as_ref();

    let neighbors = find_neighbors(vector, &record, dedup.config().top_k)?;
    let outcome = dedup.decide(&record, &neighbors, contradicts);
    let matched = outcome
        .best_match
        .as_ref()
        .and_then(|id| neighbors.iter().find(|n| &n.record.id == id))
        .map(|n| n.record.clone());

    let result = |record: &MemoryRecord, status| IngestResult {
        id: record.id.clone(),
        status,
        decision: outcome.decision,
        title: record.title.clone(),
        layer: record.layer,
        sublayer: record.sublayer,
        similarity: outcome.similarity,
        matched: outcome.best_match.clone(),
        lease_reclaimed: false,
    };

    match (outcome.decision, matched) {
        (DedupDecision::Redundant, Some(mut existing)) => {
            dedup::apply_reinforcement(
                &mut existing,
                &record.tags,
                dedup.config().reinforcement_step,
                now,
            );
            persist(vector, &existing)?;
            links::link_record_best_effort(graph, &existing, entities, None, now);
            Ok(result(&existing, IngestStatus::Reinforced))
        }
        (DedupDecision::Related, Some(mut other)) => {
            dedup::link_related(&mut record, &mut other);
            persist(vector, &record)?;
            persist(vector, &other)?;
            links::link_record_best_effort(graph, &record, entities, Some((RELATED_TO, &other)), now);
            Ok(result(&record, IngestStatus::Created))
        }
        (DedupDecision::Contradictory, Some(mut other)) => {
            dedup::mark_conflict(&mut record, &mut other);
            persist(vector, &record)?;
            persist(vector, &other)?;
            links::link_record_best_effort(
                graph,
                &record,
                entities,
                Some((CONFLICTS_WITH, &other)),
                now,
            );
            Ok(result(&record, IngestStatus::Created))
        }
        _ => {
            persist(vector, &record)?;
            links::link_record_best_effort(graph, &record, entities, None, now);
            let mut created = result(&record, IngestStatus::Created);
            created.decision = DedupDecision::New;
            created.matched = None;
            Ok(created)
        }
    }
}

/// Plan consolidation and, when `apply` is set, merge groups, relink
/// references and recreate missing graph nodes.
fn consolidation_pass(
    stores: &StoreHandles,
    config: &EngineConfig,
    apply: bool,
) -> Result<ConsolidationReport> {
    let vector = stores.vector.as_ref();
    let graph = stores.graph.as_ref();
    let now = Utc::now();

    let ids: Vec<MemoryId> = vector.get_all()?.into_iter().map(|(id, _)| id).collect();
    let mut records: Vec<MemoryRecord> = Vec::with_capacity(ids.len());
    for entry in vector.get(&ids)? {
        match MemoryRecord::from_metadata(&entry.metadata, entry.embedding) {
            Ok(record) => records.push(record),
            Err(e) => warn!(memory = %entry.id, error = %e, "Skipping unreadable record"),
        }
    }

    let groups = consolidate::plan(&records, &config.consolidation);
    let mut report = ConsolidationReport {
        dry_run: !apply,
        scanned: records.iter().filter(|r| !r.is_consolidated()).count(),
        merged_records: groups.iter().map(|g| g.merged.len()).sum(),
        ..Default::default()
    };

    if !apply {
        for record in records.iter().filter(|r| !r.is_consolidated()) {
            if graph.get_entity(record.id.as_str())?.is_none() {
                report.missing_graph_nodes += 1;
            }
        }
        report.groups = groups;
        return Ok(report);
    }

    let mut by_id: HashMap<MemoryId, MemoryRecord> =
        records.into_iter().map(|r| (r.id.clone(), r)).collect();
    let mut forwarding: HashMap<MemoryId, MemoryId> = HashMap::new();
    let mut changed: HashSet<MemoryId> = HashSet::new();
    let mut moves: Vec<(MemoryRecord, MemoryId)> = Vec::new();

    for group in &groups {
        let Some(mut canonical) = by_id.remove(&group.canonical) else {
            continue;
        };
        let mut members: Vec<MemoryRecord> = group
            .merged
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        consolidate::merge_group(&mut canonical, &mut members, now);

        changed.insert(canonical.id.clone());
        for member in members {
            forwarding.insert(member.id.clone(), canonical.id.clone());
            changed.insert(member.id.clone());
            moves.push((member.clone(), canonical.id.clone()));
            by_id.insert(member.id.clone(), member);
        }
        by_id.insert(canonical.id.clone(), canonical);
    }

    for record in by_id.values_mut() {
        if record.state == RecordState::Consolidated || forwarding.contains_key(&record.id) {
            continue;
        }
        if consolidate::relink(record, &forwarding) {
            if !changed.contains(&record.id) {
                report.relinked_records += 1;
            }
            changed.insert(record.id.clone());
        }
    }

    let mut changed: Vec<&MemoryId> = changed.iter().collect();
    changed.sort();
    for id in changed {
        if let Some(record) = by_id.get(id) {
            persist(vector, record)?;
        }
    }

    for (member, canonical_id) in &moves {
        let Some(canonical) = by_id.get(canonical_id) else {
            continue;
        };
        if let Err(e) = links::forward_edges(graph, member, canonical) {
            warn!(memory = %member.id, error = %e, "Edge forwarding failed");
        }
    }

    let mut live: Vec<&MemoryRecord> = by_id.values().filter(|r| !r.is_consolidated()).collect();
    live.sort_by(|a, b| a.id.cmp(&b.id));
    for record in live {
        if graph.get_entity(record.id.as_str())?.is_some() {
            continue;
        }
        report.missing_graph_nodes += 1;
        if links::link_record_best_effort(graph, record, &[], None, now) {
            report.repaired_graph_nodes += 1;
        }
    }

    report.groups = groups;
    Ok(report)
}
