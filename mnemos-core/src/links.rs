//! Graph projection of memory records.
//!
//! Every record has a `memory` node in the graph, linked to the topics it
//! mentions, the session it was recorded in, and related or conflicting
//! records. Structural retrieval walks these edges back from the entities a
//! query names. All functions here are blocking; writers must hold the
//! store lease.

use crate::error::Result;
use crate::memory::{
    name_key, Entity, GraphIndex, MemoryFilters, MemoryId, MemoryRecord, NodeMatch, Pattern,
    Relationship, Session, VectorIndex,
};
use crate::scoring::{structural_score, Candidate};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

pub const MEMORY_NODE: &str = "memory";
pub const SESSION_NODE: &str = "session";
/// Type given to entities created implicitly from ingestion
pub const TOPIC_NODE: &str = "topic";

pub const MENTIONS: &str = "MENTIONS";
pub const RELATED_TO: &str = "RELATED_TO";
pub const CONFLICTS_WITH: &str = "CONFLICTS_WITH";
pub const RECORDED_IN: &str = "RECORDED_IN";
pub const SUPERSEDES: &str = "SUPERSEDES";
pub const CONSOLIDATED_INTO: &str = "CONSOLIDATED_INTO";

const MAX_NGRAM: usize = 3;
const MENTION_LOOKUP_LIMIT: usize = 64;

/// Node types owned by the engine rather than by callers.
pub fn is_reserved_type(entity_type: &str) -> bool {
    entity_type == MEMORY_NODE || entity_type == SESSION_NODE
}

fn is_user_entity(entity: &Entity) -> bool {
    !is_reserved_type(&entity.entity_type)
}

/// Graph node for a record.
pub fn memory_node(record: &MemoryRecord) -> Entity {
    Entity::new(record.title.clone(), MEMORY_NODE)
        .with_id(record.id.as_str())
        .with_property("layer", record.layer.as_str())
        .with_property("sublayer", record.sublayer.as_str())
        .with_property("state", record.state.as_str())
}

/// Graph node for a session.
pub fn session_node(session: &Session) -> Entity {
    Entity::new(session.id.clone(), SESSION_NODE)
        .with_id(session.id.clone())
        .with_property("start_time", session.start_time.to_rfc3339())
        .with_property(
            "end_time",
            session
                .end_time
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        )
}

/// Read a session back from its node.
pub fn session_from_entity(entity: &Entity) -> Option<Session> {
    if entity.entity_type != SESSION_NODE {
        return None;
    }
    let parse = |key: &str| {
        entity
            .properties
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    Some(Session {
        id: entity.id.clone(),
        start_time: parse("start_time")?,
        end_time: parse("end_time"),
    })
}

/// Candidate entity-name keys in free text: every 1- to 3-word window.
pub fn mention_keys(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    let mut keys = BTreeSet::new();
    for n in 1..=MAX_NGRAM {
        for window in words.windows(n) {
            keys.insert(name_key(&window.join(" ")));
        }
    }
    keys.into_iter().collect()
}

/// A caller-visible entity with this name, if any.
pub fn find_named(graph: &dyn GraphIndex, name: &str) -> Result<Option<Entity>> {
    Ok(graph
        .find_entities(&NodeMatch::any().named([name]), 8)?
        .into_iter()
        .find(is_user_entity))
}

/// Create the session node if it does not exist yet.
pub fn ensure_session(graph: &dyn GraphIndex, session_id: &str, now: DateTime<Utc>) -> Result<()> {
    if graph.get_entity(session_id)?.is_none() {
        let session = Session {
            id: session_id.to_string(),
            start_time: now,
            end_time: None,
        };
        graph.create_entity(&session_node(&session))?;
    }
    Ok(())
}

/// Project a record into the graph.
///
/// Upserts the record's node, links named and implicitly mentioned topics,
/// the recording session, and an optional edge to another record.
pub fn link_record(
    graph: &dyn GraphIndex,
    record: &MemoryRecord,
    entity_names: &[String],
    edge: Option<(&str, &MemoryRecord)>,
    now: DateTime<Utc>,
) -> Result<()> {
    graph.create_entity(&memory_node(record))?;

    let mut mentioned: BTreeSet<String> = BTreeSet::new();
    for name in entity_names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let entity = match find_named(graph, name)? {
            Some(existing) => existing,
            None => {
                let created = Entity::new(name, TOPIC_NODE);
                graph.create_entity(&created)?;
                created
            }
        };
        mentioned.insert(entity.id);
    }

    let keys = mention_keys(&record.content);
    if !keys.is_empty() {
        for entity in graph.find_entities(&NodeMatch::any().named(&keys), MENTION_LOOKUP_LIMIT)? {
            if is_user_entity(&entity) {
                mentioned.insert(entity.id);
            }
        }
    }

    for entity_id in mentioned {
        graph.create_relationship(&Relationship::new(record.id.as_str(), entity_id, MENTIONS))?;
    }

    if let Some(ref session_id) = record.source_session_id {
        ensure_session(graph, session_id, now)?;
        graph.create_relationship(&Relationship::new(
            record.id.as_str(),
            session_id.as_str(),
            RECORDED_IN,
        ))?;
    }

    if let Some((relationship_type, other)) = edge {
        graph.create_entity(&memory_node(other))?;
        graph.create_relationship(&Relationship::new(
            record.id.as_str(),
            other.id.as_str(),
            relationship_type,
        ))?;
    }
    Ok(())
}

/// [`link_record`] that logs instead of failing.
///
/// The vector index is the source of truth; a record whose node is missing
/// is recreated by the next forced consolidation.
pub fn link_record_best_effort(
    graph: &dyn GraphIndex,
    record: &MemoryRecord,
    entity_names: &[String],
    edge: Option<(&str, &MemoryRecord)>,
    now: DateTime<Utc>,
) -> bool {
    match link_record(graph, record, entity_names, edge, now) {
        Ok(()) => true,
        Err(e) => {
            warn!(memory = %record.id, error = %e, "Graph link failed; left for consolidation repair");
            false
        }
    }
}

/// Move every edge of `from` onto `to`, then point `from` at `to`.
pub fn forward_edges(graph: &dyn GraphIndex, from: &MemoryRecord, to: &MemoryRecord) -> Result<()> {
    graph.create_entity(&memory_node(to))?;
    graph.create_entity(&memory_node(from))?;

    let from_id = from.id.as_str();
    let to_id = to.id.as_str();

    for row in graph.query_pattern(&Pattern::new(NodeMatch::id(from_id), NodeMatch::any()))? {
        let rel_type = row.relationship.relationship_type.as_str();
        if rel_type == CONSOLIDATED_INTO || row.target.id == to_id {
            continue;
        }
        graph.create_relationship(&Relationship::new(to_id, row.target.id.as_str(), rel_type))?;
    }
    for row in graph.query_pattern(&Pattern::new(NodeMatch::any(), NodeMatch::id(from_id)))? {
        let rel_type = row.relationship.relationship_type.as_str();
        if rel_type == CONSOLIDATED_INTO || row.source.id == to_id {
            continue;
        }
        graph.create_relationship(&Relationship::new(row.source.id.as_str(), to_id, rel_type))?;
    }

    graph.create_relationship(&Relationship::new(from_id, to_id, CONSOLIDATED_INTO))
}

fn mentioning_memories(graph: &dyn GraphIndex, entity_id: &str, limit: usize) -> Result<Vec<String>> {
    let pattern = Pattern::new(NodeMatch::of_type(MEMORY_NODE), NodeMatch::id(entity_id))
        .via(MENTIONS)
        .limit(limit);
    Ok(graph
        .query_pattern(&pattern)?
        .into_iter()
        .map(|row| row.source.id)
        .collect())
}

fn neighbor_entities(graph: &dyn GraphIndex, entity_id: &str, limit: usize) -> Result<BTreeSet<String>> {
    let mut neighbors = BTreeSet::new();
    let outgoing = Pattern::new(NodeMatch::id(entity_id), NodeMatch::any()).limit(limit);
    for row in graph.query_pattern(&outgoing)? {
        if is_user_entity(&row.target) {
            neighbors.insert(row.target.id);
        }
    }
    let incoming = Pattern::new(NodeMatch::any(), NodeMatch::id(entity_id)).limit(limit);
    for row in graph.query_pattern(&incoming)? {
        if is_user_entity(&row.source) {
            neighbors.insert(row.source.id);
        }
    }
    neighbors.remove(entity_id);
    Ok(neighbors)
}

/// Structural retrieval for a query.
///
/// Entities named in the query are matched by name. Memories mentioning
/// them score by overlap with the query's entities; memories mentioning a
/// directly related entity score at half weight.
pub fn structural_search(
    graph: &dyn GraphIndex,
    vector: &dyn VectorIndex,
    query: &str,
    filters: &MemoryFilters,
    limit: usize,
) -> Result<Vec<Candidate>> {
    let keys = mention_keys(query);
    if keys.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let entities: Vec<Entity> = graph
        .find_entities(&NodeMatch::any().named(&keys), limit)?
        .into_iter()
        .filter(is_user_entity)
        .collect();
    if entities.is_empty() {
        return Ok(Vec::new());
    }

    let mut direct: HashMap<String, BTreeSet<&str>> = HashMap::new();
    let mut indirect: HashMap<String, BTreeSet<&str>> = HashMap::new();
    for entity in &entities {
        for memory_id in mentioning_memories(graph, &entity.id, limit)? {
            direct.entry(memory_id).or_default().insert(entity.id.as_str());
        }
        for neighbor in neighbor_entities(graph, &entity.id, limit)? {
            for memory_id in mentioning_memories(graph, &neighbor, limit)? {
                indirect.entry(memory_id).or_default().insert(entity.id.as_str());
            }
        }
    }

    let total = entities.len();
    let mut scores: HashMap<MemoryId, f32> = HashMap::new();
    let hops = [(direct, 0u32), (indirect, 1u32)];
    for (hits, hop) in hops {
        for (memory_id, matched) in hits {
            let score = structural_score(matched.len(), total, hop);
            let slot = scores.entry(MemoryId::from(memory_id)).or_insert(0.0);
            *slot = slot.max(score);
        }
    }

    let mut ids: Vec<MemoryId> = scores.keys().cloned().collect();
    ids.sort();

    let mut candidates = Vec::new();
    for entry in vector.get(&ids)? {
        let record = match MemoryRecord::from_metadata(&entry.metadata, Vec::new()) {
            Ok(record) => record,
            Err(e) => {
                warn!(memory = %entry.id, error = %e, "Skipping unreadable record");
                continue;
            }
        };
        if !filters.matches(&record) {
            continue;
        }
        let score = scores.get(&entry.id).copied().unwrap_or(0.0);
        candidates.push(Candidate::new(record, score));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{SqliteGraphIndex, SqliteVectorIndex};
    use pretty_assertions::assert_eq;

    fn store(vector: &SqliteVectorIndex, record: &MemoryRecord) {
        vector
            .upsert(&record.id, &[1.0, 0.0], &record.to_metadata().unwrap())
            .unwrap();
    }

    #[test]
    fn test_mention_keys() {
        let keys = mention_keys("Ask Billing Service, please!");
        assert!(keys.contains(&"billing service".to_string()));
        assert!(keys.contains(&"billing".to_string()));
        assert!(keys.contains(&"ask billing service".to_string()));
        assert!(!keys.iter().any(|k| k.contains(',')));
        assert!(mention_keys("  ").is_empty());
    }

    #[test]
    fn test_session_node_round_trip() {
        let mut session = Session::start();
        let node = session_node(&session);
        assert_eq!(session_from_entity(&node).unwrap().id, session.id);
        assert!(session_from_entity(&node).unwrap().is_open());

        session.end_time = Some(Utc::now());
        let closed = session_from_entity(&session_node(&session)).unwrap();
        assert!(!closed.is_open());

        assert!(session_from_entity(&Entity::new("x", TOPIC_NODE)).is_none());
    }

    #[test]
    fn test_link_record_creates_mentions_and_session_edges() {
        let graph = SqliteGraphIndex::in_memory().unwrap();
        let redis = Entity::new("Redis", "service");
        graph.create_entity(&redis).unwrap();

        let record = MemoryRecord::new("Redis evicts keys under memory pressure").with_session("s-1");
        link_record(&graph, &record, &["Eviction Policy".to_string()], None, Utc::now()).unwrap();

        let mentions = graph
            .query_pattern(&Pattern::new(NodeMatch::id(record.id.as_str()), NodeMatch::any()).via(MENTIONS))
            .unwrap();
        let mut names: Vec<String> = mentions.into_iter().map(|r| r.target.name).collect();
        names.sort();
        assert_eq!(names, vec!["Eviction Policy".to_string(), "Redis".to_string()]);

        let sessions = graph
            .query_pattern(&Pattern::new(NodeMatch::id(record.id.as_str()), NodeMatch::of_type(SESSION_NODE)))
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].relationship.relationship_type, RECORDED_IN);

        // relinking is idempotent
        link_record(&graph, &record, &["eviction policy".to_string()], None, Utc::now()).unwrap();
        let stats = graph.stats().unwrap();
        assert_eq!(stats.entities, 4);
        assert_eq!(stats.relationships, 3);
    }

    #[test]
    fn test_structural_search_scores_direct_and_one_hop() {
        let graph = SqliteGraphIndex::in_memory().unwrap();
        let vector = SqliteVectorIndex::in_memory().unwrap();

        let api = Entity::new("gateway", "service");
        let auth = Entity::new("auth", "service");
        graph.create_entity(&api).unwrap();
        graph.create_entity(&auth).unwrap();
        graph
            .create_relationship(&Relationship::new(api.id.as_str(), auth.id.as_str(), "DEPENDS_ON"))
            .unwrap();

        let direct = MemoryRecord::new("gateway returns 502 during deploys");
        let hop = MemoryRecord::new("auth tokens expire after one hour");
        for record in [&direct, &hop] {
            store(&vector, record);
            link_record(&graph, record, &[], None, Utc::now()).unwrap();
        }

        let results =
            structural_search(&graph, &vector, "what depends on gateway", &MemoryFilters::default(), 20)
                .unwrap();
        let score_of = |id: &MemoryId| {
            results
                .iter()
                .find(|c| &c.record.id == id)
                .map(|c| c.score)
                .unwrap()
        };
        assert_eq!(score_of(&direct.id), 1.0);
        assert_eq!(score_of(&hop.id), 0.5);
    }

    #[test]
    fn test_structural_search_without_entities_is_empty() {
        let graph = SqliteGraphIndex::in_memory().unwrap();
        let vector = SqliteVectorIndex::in_memory().unwrap();
        let results =
            structural_search(&graph, &vector, "nothing here", &MemoryFilters::default(), 10).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_forward_edges() {
        let graph = SqliteGraphIndex::in_memory().unwrap();
        let topic = Entity::new("flaky tests", TOPIC_NODE);
        graph.create_entity(&topic).unwrap();

        let old = MemoryRecord::new("flaky tests in ci come from shared tmp dirs");
        let survivor = MemoryRecord::new("flaky tests come from shared tmp dirs");
        link_record(&graph, &old, &[], None, Utc::now()).unwrap();
        forward_edges(&graph, &old, &survivor).unwrap();

        let from_survivor = graph
            .query_pattern(&Pattern::new(NodeMatch::id(survivor.id.as_str()), NodeMatch::id(topic.id.as_str())))
            .unwrap();
        assert_eq!(from_survivor.len(), 1);

        let pointer = graph
            .query_pattern(&Pattern::new(NodeMatch::id(old.id.as_str()), NodeMatch::any()).via(CONSOLIDATED_INTO))
            .unwrap();
        assert_eq!(pointer[0].target.id, survivor.id.as_str());
    }
}
