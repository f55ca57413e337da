//! Core types for the memory system.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Metadata map persisted alongside an embedding.
pub type Metadata = Map<String, Value>;

/// Lowest allowed importance.
pub const MIN_IMPORTANCE: u8 = 1;
/// Highest allowed importance.
pub const MAX_IMPORTANCE: u8 = 10;

const TITLE_MAX_CHARS: usize = 80;

/// Unique identifier for a memory record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MemoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Top-level semantic layer of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Facts about the user/agent itself
    #[serde(rename = "self")]
    SelfLayer,
    /// Facts about the outside world
    World,
    /// Rules, goals and things to avoid
    Intent,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::SelfLayer, Layer::World, Layer::Intent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfLayer => "self",
            Self::World => "world",
            Self::Intent => "intent",
        }
    }

    /// The three sublayers that belong to this layer.
    pub fn sublayers(&self) -> [Sublayer; 3] {
        match self {
            Self::SelfLayer => [Sublayer::Identity, Sublayer::Preference, Sublayer::Constraint],
            Self::World => [Sublayer::Fact, Sublayer::Failure, Sublayer::Method],
            Self::Intent => [Sublayer::Rule, Sublayer::Goal, Sublayer::AntiPattern],
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "self" => Ok(Self::SelfLayer),
            "world" => Ok(Self::World),
            "intent" => Ok(Self::Intent),
            other => Err(Error::validation(format!("unknown layer '{}'", other))),
        }
    }
}

/// Second-level tag; each sublayer belongs to exactly one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sublayer {
    Identity,
    Preference,
    Constraint,
    Fact,
    Failure,
    Method,
    Rule,
    Goal,
    AntiPattern,
}

impl Sublayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Preference => "preference",
            Self::Constraint => "constraint",
            Self::Fact => "fact",
            Self::Failure => "failure",
            Self::Method => "method",
            Self::Rule => "rule",
            Self::Goal => "goal",
            Self::AntiPattern => "anti_pattern",
        }
    }

    /// The layer that owns this sublayer.
    pub fn layer(&self) -> Layer {
        match self {
            Self::Identity | Self::Preference | Self::Constraint => Layer::SelfLayer,
            Self::Fact | Self::Failure | Self::Method => Layer::World,
            Self::Rule | Self::Goal | Self::AntiPattern => Layer::Intent,
        }
    }
}

impl fmt::Display for Sublayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Sublayer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "identity" => Ok(Self::Identity),
            "preference" => Ok(Self::Preference),
            "constraint" => Ok(Self::Constraint),
            "fact" => Ok(Self::Fact),
            "failure" => Ok(Self::Failure),
            "method" => Ok(Self::Method),
            "rule" => Ok(Self::Rule),
            "goal" => Ok(Self::Goal),
            "anti_pattern" | "antipattern" => Ok(Self::AntiPattern),
            other => Err(Error::validation(format!("unknown sublayer '{}'", other))),
        }
    }
}

/// A validated (layer, sublayer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerTag {
    pub layer: Layer,
    pub sublayer: Sublayer,
}

impl LayerTag {
    /// Build a tag, rejecting pairs where the sublayer belongs to another layer.
    pub fn new(layer: Layer, sublayer: Sublayer) -> Result<Self> {
        if sublayer.layer() != layer {
            return Err(Error::validation(format!(
                "sublayer '{}' does not belong to layer '{}'",
                sublayer, layer
            )));
        }
        Ok(Self { layer, sublayer })
    }

    /// Tag derived from the sublayer alone.
    pub fn of(sublayer: Sublayer) -> Self {
        Self {
            layer: sublayer.layer(),
            sublayer,
        }
    }

    /// Fallback tag for content no rule recognizes.
    pub fn fallback() -> Self {
        Self::of(Sublayer::Fact)
    }

    /// All nine valid pairs.
    pub fn all() -> Vec<LayerTag> {
        Layer::ALL
            .iter()
            .flat_map(|layer| layer.sublayers().into_iter().map(LayerTag::of))
            .collect()
    }
}

impl fmt::Display for LayerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.layer, self.sublayer)
    }
}

/// Lifecycle state of a physical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Created,
    Reinforced,
    /// Terminal: merged into a canonical record
    Consolidated,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reinforced => "reinforced",
            Self::Consolidated => "consolidated",
        }
    }
}

/// A stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub content: String,
    pub title: String,
    /// SHA-256 of the normalized content, used for exact-duplicate detection
    pub content_hash: String,
    /// Persisted by the vector index itself, never inside metadata
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub importance: u8,
    pub decay_rate: f64,
    pub reinforcement_factor: f64,
    pub layer: Layer,
    pub sublayer: Sublayer,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub related_memory_ids: BTreeSet<MemoryId>,
    #[serde(default)]
    pub conflict_ids: BTreeSet<MemoryId>,
    #[serde(default)]
    pub supersedes_id: Option<MemoryId>,
    #[serde(default)]
    pub source_session_id: Option<String>,
    #[serde(default)]
    pub state: RecordState,
    /// Forwarding pointer left behind by consolidation
    #[serde(default)]
    pub consolidated_into: Option<MemoryId>,
}

impl MemoryRecord {
    /// Create a record with default importance (5) and the fallback layer tag.
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        let tag = LayerTag::fallback();
        Self {
            id: MemoryId::new(),
            title: derive_title(&content),
            content_hash: content_hash(&content),
            content,
            embedding: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            importance: 5,
            decay_rate: 0.9,
            reinforcement_factor: 1.0,
            layer: tag.layer,
            sublayer: tag.sublayer,
            domain: None,
            category: None,
            tags: BTreeSet::new(),
            related_memory_ids: BTreeSet::new(),
            conflict_ids: BTreeSet::new(),
            supersedes_id: None,
            source_session_id: None,
            state: RecordState::Created,
            consolidated_into: None,
        }
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tag(mut self, tag: LayerTag) -> Self {
        self.layer = tag.layer;
        self.sublayer = tag.sublayer;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
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

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.source_session_id = Some(session_id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.last_accessed_at = created_at;
        self
    }

    pub fn with_decay_rate(mut self, decay_rate: f64) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    /// The record's (layer, sublayer) pair.
    pub fn layer_tag(&self) -> LayerTag {
        LayerTag {
            layer: self.layer,
            sublayer: self.sublayer,
        }
    }

    pub fn is_consolidated(&self) -> bool {
        self.state == RecordState::Consolidated
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflict_ids.is_empty()
    }

    /// Check the record's invariants.
    pub fn validate(&self) -> Result<()> {
        validate_importance(self.importance)?;
        LayerTag::new(self.layer, self.sublayer)?;
        if self.content.trim().is_empty() {
            return Err(Error::validation("content must not be empty"));
        }
        if !(self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return Err(Error::validation(format!(
                "decay rate {} outside (0, 1]",
                self.decay_rate
            )));
        }
        Ok(())
    }

    /// Record an access; access counts never decrease.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
        if self.state == RecordState::Created {
            self.state = RecordState::Reinforced;
        }
    }

    /// Metadata persisted next to the embedding.
    pub fn to_metadata(&self) -> Result<Metadata> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Internal("record did not serialize to an object".into())),
        }
    }

    /// Rebuild a record from stored metadata and its embedding.
    pub fn from_metadata(metadata: &Metadata, embedding: Vec<f32>) -> Result<Self> {
        let mut record: MemoryRecord = serde_json::from_value(Value::Object(metadata.clone()))?;
        record.embedding = embedding;
        Ok(record)
    }
}

/// Reject importances outside `[1, 10]`.
pub fn validate_importance(importance: u8) -> Result<()> {
    if !(MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&importance) {
        return Err(Error::validation(format!(
            "importance {} outside [{}, {}]",
            importance, MIN_IMPORTANCE, MAX_IMPORTANCE
        )));
    }
    Ok(())
}

/// Hash of whitespace-normalized content.
pub fn content_hash(content: &str) -> String {
    let normalized = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn derive_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(TITLE_MAX_CHARS - 3).collect();
        format!("{}...", truncated.trim_end())
    }
}

/// A named node in the graph index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: Metadata,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            entity_type: entity_type.into(),
            properties: Metadata::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
    #[serde(default)]
    pub properties: Metadata,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type: relationship_type.into(),
            properties: Metadata::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An episode grouping memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Optional retrieval filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilters {
    /// Matches the record's category
    #[serde(default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub min_importance: Option<u8>,
    #[serde(default)]
    pub layer: Option<Layer>,
}

impl MemoryFilters {
    pub fn is_empty(&self) -> bool {
        self.memory_type.is_none()
            && self.domain.is_none()
            && self.min_importance.is_none()
            && self.layer.is_none()
    }

    /// Whether a record passes every filter. Consolidated records never do.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if record.is_consolidated() {
            return false;
        }
        if let Some(ref t) = self.memory_type {
            if record.category.as_deref() != Some(t.as_str()) {
                return false;
            }
        }
        if let Some(ref d) = self.domain {
            if record.domain.as_deref() != Some(d.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if record.importance < min {
                return false;
            }
        }
        if let Some(layer) = self.layer {
            if record.layer != layer {
                return false;
            }
        }
        true
    }
}

/// How retrieval weighs the two search paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Semantic,
    Structured,
    Hybrid,
    #[default]
    Auto,
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semantic => write!(f, "semantic"),
            Self::Structured => write!(f, "structured"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for RetrievalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "structured" | "structural" => Ok(Self::Structured),
            "hybrid" => Ok(Self::Hybrid),
            "auto" => Ok(Self::Auto),
            other => Err(Error::validation(format!("unknown retrieval mode '{}'", other))),
        }
    }
}

/// Which search path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Semantic,
    Structural,
    Both,
}

impl Provenance {
    /// Combine provenance when the same id arrives via another path.
    pub fn merge(self, other: Provenance) -> Provenance {
        if self == other {
            self
        } else {
            Provenance::Both
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_tag_validation() {
        assert!(LayerTag::new(Layer::SelfLayer, Sublayer::Preference).is_ok());
        assert!(LayerTag::new(Layer::World, Sublayer::Preference).is_err());
        assert_eq!(LayerTag::all().len(), 9);
    }

    #[test]
    fn test_sublayer_round_trip_names() {
        for tag in LayerTag::all() {
            let parsed: Sublayer = tag.sublayer.as_str().parse().unwrap();
            assert_eq!(parsed, tag.sublayer);
            assert_eq!(parsed.layer(), tag.layer);
        }
        assert_eq!("anti-pattern".parse::<Sublayer>().unwrap(), Sublayer::AntiPattern);
    }

    #[test]
    fn test_importance_bounds() {
        assert!(validate_importance(0).is_err());
        assert!(validate_importance(1).is_ok());
        assert!(validate_importance(10).is_ok());
        assert!(validate_importance(11).is_err());

        let record = MemoryRecord::new("x").with_importance(12);
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut record = MemoryRecord::new("Test");
        let later = record.last_accessed_at + chrono::Duration::seconds(5);
        record.touch(later);
        record.touch(later - chrono::Duration::seconds(60));

        assert_eq!(record.access_count, 2);
        assert_eq!(record.last_accessed_at, later);
        assert_eq!(record.state, RecordState::Reinforced);
    }

    #[test]
    fn test_metadata_keeps_fields_but_not_embedding() {
        let record = MemoryRecord::new("I prefer dark mode")
            .with_importance(7)
            .with_tag(LayerTag::of(Sublayer::Preference))
            .with_tags(["ui"])
            .with_embedding(vec![0.5, 0.5]);

        let metadata = record.to_metadata().unwrap();
        assert!(!metadata.contains_key("embedding"));
        assert_eq!(metadata.get("layer"), Some(&Value::from("self")));
        assert_eq!(metadata.get("sublayer"), Some(&Value::from("preference")));

        let restored = MemoryRecord::from_metadata(&metadata, vec![0.5, 0.5]).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_content_hash_ignores_whitespace_runs() {
        assert_eq!(content_hash("a  b\n c"), content_hash("a b c"));
        assert_ne!(content_hash("a b"), content_hash("a c"));
    }

    #[test]
    fn test_title_truncation() {
        let long = "x".repeat(200);
        let record = MemoryRecord::new(long);
        assert!(record.title.ends_with("..."));
        assert_eq!(record.title.chars().count(), TITLE_MAX_CHARS);
    }

    #[test]
    fn test_filters_exclude_consolidated() {
        let mut record = MemoryRecord::new("x").with_importance(8);
        let filters = MemoryFilters {
            min_importance: Some(5),
            ..Default::default()
        };
        assert!(filters.matches(&record));

        record.state = RecordState::Consolidated;
        assert!(!filters.matches(&record));
    }

    #[test]
    fn test_provenance_merge() {
        assert_eq!(Provenance::Semantic.merge(Provenance::Semantic), Provenance::Semantic);
        assert_eq!(Provenance::Semantic.merge(Provenance::Structural), Provenance::Both);
    }
}
