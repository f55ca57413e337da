//! Near-duplicate and contradiction detection for incoming memories.
//!
//! The engine compares a candidate against its nearest stored neighbors and
//! decides whether it is new, redundant with an existing record, related to
//! one, or contradicts one. Decisions are pure; the orchestrator applies them
//! under the write lease.

use crate::classifier::normalize;
use crate::memory::{MemoryId, MemoryRecord};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Thresholds and knobs for deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Neighbors fetched from the vector index per candidate
    pub top_k: usize,
    /// At or above this similarity the candidate is linked as related
    pub related_threshold: f32,
    /// At or above this similarity the candidate is folded into its match
    pub redundant_threshold: f32,
    /// Added to the survivor's reinforcement factor on a redundant hit
    pub reinforcement_step: f64,
    /// Run the contradiction detector on related-or-closer neighbors
    pub detect_polarity: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            related_threshold: 0.6,
            redundant_threshold: 0.85,
            reinforcement_step: 0.1,
            detect_polarity: true,
        }
    }
}

/// What ingestion does with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupDecision {
    New,
    Redundant,
    Related,
    Contradictory,
}

impl DedupDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Redundant => "redundant",
            Self::Related => "related",
            Self::Contradictory => "contradictory",
        }
    }

    /// Whether the candidate becomes a record of its own.
    pub fn creates_record(&self) -> bool {
        !matches!(self, Self::Redundant)
    }
}

impl fmt::Display for DedupDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored record near the candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub record: MemoryRecord,
    pub similarity: f32,
}

/// Decision plus the neighbor it was made against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupOutcome {
    pub decision: DedupDecision,
    pub best_match: Option<MemoryId>,
    pub similarity: f32,
}

impl DedupOutcome {
    fn new_record(similarity: f32) -> Self {
        Self {
            decision: DedupDecision::New,
            best_match: None,
            similarity,
        }
    }
}

/// Judges whether two statements contradict each other.
///
/// Fuzzy or model-backed judges implement this; the deterministic
/// [`NegationPolarityDetector`] is the default.
pub trait ContradictionDetector: Send + Sync {
    fn contradicts(&self, candidate: &str, existing: &str) -> bool;
}

static NEGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(not|no|never|none|nothing|neither|nor|don't|doesn't|didn't|isn't|aren't|wasn't|weren't|can't|cannot|won't|wouldn't|shouldn't|mustn't|hate|dislike)\b",
    )
    .expect("invalid regex")
});

/// Flags statements whose negation counts differ in parity.
///
/// "I like tabs" vs "I don't like tabs" contradicts; "never use X" vs
/// "never ever use X" does not.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegationPolarityDetector;

impl NegationPolarityDetector {
    /// True when the text reads as negated.
    pub fn is_negated(text: &str) -> bool {
        NEGATION.find_iter(&normalize(text)).count() % 2 == 1
    }
}

impl ContradictionDetector for NegationPolarityDetector {
    fn contradicts(&self, candidate: &str, existing: &str) -> bool {
        Self::is_negated(candidate) != Self::is_negated(existing)
    }
}

/// Applies thresholds and contradiction checks to neighbor sets.
#[derive(Clone)]
pub struct DedupEngine {
    config: DedupConfig,
    detector: Arc<dyn ContradictionDetector>,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            detector: Arc::new(NegationPolarityDetector),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ContradictionDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Decide how to ingest `candidate` given its neighbors.
    ///
    /// An exact content-hash match is always redundant. Otherwise the
    /// caller's `contradicts` flag wins over similarity thresholds.
    pub fn decide(
        &self,
        candidate: &MemoryRecord,
        neighbors: &[Neighbor],
        contradicts: bool,
    ) -> DedupOutcome {
        let live = || neighbors.iter().filter(|n| !n.record.is_consolidated());

        if let Some(exact) = live().find(|n| n.record.content_hash == candidate.content_hash) {
            return DedupOutcome {
                decision: DedupDecision::Redundant,
                best_match: Some(exact.record.id.clone()),
                similarity: 1.0,
            };
        }

        let best = live().fold(None::<&Neighbor>, |best, n| match best {
            Some(b)
                if b.similarity > n.similarity
                    || (b.similarity == n.similarity && b.record.id <= n.record.id) =>
            {
                Some(b)
            }
            _ => Some(n),
        });

        let Some(best) = best else {
            return DedupOutcome::new_record(0.0);
        };
        let similarity = best.similarity;
        let outcome = |decision| DedupOutcome {
            decision,
            best_match: Some(best.record.id.clone()),
            similarity,
        };

        if contradicts {
            return outcome(DedupDecision::Contradictory);
        }
        if similarity < self.config.related_threshold {
            return DedupOutcome::new_record(similarity);
        }
        if self.config.detect_polarity
            && self
                .detector
                .contradicts(&candidate.content, &best.record.content)
        {
            return outcome(DedupDecision::Contradictory);
        }
        if similarity >= self.config.redundant_threshold {
            outcome(DedupDecision::Redundant)
        } else {
            outcome(DedupDecision::Related)
        }
    }
}

impl fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Fold a redundant candidate into the record it duplicates.
pub fn apply_reinforcement(
    existing: &mut MemoryRecord,
    new_tags: &BTreeSet<String>,
    step: f64,
    now: DateTime<Utc>,
) {
    existing.touch(now);
    existing.reinforcement_factor += step.max(0.0);
    existing.tags.extend(new_tags.iter().cloned());
}

/// Bidirectional related link.
pub fn link_related(a: &mut MemoryRecord, b: &mut MemoryRecord) {
    if a.id == b.id {
        return;
    }
    a.related_memory_ids.insert(b.id.clone());
    b.related_memory_ids.insert(a.id.clone());
}

/// Bidirectional conflict marker. Neither side is removed.
pub fn mark_conflict(a: &mut MemoryRecord, b: &mut MemoryRecord) {
    if a.id == b.id {
        return;
    }
    a.conflict_ids.insert(b.id.clone());
    b.conflict_ids.insert(a.id.clone());
}

/// Clear the conflict between two records.
pub fn clear_conflict(a: &mut MemoryRecord, b: &mut MemoryRecord) {
    a.conflict_ids.remove(&b.id);
    b.conflict_ids.remove(&a.id);
}
