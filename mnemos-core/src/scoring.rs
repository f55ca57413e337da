//! Temporal decay and hybrid result ranking.
//!
//! Effective importance decays with age and recovers with access:
//!
//! ```text
//! decayed = importance * rate^(age_days / period) * min(1 + boost * access_count, cap)
//! ```
//!
//! `rate` is the record's `decay_rate`, seeded from `decay_base` at ingest.
//!
//! Each retrieval path scores its candidates as `weight * path_score *
//! decayed / 10`; an id reached by both paths keeps the larger score.

use crate::memory::{MemoryId, MemoryRecord, Provenance, RetrievalMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Decay parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub decay_base: f64,
    pub decay_period_days: f64,
    /// Reinforcement gained per access
    pub access_boost: f64,
    /// Upper bound on the reinforcement multiplier
    pub reinforcement_cap: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            decay_base: 0.9,
            decay_period_days: 30.0,
            access_boost: 0.05,
            reinforcement_cap: 2.0,
        }
    }
}

impl ScoringConfig {
    /// Decayed importance for raw inputs. Never negative, never above
    /// `importance * reinforcement_cap`.
    pub fn decay(&self, importance: u8, age_days: f64, access_count: u64) -> f64 {
        self.decay_with_base(self.decay_base, importance, age_days, access_count)
    }

    /// Like [`decay`](Self::decay) with a per-record base in place of
    /// `decay_base`.
    pub fn decay_with_base(
        &self,
        base: f64,
        importance: u8,
        age_days: f64,
        access_count: u64,
    ) -> f64 {
        let age = if age_days.is_finite() { age_days.max(0.0) } else { 0.0 };
        let period = if self.decay_period_days > 0.0 {
            self.decay_period_days
        } else {
            1.0
        };
        let base = if base.is_finite() { base.clamp(0.0, 1.0) } else { 1.0 };
        let temporal = base.powf(age / period);
        let boost = (1.0 + self.access_boost.max(0.0) * access_count as f64)
            .min(self.reinforcement_cap.max(1.0));
        (importance as f64 * temporal * boost).max(0.0)
    }
}

/// Decayed importance of a record at `now`, decaying at the record's own
/// `decay_rate`.
pub fn decayed_importance(record: &MemoryRecord, now: DateTime<Utc>, config: &ScoringConfig) -> f64 {
    config.decay_with_base(
        record.decay_rate,
        record.importance,
        age_days(record.created_at, now),
        record.access_count,
    )
}

/// Fractional days between `since` and `now`, clamped at zero.
pub fn age_days(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - since).num_milliseconds().max(0);
    millis as f64 / 1000.0 / SECONDS_PER_DAY
}

/// Structural score from entity overlap and graph distance.
///
/// `matched` of the query's `query_entities` were reached after `hops`
/// extra edges. Zero when the query named no known entities.
pub fn structural_score(matched: usize, query_entities: usize, hops: u32) -> f32 {
    if query_entities == 0 || matched == 0 {
        return 0.0;
    }
    let overlap = (matched.min(query_entities) as f32) / query_entities as f32;
    overlap * 0.5f32.powi(hops as i32)
}

/// Per-path weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteWeights {
    pub vector: f32,
    pub graph: f32,
}

impl RouteWeights {
    pub const BALANCED: RouteWeights = RouteWeights {
        vector: 0.5,
        graph: 0.5,
    };
    pub const RELATIONAL: RouteWeights = RouteWeights {
        vector: 0.2,
        graph: 0.8,
    };
    pub const SIMILARITY: RouteWeights = RouteWeights {
        vector: 0.8,
        graph: 0.2,
    };

    /// Fixed weights for explicit modes; `Auto` starts balanced and is
    /// refined by [`crate::router::route`].
    pub fn for_mode(mode: RetrievalMode) -> Self {
        match mode {
            RetrievalMode::Semantic => Self {
                vector: 1.0,
                graph: 0.0,
            },
            RetrievalMode::Structured => Self {
                vector: 0.0,
                graph: 1.0,
            },
            RetrievalMode::Hybrid | RetrievalMode::Auto => Self::BALANCED,
        }
    }

    pub fn uses_vector(&self) -> bool {
        self.vector > 0.0
    }

    pub fn uses_graph(&self) -> bool {
        self.graph > 0.0
    }
}

/// A record reached by one retrieval path.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: MemoryRecord,
    /// Path score in `[0, 1]`
    pub score: f32,
}

impl Candidate {
    pub fn new(record: MemoryRecord, score: f32) -> Self {
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
        Self { record, score }
    }
}

/// A ranked retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f64,
    pub semantic_score: Option<f32>,
    pub structural_score: Option<f32>,
    pub decayed_importance: f64,
    pub provenance: Provenance,
}

/// Merge both paths' candidates into one ranking.
///
/// Each id appears once. Its score is the max of its per-path scores and
/// its provenance is `Both` when both paths found it. Ties break on most
/// recent access, then importance, then id.
pub fn merge_and_rank(
    vector: Vec<Candidate>,
    graph: Vec<Candidate>,
    weights: RouteWeights,
    now: DateTime<Utc>,
    config: &ScoringConfig,
    limit: usize,
) -> Vec<ScoredMemory> {
    let mut merged: HashMap<MemoryId, ScoredMemory> = HashMap::new();

    let paths = [
        (vector, weights.vector, Provenance::Semantic),
        (graph, weights.graph, Provenance::Structural),
    ];
    for (candidates, weight, provenance) in paths {
        for candidate in candidates {
            let decayed = decayed_importance(&candidate.record, now, config);
            let score = weight as f64 * candidate.score as f64 * decayed / 10.0;
            let path_score = Some(candidate.score);

            match merged.get_mut(&candidate.record.id) {
                Some(existing) => {
                    existing.provenance = existing.provenance.merge(provenance);
                    existing.score = existing.score.max(score);
                    let slot = match provenance {
                        Provenance::Structural => &mut existing.structural_score,
                        _ => &mut existing.semantic_score,
                    };
                    *slot = max_option(*slot, path_score);
                }
                None => {
                    let (semantic_score, structural_score) = match provenance {
                        Provenance::Structural => (None, path_score),
                        _ => (path_score, None),
                    };
                    merged.insert(
                        candidate.record.id.clone(),
                        ScoredMemory {
                            record: candidate.record,
                            score,
                            semantic_score,
                            structural_score,
                            decayed_importance: decayed,
                            provenance,
                        },
                    );
                }
            }
        }
    }

    let mut ranked: Vec<ScoredMemory> = merged.into_values().collect();
    ranked.sort_by(compare_ranked);
    ranked.truncate(limit);
    ranked
}

fn max_option(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn compare_ranked(a: &ScoredMemory, b: &ScoredMemory) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
        .then_with(|| b.record.importance.cmp(&a.record.importance))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decay_formula() {
        let config = ScoringConfig::default();
        assert!((config.decay(7, 0.0, 0) - 7.0).abs() < 1e-9);
        assert!((config.decay(10, 30.0, 0) - 9.0).abs() < 1e-9);
        assert!((config.decay(10, 60.0, 0) - 8.1).abs() < 1e-9);
        assert!((config.decay(10, 0.0, 10) - 15.0).abs() < 1e-9);
        // capped at 2x
        assert!((config.decay(10, 0.0, 1000) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_degenerate_inputs() {
        let config = ScoringConfig::default();
        assert!((config.decay(5, -3.0, 0) - 5.0).abs() < 1e-9);
        assert!((config.decay(5, f64::NAN, 0) - 5.0).abs() < 1e-9);
        assert!(config.decay(5, f64::MAX, u64::MAX) >= 0.0);
    }

    #[test]
    fn test_decayed_importance_uses_record_age() {
        let now = Utc::now();
        let record = MemoryRecord::new("old")
            .with_importance(10)
            .with_created_at(now - Duration::days(30));
        let config = ScoringConfig::default();
        assert!((decayed_importance(&record, now, &config) - 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_decayed_importance_uses_record_rate() {
        let now = Utc::now();
        let month_old = |rate: f64| {
            MemoryRecord::new("old")
                .with_importance(10)
                .with_created_at(now - Duration::days(30))
                .with_decay_rate(rate)
        };
        let config = ScoringConfig::default();

        let slow = decayed_importance(&month_old(0.99), now, &config);
        let fast = decayed_importance(&month_old(0.5), now, &config);
        assert!((slow - 9.9).abs() < 1e-6, "{}", slow);
        assert!((fast - 5.0).abs() < 1e-6, "{}", fast);
    }

    #[test]
    fn test_structural_score() {
        assert_eq!(structural_score(0, 3, 0), 0.0);
        assert_eq!(structural_score(2, 0, 0), 0.0);
        assert_eq!(structural_score(1, 2, 0), 0.5);
        assert_eq!(structural_score(2, 2, 1), 0.5);
        assert_eq!(structural_score(5, 2, 0), 1.0);
    }

    #[test]
    fn test_route_weights_for_mode() {
        assert_eq!(RouteWeights::for_mode(RetrievalMode::Semantic).graph, 0.0);
        assert!(!RouteWeights::for_mode(RetrievalMode::Structured).uses_vector());
        assert_eq!(RouteWeights::for_mode(RetrievalMode::Hybrid), RouteWeights::BALANCED);
    }

    #[test]
    fn test_merge_keeps_max_and_marks_both() {
        let now = Utc::now();
        let shared = MemoryRecord::new("shared").with_importance(10);
        let only_vec = MemoryRecord::new("vec only").with_importance(10);
        let config = ScoringConfig::default();

        let ranked = merge_and_rank(
            vec![
                Candidate::new(shared.clone(), 0.4),
                Candidate::new(only_vec.clone(), 0.6),
            ],
            vec![Candidate::new(shared.clone(), 0.9)],
            RouteWeights::BALANCED,
            now,
            &config,
            10,
        );

        assert_eq!(ranked.len(), 2);
        let hit = ranked.iter().find(|m| m.record.id == shared.id).unwrap();
        assert_eq!(hit.provenance, Provenance::Both);
        assert!((hit.score - 0.45).abs() < 1e-6);
        assert_eq!(hit.semantic_score, Some(0.4));
        assert_eq!(hit.structural_score, Some(0.9));
        assert_eq!(ranked[0].record.id, shared.id);
    }

    #[test]
    fn test_tie_breaks() {
        let now = Utc::now();
        let config = ScoringConfig::default();
        let mut older = MemoryRecord::new("older").with_importance(5);
        let mut newer = MemoryRecord::new("newer").with_importance(5);
        older.last_accessed_at = now - Duration::hours(2);
        newer.last_accessed_at = now - Duration::hours(1);
        older.created_at = now;
        newer.created_at = now;

        let ranked = merge_and_rank(
            vec![Candidate::new(older.clone(), 0.5), Candidate::new(newer.clone(), 0.5)],
            vec![],
            RouteWeights::for_mode(RetrievalMode::Semantic),
            now,
            &config,
            10,
        );
        assert_eq!(ranked[0].record.id, newer.id);

        // importance breaks a recency tie only when scores are equal
        let mut low = MemoryRecord::new("low").with_importance(4);
        let mut high = MemoryRecord::new("high").with_importance(8);
        low.created_at = now;
        high.created_at = now;
        low.last_accessed_at = now;
        high.last_accessed_at = now;
        let ranked = merge_and_rank(
            vec![Candidate::new(low.clone(), 1.0), Candidate::new(high.clone(), 0.5)],
            vec![],
            RouteWeights::for_mode(RetrievalMode::Semantic),
            now,
            &config,
            10,
        );
        assert_eq!(ranked[0].record.id, high.id);
        assert_eq!(ranked[1].record.id, low.id);
    }

    #[test]
    fn test_limit_and_zero_weight_path() {
        let now = Utc::now();
        let config = ScoringConfig::default();
        let records: Vec<_> = (0..5).map(|i| MemoryRecord::new(format!("m{}", i))).collect();
        let ranked = merge_and_rank(
            records.iter().cloned().map(|r| Candidate::new(r, 0.7)).collect(),
            vec![],
            RouteWeights::for_mode(RetrievalMode::Structured),
            now,
            &config,
            3,
        );
        assert_eq!(ranked.len(), 3);
        assert!(ranked.iter().all(|m| m.score == 0.0));
    }
}
