//! Property-based tests for the pure ranking, dedup and classification
//! stages.
//!
//! - Decayed importance never grows with age, never shrinks with access,
//!   and stays under the reinforcement cap
//! - Hybrid merge returns each id once with the max of its path scores
//! - Every input classifies into exactly one valid layer tag
//! - Identical content is always redundant

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    use crate::classifier::{Classify, RuleClassifier};
    use crate::dedup::{DedupConfig, DedupDecision, DedupEngine, Neighbor};
    use crate::memory::{LayerTag, MemoryId, MemoryRecord, RetrievalMode};
    use crate::router;
    use crate::scoring::{
        decayed_importance, merge_and_rank, structural_score, Candidate, RouteWeights,
        ScoringConfig,
    };
    use chrono::Utc;

    fn importance() -> impl Strategy<Value = u8> {
        1u8..=10u8
    }

    fn age_days() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(30.0), 0.0f64..3650.0]
    }

    fn mode() -> impl Strategy<Value = RetrievalMode> {
        prop_oneof![
            Just(RetrievalMode::Semantic),
            Just(RetrievalMode::Structured),
            Just(RetrievalMode::Hybrid),
            Just(RetrievalMode::Auto),
        ]
    }

    // =========================================================================
    // Decay
    // =========================================================================

    proptest! {
        #[test]
        fn decay_is_non_increasing_in_age(
            imp in importance(),
            a in age_days(),
            b in age_days(),
            access in 0u64..500
        ) {
            let config = ScoringConfig::default();
            let (young, old) = if a <= b { (a, b) } else { (b, a) };
            let fresh = config.decay(imp, young, access);
            let stale = config.decay(imp, old, access);
            prop_assert!(stale <= fresh + 1e-9, "{} aged {} > {} aged {}", stale, old, fresh, young);
        }

        #[test]
        fn decay_is_non_decreasing_in_access(
            imp in importance(),
            age in age_days(),
            a in 0u64..1000,
            b in 0u64..1000
        ) {
            let config = ScoringConfig::default();
            let (few, many) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(config.decay(imp, age, few) <= config.decay(imp, age, many) + 1e-9);
        }

        #[test]
        fn decay_is_bounded_by_cap(
            imp in importance(),
            age in age_days(),
            access in 0u64..u64::MAX
        ) {
            let config = ScoringConfig::default();
            let decayed = config.decay(imp, age, access);
            prop_assert!(decayed >= 0.0);
            prop_assert!(decayed <= imp as f64 * config.reinforcement_cap + 1e-9);
        }

        #[test]
        fn structural_score_is_a_unit_value(
            matched in 0usize..20,
            total in 0usize..20,
            hops in 0u32..5
        ) {
            let score = structural_score(matched, total, hops);
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }

    // =========================================================================
    // Hybrid merge
    // =========================================================================

    proptest! {
        #[test]
        fn merge_keeps_each_id_once_with_max_score(
            vector in prop::collection::vec((0usize..8, 0.0f32..1.0, importance()), 0..12),
            graph in prop::collection::vec((0usize..8, 0.0f32..1.0, importance()), 0..12),
            mode in mode()
        ) {
            let now = Utc::now();
            let config = ScoringConfig::default();
            let weights = RouteWeights::for_mode(mode);

            // one record per id slot so both paths see the same record
            let mut records: HashMap<usize, MemoryRecord> = HashMap::new();
            for (slot, _, imp) in vector.iter().chain(graph.iter()) {
                records.entry(*slot).or_insert_with(|| {
                    let mut record = MemoryRecord::new(format!("record {}", slot)).with_importance(*imp);
                    record.id = MemoryId::from(format!("id-{}", slot));
                    record
                });
            }

            let mut expected: HashMap<MemoryId, f64> = HashMap::new();
            let mut to_candidates = |hits: &[(usize, f32, u8)], weight: f32| -> Vec<Candidate> {
                hits.iter()
                    .map(|(slot, score, _)| {
                        let record = records[slot].clone();
                        let decayed = decayed_importance(&record, now, &config);
                        let path_score = weight as f64 * *score as f64 * decayed / 10.0;
                        let best = expected.entry(record.id.clone()).or_insert(f64::MIN);
                        *best = best.max(path_score);
                        Candidate::new(record, *score)
                    })
                    .collect()
            };
            let vector_candidates = to_candidates(&vector, weights.vector);
            let graph_candidates = to_candidates(&graph, weights.graph);

            let ranked = merge_and_rank(
                vector_candidates,
                graph_candidates,
                weights,
                now,
                &config,
                usize::MAX,
            );

            let ids: HashSet<&MemoryId> = ranked.iter().map(|m| &m.record.id).collect();
            prop_assert_eq!(ids.len(), ranked.len());
            prop_assert_eq!(ranked.len(), expected.len());
            for hit in &ranked {
                let want = expected[&hit.record.id];
                prop_assert!((hit.score - want).abs() < 1e-9, "{} != {}", hit.score, want);
            }
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }

        #[test]
        fn route_weights_sum_to_one(query in ".{0,80}", mode in mode()) {
            let weights = router::weights_for(mode, &query);
            prop_assert!((weights.vector + weights.graph - 1.0).abs() < 1e-6);
        }
    }

    // =========================================================================
    // Classification and dedup
    // =========================================================================

    proptest! {
        #[test]
        fn every_input_gets_a_valid_tag(content in ".{0,200}") {
            let classification = RuleClassifier::new().classify(&content);
            prop_assert!(LayerTag::all().contains(&classification.tag));
            prop_assert_eq!(classification.tag.sublayer.layer(), classification.tag.layer);
        }

        #[test]
        fn keywordless_input_falls_back(content in "[0-9 .,#]{0,60}") {
            let classification = RuleClassifier::new().classify(&content);
            prop_assert!(classification.is_fallback());
            prop_assert_eq!(classification.tag, LayerTag::fallback());
        }

        #[test]
        fn identical_content_is_redundant(
            content in "[a-zA-Z ]{1,80}",
            similarity in 0.0f32..1.0
        ) {
            let engine = DedupEngine::new(DedupConfig::default());
            let existing = MemoryRecord::new(content.clone());
            let candidate = MemoryRecord::new(content);
            let neighbors = [Neighbor { record: existing.clone(), similarity }];

            let outcome = engine.decide(&candidate, &neighbors, false);
            prop_assert_eq!(outcome.decision, DedupDecision::Redundant);
            prop_assert_eq!(outcome.best_match, Some(existing.id));
        }
    }
}
