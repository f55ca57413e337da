//! Consolidation planning.
//!
//! Near-duplicate low-importance records that slipped past ingestion dedup
//! (different phrasing, same meaning) are grouped around a canonical
//! survivor. Planning is pure; the engine applies a plan only under an
//! explicit force flag and inside the write lease.

use crate::config::ConsolidationConfig;
use crate::memory::{cosine_similarity, MemoryId, MemoryRecord, RecordState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Records folded into one canonical survivor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationGroup {
    pub canonical: MemoryId,
    pub merged: Vec<MemoryId>,
    /// Lowest similarity between the canonical record and a merged one
    pub min_similarity: f32,
}

/// Outcome of a consolidation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub dry_run: bool,
    /// Live records considered
    pub scanned: usize,
    pub groups: Vec<ConsolidationGroup>,
    /// Records moved to the consolidated state
    pub merged_records: usize,
    /// Other records whose links were pointed at a survivor
    pub relinked_records: usize,
    /// Live records without a graph node
    pub missing_graph_nodes: usize,
    /// Graph nodes recreated (zero on a dry run)
    pub repaired_graph_nodes: usize,
}

/// Group eligible records by similarity to a canonical record.
///
/// Eligible records are live, unconflicted, embedded and at or below the
/// importance ceiling. Canonical records are chosen greedily by importance,
/// then access count, then age, then id.
pub fn plan(records: &[MemoryRecord], config: &ConsolidationConfig) -> Vec<ConsolidationGroup> {
    let mut eligible: Vec<&MemoryRecord> = records
        .iter()
        .filter(|r| {
            r.state != RecordState::Consolidated
                && r.importance <= config.max_importance
                && !r.has_conflicts()
                && !r.embedding.is_empty()
        })
        .collect();

    eligible.sort_by(|a, b| {
        b.importance
            .cmp(&a.importance)
            .then_with(|| b.access_count.cmp(&a.access_count))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut assigned = vec![false; eligible.len()];
    let mut groups = Vec::new();

    for i in 0..eligible.len() {
        if assigned[i] {
            continue;
        }
        let canonical = eligible[i];
        let mut merged = Vec::new();
        let mut min_similarity = 1.0f32;

        for j in (i + 1)..eligible.len() {
            if assigned[j] {
                continue;
            }
            let similarity = cosine_similarity(&canonical.embedding, &eligible[j].embedding);
            if similarity >= config.similarity_threshold {
                assigned[j] = true;
                merged.push(eligible[j].id.clone());
                min_similarity = min_similarity.min(similarity);
            }
        }

        if !merged.is_empty() {
            assigned[i] = true;
            groups.push(ConsolidationGroup {
                canonical: canonical.id.clone(),
                merged,
                min_similarity,
            });
        }
    }

    groups
}

/// Fold `members` into `canonical` and leave forwarding pointers behind.
pub fn merge_group(canonical: &mut MemoryRecord, members: &mut [MemoryRecord], now: DateTime<Utc>) {
    let group_ids: BTreeSet<MemoryId> = members.iter().map(|m| m.id.clone()).collect();

    for member in members.iter_mut() {
        canonical.tags.extend(member.tags.iter().cloned());
        canonical.access_count = canonical.access_count.saturating_add(member.access_count);
        canonical.importance = canonical.importance.max(member.importance);
        canonical.reinforcement_factor = canonical
            .reinforcement_factor
            .max(member.reinforcement_factor);
        canonical
            .related_memory_ids
            .extend(member.related_memory_ids.iter().cloned());
        if member.last_accessed_at > canonical.last_accessed_at {
            canonical.last_accessed_at = member.last_accessed_at;
        }
        if canonical.domain.is_none() {
            canonical.domain = member.domain.clone();
        }
        if canonical.category.is_none() {
            canonical.category = member.category.clone();
        }

        member.state = RecordState::Consolidated;
        member.consolidated_into = Some(canonical.id.clone());
        if now > member.last_accessed_at {
            member.last_accessed_at = now;
        }
    }

    canonical.related_memory_ids.retain(|id| !group_ids.contains(id));
    canonical.related_memory_ids.remove(&canonical.id);
}

/// Point links at survivors. Returns whether anything changed.
pub fn relink(record: &mut MemoryRecord, forwarding: &HashMap<MemoryId, MemoryId>) -> bool {
    let own_id = record.id.clone();
    let rewrite = |ids: &mut BTreeSet<MemoryId>| {
        let mut changed = false;
        let stale: Vec<MemoryId> = ids
            .iter()
            .filter(|id| forwarding.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            ids.remove(&id);
            if let Some(target) = forwarding.get(&id) {
                if *target != own_id {
                    ids.insert(target.clone());
                }
            }
            changed = true;
        }
        changed
    };

    let related = rewrite(&mut record.related_memory_ids);
    let conflicts = rewrite(&mut record.conflict_ids);
    let supersedes = match record.supersedes_id.as_ref().and_then(|id| forwarding.get(id)) {
        Some(target) => {
            record.supersedes_id = Some(target.clone());
            true
        }
        None => false,
    };
    related || conflicts || supersedes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HashingEmbedder;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn embedded(content: &str, importance: u8) -> MemoryRecord {
        let embedder = HashingEmbedder::default();
        MemoryRecord::new(content)
            .with_importance(importance)
            .with_embedding(embedder.embed_sync(content))
    }

    #[test]
    fn test_plan_groups_near_duplicates() {
        let now = Utc::now();
        let a = embedded("Restart the dev server after editing env files", 3)
            .with_created_at(now - Duration::days(2));
        let b = embedded("Restart the dev server after editing the env files", 3);
        let c = embedded("Payment retries use exponential backoff", 3);

        let groups = plan(&[b.clone(), a.clone(), c], &ConsolidationConfig::default());
        assert_eq!(groups.len(), 1);
        // older record wins at equal importance and access
        assert_eq!(groups[0].canonical, a.id);
        assert_eq!(groups[0].merged, vec![b.id]);
        assert!(groups[0].min_similarity >= 0.9);
    }

    #[test]
    fn test_plan_skips_ineligible_records() {
        let config = ConsolidationConfig::default();
        let important = embedded("Deploy with blue green switching", 9);
        let twin = embedded("Deploy with blue green switching", 9);
        assert!(plan(&[important, twin], &config).is_empty());

        let mut conflicted = embedded("Tabs over spaces", 2);
        conflicted.conflict_ids.insert(MemoryId::from("other"));
        let twin = embedded("Tabs over spaces", 2);
        assert!(plan(&[conflicted, twin], &config).is_empty());

        let mut gone = embedded("Use the staging cluster", 2);
        gone.state = RecordState::Consolidated;
        let twin = embedded("Use the staging cluster", 2);
        assert!(plan(&[gone, twin], &config).is_empty());
    }

    #[test]
    fn test_merge_group_leaves_forwarding_pointers() {
        let now = Utc::now();
        let mut canonical = embedded("a", 3).with_tags(["x"]);
        canonical.access_count = 2;
        let mut member = embedded("a again", 4).with_tags(["y"]);
        member.access_count = 3;
        member.related_memory_ids.insert(canonical.id.clone());
        member.related_memory_ids.insert(MemoryId::from("elsewhere"));

        let mut members = vec![member];
        merge_group(&mut canonical, &mut members, now);

        assert_eq!(canonical.access_count, 5);
        assert_eq!(canonical.importance, 4);
        assert!(canonical.tags.contains("x") && canonical.tags.contains("y"));
        assert!(canonical.related_memory_ids.contains(&MemoryId::from("elsewhere")));
        assert!(!canonical.related_memory_ids.contains(&canonical.id));

        assert_eq!(members[0].state, RecordState::Consolidated);
        assert_eq!(members[0].consolidated_into, Some(canonical.id.clone()));
    }

    #[test]
    fn test_relink() {
        let forwarding: HashMap<MemoryId, MemoryId> =
            [(MemoryId::from("old"), MemoryId::from("new"))].into_iter().collect();

        let mut record = MemoryRecord::new("links");
        record.related_memory_ids.insert(MemoryId::from("old"));
        record.conflict_ids.insert(MemoryId::from("keep"));
        record.supersedes_id = Some(MemoryId::from("old"));
        assert!(relink(&mut record, &forwarding));
        assert!(record.related_memory_ids.contains(&MemoryId::from("new")));
        assert!(!record.related_memory_ids.contains(&MemoryId::from("old")));
        assert!(record.conflict_ids.contains(&MemoryId::from("keep")));
        assert_eq!(record.supersedes_id, Some(MemoryId::from("new")));

        let mut untouched = MemoryRecord::new("none");
        assert!(!relink(&mut untouched, &forwarding));

        // a survivor never links to itself
        let mut survivor = MemoryRecord::new("survivor");
        survivor.id = MemoryId::from("new");
        survivor.related_memory_ids.insert(MemoryId::from("old"));
        assert!(relink(&mut survivor, &forwarding));
        assert!(survivor.related_memory_ids.is_empty());
    }
}
