//! Engine configuration.
//!
//! Every threshold is configuration with documented defaults. Values can be
//! overridden from `MNEMOS_*` environment variables.

use crate::dedup::DedupConfig;
use crate::error::{Error, Result};
use crate::lock::{duration_millis, LeaseConfig};
use crate::scoring::ScoringConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retrieval limits and per-store timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Results returned when the caller gives no limit
    pub default_limit: usize,
    /// Candidates fetched per path before merging
    pub candidate_pool: usize,
    /// Bump access counts of returned records
    pub reinforce_on_access: bool,
    /// Memories returned by context assembly
    pub context_recent: usize,
    /// Minimum importance of standing self-layer memories in context
    pub context_min_importance: u8,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            candidate_pool: 50,
            reinforce_on_access: true,
            context_recent: 10,
            context_min_importance: 7,
        }
    }
}

/// Consolidation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub similarity_threshold: f32,
    /// Only records at or below this importance are merged
    pub max_importance: u8,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            max_importance: 5,
        }
    }
}

/// Top-level configuration for [`crate::MemoryEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub timeouts: StoreTimeouts,
}

/// Bounds on external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreTimeouts {
    #[serde(with = "duration_millis")]
    pub store_call: Duration,
    #[serde(with = "duration_millis")]
    pub embed_call: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            store_call: Duration::from_secs(10),
            embed_call: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MNEMOS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_f32 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<f32>().ok());
        let parse_f64 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<f64>().ok());
        let parse_u64 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let parse_bool = |key: &str| {
            lookup(key).map(|s| s != "0" && s.to_lowercase() != "false")
        };

        let mut config = Self::default();

        if let Some(v) = parse_f32("MNEMOS_RELATED_THRESHOLD") {
            config.dedup.related_threshold = v;
        }
        if let Some(v) = parse_f32("MNEMOS_REDUNDANT_THRESHOLD") {
            config.dedup.redundant_threshold = v;
        }
        if let Some(v) = parse_u64("MNEMOS_DEDUP_TOP_K") {
            config.dedup.top_k = v as usize;
        }
        if let Some(v) = parse_bool("MNEMOS_DETECT_POLARITY") {
            config.dedup.detect_polarity = v;
        }
        if let Some(v) = parse_f32("MNEMOS_CONSOLIDATION_THRESHOLD") {
            config.consolidation.similarity_threshold = v;
        }
        if let Some(v) = parse_f64("MNEMOS_DECAY_BASE") {
            config.scoring.decay_base = v;
        }
        if let Some(v) = parse_f64("MNEMOS_DECAY_PERIOD_DAYS") {
            config.scoring.decay_period_days = v;
        }
        if let Some(v) = parse_f64("MNEMOS_REINFORCEMENT_CAP") {
            config.scoring.reinforcement_cap = v;
        }
        if let Some(v) = parse_u64("MNEMOS_LEASE_STALE_MS") {
            config.lease.stale_after = Duration::from_millis(v);
        }
        if let Some(v) = parse_u64("MNEMOS_LEASE_TIMEOUT_MS") {
            config.lease.acquire_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_u64("MNEMOS_STORE_TIMEOUT_MS") {
            config.timeouts.store_call = Duration::from_millis(v);
        }
        if let Some(v) = parse_u64("MNEMOS_EMBED_TIMEOUT_MS") {
            config.timeouts.embed_call = Duration::from_millis(v);
        }
        if let Some(v) = parse_bool("MNEMOS_REINFORCE_ON_ACCESS") {
            config.retrieval.reinforce_on_access = v;
        }

        config
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Config(format!("{} = {} outside [0, 1]", name, v)))
            }
        };
        unit("related_threshold", self.dedup.related_threshold)?;
        unit("redundant_threshold", self.dedup.redundant_threshold)?;
        unit(
            "consolidation.similarity_threshold",
            self.consolidation.similarity_threshold,
        )?;

        if self.dedup.related_threshold >= self.dedup.redundant_threshold {
            return Err(Error::Config(format!(
                "related_threshold ({}) must be below redundant_threshold ({})",
                self.dedup.related_threshold, self.dedup.redundant_threshold
            )));
        }
        if self.dedup.top_k == 0 {
            return Err(Error::Config("dedup.top_k must be positive".into()));
        }
        if !(self.scoring.decay_base > 0.0 && self.scoring.decay_base <= 1.0) {
            return Err(Error::Config(format!(
                "decay_base = {} outside (0, 1]",
                self.scoring.decay_base
            )));
        }
        if self.scoring.decay_period_days <= 0.0 {
            return Err(Error::Config("decay_period_days must be positive".into()));
        }
        if self.scoring.reinforcement_cap < 1.0 {
            return Err(Error::Config("reinforcement_cap must be at least 1.0".into()));
        }
        if self.lease.stale_after.is_zero() {
            return Err(Error::Config("lease.stale_after must be positive".into()));
        }
        if self.lease.initial_backoff > self.lease.max_backoff {
            return Err(Error::Config(
                "lease.initial_backoff exceeds lease.max_backoff".into(),
            ));
        }
        if self.timeouts.store_call.is_zero() || self.timeouts.embed_call.is_zero() {
            return Err(Error::Config("store timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.dedup.related_threshold, 0.6);
        assert_eq!(config.dedup.redundant_threshold, 0.85);
        assert_eq!(config.consolidation.similarity_threshold, 0.9);
        assert_eq!(config.scoring.decay_base, 0.9);
        assert_eq!(config.scoring.reinforcement_cap, 2.0);
        assert_eq!(config.lease.stale_after, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MNEMOS_REDUNDANT_THRESHOLD", "0.9"),
            ("MNEMOS_LEASE_STALE_MS", "1500"),
            ("MNEMOS_REINFORCE_ON_ACCESS", "false"),
            ("MNEMOS_DECAY_BASE", "not-a-number"),
        ]));
        assert_eq!(config.dedup.redundant_threshold, 0.9);
        assert_eq!(config.lease.stale_after, Duration::from_millis(1500));
        assert!(!config.retrieval.reinforce_on_access);
        // unparsable values keep the default
        assert_eq!(config.scoring.decay_base, 0.9);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = EngineConfig::default();
        config.dedup.related_threshold = 0.9;
        config.dedup.redundant_threshold = 0.8;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.dedup.redundant_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scoring.decay_base = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip_uses_millis() {
        let config = EngineConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease"]["stale_after"], 30_000);
        assert_eq!(json["timeouts"]["store_call"], 10_000);

        let partial: EngineConfig = serde_json::from_str(r#"{"dedup": {"top_k": 3, "related_threshold": 0.5, "redundant_threshold": 0.8, "reinforcement_step": 0.2, "detect_polarity": false}}"#).unwrap();
        assert_eq!(partial.dedup.top_k, 3);
        assert_eq!(partial.scoring, ScoringConfig::default());
    }
}
