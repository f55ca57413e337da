//! Query routing for auto retrieval mode.
//!
//! Relational or question phrasing leans on the graph; similarity phrasing
//! leans on embeddings. Relational cues win when both appear.

use crate::memory::RetrievalMode;
use crate::scoring::RouteWeights;
use regex::Regex;
use std::sync::LazyLock;

static RELATIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(who|whom|whose|which|depends?|depend(s|ed|ing|ency|encies)\s+on|blocks?|blocked|blocking|owns?|owned|relat(ed|es|ion|ionship)|connected|linked|uses?|used by|calls?|part of|belongs?)\b",
    )
    .expect("invalid regex")
});

static SIMILARITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(similar|like|about|resembl(e|es|ing)|reminds?|something like|kind of|sort of)\b")
        .expect("invalid regex")
});

/// Which cue selected the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCue {
    Relational,
    Similarity,
    Balanced,
}

/// Weights for an auto-mode query, and the cue that chose them.
pub fn route(query: &str) -> (RouteWeights, RouteCue) {
    if RELATIONAL.is_match(query) {
        (RouteWeights::RELATIONAL, RouteCue::Relational)
    } else if SIMILARITY.is_match(query) {
        (RouteWeights::SIMILARITY, RouteCue::Similarity)
    } else {
        (RouteWeights::BALANCED, RouteCue::Balanced)
    }
}

/// Weights for any mode; only `Auto` consults the query.
pub fn weights_for(mode: RetrievalMode, query: &str) -> RouteWeights {
    match mode {
        RetrievalMode::Auto => route(query).0,
        other => RouteWeights::for_mode(other),
    }
}
