//! Layer/sublayer classification of memory content.
//!
//! An ordered table of regex rules over normalized (lowercased) text; the
//! first matching rule wins and unmatched content falls back to
//! `world/fact`. Classification never fails.

use crate::memory::{LayerTag, Sublayer};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Result of classifying a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub tag: LayerTag,
    /// Name of the rule that matched; `None` for the fallback
    pub rule: Option<&'static str>,
}

impl Classification {
    pub fn fallback() -> Self {
        Self {
            tag: LayerTag::fallback(),
            rule: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.rule.is_none()
    }
}

/// Anything that can tag content with a layer.
///
/// Alternative implementations (for example a model-backed judge) plug in
/// here; [`RuleClassifier`] is the deterministic default.
pub trait Classify: Send + Sync {
    fn classify(&self, content: &str) -> Classification;
}

struct Rule {
    name: &'static str,
    sublayer: Sublayer,
    pattern: Regex,
}

fn rule(name: &'static str, sublayer: Sublayer, pattern: &str) -> Rule {
    Rule {
        name,
        sublayer,
        pattern: Regex::new(pattern).expect("invalid regex"),
    }
}

// Order matters: first match wins.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            "self.identity",
            Sublayer::Identity,
            r"\b((i am|i'm) (a|an|the)|my name is|call me|i work (as|at|for|on)|my (role|job|title|background) is|i live in|i was born)\b",
        ),
        rule(
            "self.preference",
            Sublayer::Preference,
            r"\b(i prefer|i'd prefer|i like|i love|i enjoy|i hate|i dislike|my favou?rite|i'd rather|i would rather)\b",
        ),
        rule(
            "self.constraint",
            Sublayer::Constraint,
            r"\b(i can't|i cannot|i can not|i'm unable|i am unable|i'm not allowed|i am not allowed|i don't have access|i have no access|allergic|my budget|limited to|restricted to)\b",
        ),
        rule(
            "world.fact",
            Sublayer::Fact,
            r"(\bfact:|\b(is defined as|stands for|consists of|is located|was founded|was released|is written in|is built (on|with)|according to)\b)",
        ),
        rule(
            "world.failure",
            Sublayer::Failure,
            r"\b(fail(s|ed|ing|ure|ures)?|errors?|crash(es|ed|ing)?|bugs?|broken|breaks|exceptions?|panic(s|ked)?|doesn't work|does not work|didn't work|timed out|regression)\b",
        ),
        rule(
            "world.method",
            Sublayer::Method,
            r"\b(how to|to fix|the fix|workaround|solution|steps?:|step \d|by running|in order to|the way to|recipe|procedure)\b",
        ),
        rule(
            "intent.rule",
            Sublayer::Rule,
            r"(\brule:|\b(always|never|must|policy|make sure|ensure that|required to|mandatory)\b)",
        ),
        rule(
            "intent.goal",
            Sublayer::Goal,
            r"\b(goals?|objectives?|aim to|plan to|planning to|want to|wants to|intend to|going to|milestone|deadline|by (next|end of))\b",
        ),
        rule(
            "intent.anti_pattern",
            Sublayer::AntiPattern,
            r"\b(avoid|don't|do not|anti-pattern|antipattern|bad practice|stop (using|doing)|shouldn't|should not)\b",
        ),
    ]
});

/// Deterministic rule-table classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Classify for RuleClassifier {
    fn classify(&self, content: &str) -> Classification {
        let normalized = normalize(content);
        RULES
            .iter()
            .find(|r| r.pattern.is_match(&normalized))
            .map(|r| Classification {
                tag: LayerTag::of(r.sublayer),
                rule: Some(r.name),
            })
            .unwrap_or_else(Classification::fallback)
    }
}

/// Lowercase, unify apostrophes, collapse whitespace.
pub fn normalize(content: &str) -> String {
    content
        .to_lowercase()
        .replace(['\u{2018}', '\u{2019}'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Layer;

    fn classify(text: &str) -> LayerTag {
        RuleClassifier::new().classify(text).tag
    }

    #[test]
    fn test_self_layer() {
        assert_eq!(classify("I am a backend engineer"), LayerTag::of(Sublayer::Identity));
        assert_eq!(classify("I prefer dark mode"), LayerTag::of(Sublayer::Preference));
        assert_eq!(
            classify("I can't use Docker on this laptop"),
            LayerTag::of(Sublayer::Constraint)
        );
    }

    #[test]
    fn test_ability_and_permission_are_constraints() {
        for text in [
            "I am unable to run Docker here",
            "I'm unable to install system packages",
            "I'm not allowed to push to main",
            "I am not allowed to use sudo",
        ] {
            let c = RuleClassifier::new().classify(text);
            assert_eq!(c.tag, LayerTag::of(Sublayer::Constraint), "{}", text);
            assert_eq!(c.rule, Some("self.constraint"));
        }
    }

    #[test]
    fn test_identity_needs_a_role_or_name() {
        assert_eq!(classify("I'm an SRE on the payments team"), LayerTag::of(Sublayer::Identity));
        assert_eq!(classify("My name is Priya"), LayerTag::of(Sublayer::Identity));
        assert_ne!(classify("I am tired of flaky tests"), LayerTag::of(Sublayer::Identity));
    }

    #[test]
    fn test_world_layer() {
        assert_eq!(
            classify("The build fails when cache is stale"),
            LayerTag::of(Sublayer::Failure)
        );
        assert_eq!(
            classify("Workaround: clear the target dir before release builds"),
            LayerTag::of(Sublayer::Method)
        );
        assert_eq!(
            classify("The service is written in Rust"),
            LayerTag::of(Sublayer::Fact)
        );
    }

    #[test]
    fn test_intent_layer() {
        assert_eq!(classify("Never commit secrets"), LayerTag::of(Sublayer::Rule));
        assert_eq!(
            classify("Our goal is to ship v2 by end of March"),
            LayerTag::of(Sublayer::Goal)
        );
        assert_eq!(
            classify("Avoid global mutable state in handlers"),
            LayerTag::of(Sublayer::AntiPattern)
        );
    }

    #[test]
    fn test_first_match_wins() {
        // Both preference and failure phrasing; preference comes first
        let c = RuleClassifier::new().classify("I like it when the build fails fast");
        assert_eq!(c.tag.sublayer, Sublayer::Preference);
        assert_eq!(c.rule, Some("self.preference"));
    }

    #[test]
    fn test_fallback_is_world_fact() {
        let c = RuleClassifier::new().classify("Sunny afternoon");
        assert!(c.is_fallback());
        assert_eq!(c.tag.layer, Layer::World);
        assert_eq!(c.tag.sublayer, Sublayer::Fact);

        assert!(RuleClassifier::new().classify("").is_fallback());
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize("  I\u{2019}M   Here "), "i'm here");
        assert_eq!(classify("I\u{2019}m the on-call lead"), LayerTag::of(Sublayer::Identity));
    }
}
