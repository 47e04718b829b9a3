//! Complexity tiers and the timeout bounds they select.
//!
//! The tier is derived from a Plan's entity counts and lives only as long as
//! the round that computed it. It sizes time bounds; nothing else.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Derived workflow size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl ComplexityTier {
    /// Classify from entity counts.
    ///
    /// - simple: at most 3 required entities, none missing, no branching
    /// - complex: 8+ required, or 2+ missing, or 6+ required with branching
    /// - medium: everything else
    pub fn classify(required: usize, missing: usize, has_branching: bool) -> Self {
        if required >= 8 || missing >= 2 || (has_branching && required >= 6) {
            ComplexityTier::Complex
        } else if required <= 3 && missing == 0 && !has_branching {
            ComplexityTier::Simple
        } else {
            ComplexityTier::Medium
        }
    }

    /// Lenient parse of a model-reported complexity label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "simple" | "low" | "easy" => Some(ComplexityTier::Simple),
            "medium" | "moderate" | "intermediate" => Some(ComplexityTier::Medium),
            "complex" | "high" | "hard" | "advanced" => Some(ComplexityTier::Complex),
            _ => None,
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplexityTier::Simple => write!(f, "simple"),
            ComplexityTier::Medium => write!(f, "medium"),
            ComplexityTier::Complex => write!(f, "complex"),
        }
    }
}

/// Whether an entity type is a branching/joining primitive (if, switch, merge).
pub fn is_branching_type(entity_type: &str) -> bool {
    let local = entity_type
        .rsplit('.')
        .next()
        .unwrap_or(entity_type)
        .to_ascii_lowercase();
    matches!(local.as_str(), "if" | "switch" | "merge")
}

/// Per-call time bound for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub simple: Duration,
    pub medium: Duration,
    pub complex: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            simple: Duration::from_secs(60),
            medium: Duration::from_secs(90),
            complex: Duration::from_secs(120),
        }
    }
}

impl TimeoutPolicy {
    pub fn for_tier(&self, tier: ComplexityTier) -> Duration {
        match tier {
            ComplexityTier::Simple => self.simple,
            ComplexityTier::Medium => self.medium,
            ComplexityTier::Complex => self.complex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_requires_small_clean_linear_plan() {
        assert_eq!(ComplexityTier::classify(0, 0, false), ComplexityTier::Simple);
        assert_eq!(ComplexityTier::classify(3, 0, false), ComplexityTier::Simple);
        assert_eq!(ComplexityTier::classify(3, 1, false), ComplexityTier::Medium);
        assert_eq!(ComplexityTier::classify(3, 0, true), ComplexityTier::Medium);
        assert_eq!(ComplexityTier::classify(4, 0, false), ComplexityTier::Medium);
    }

    #[test]
    fn complex_thresholds() {
        assert_eq!(ComplexityTier::classify(8, 0, false), ComplexityTier::Complex);
        assert_eq!(ComplexityTier::classify(2, 2, false), ComplexityTier::Complex);
        assert_eq!(ComplexityTier::classify(6, 0, true), ComplexityTier::Complex);
        assert_eq!(ComplexityTier::classify(6, 0, false), ComplexityTier::Medium);
        assert_eq!(ComplexityTier::classify(7, 1, false), ComplexityTier::Medium);
        assert_eq!(ComplexityTier::classify(5, 0, true), ComplexityTier::Medium);
    }

    #[test]
    fn classify_is_pure() {
        for required in 0..12 {
            for missing in 0..4 {
                for branching in [false, true] {
                    assert_eq!(
                        ComplexityTier::classify(required, missing, branching),
                        ComplexityTier::classify(required, missing, branching)
                    );
                }
            }
        }
    }

    #[test]
    fn branching_detection_uses_local_name() {
        assert!(is_branching_type("n8n-nodes-base.if"));
        assert!(is_branching_type("n8n-nodes-base.Switch"));
        assert!(is_branching_type("n8n-nodes-base.merge"));
        assert!(!is_branching_type("n8n-nodes-base.httpRequest"));
        assert!(!is_branching_type("n8n-nodes-base.notifier"));
    }

    #[test]
    fn labels_and_timeouts() {
        assert_eq!(ComplexityTier::from_label(" Complex "), Some(ComplexityTier::Complex));
        assert_eq!(ComplexityTier::from_label("??"), None);
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.for_tier(ComplexityTier::Simple), Duration::from_secs(60));
        assert_eq!(policy.for_tier(ComplexityTier::Complex), Duration::from_secs(120));
    }
}
