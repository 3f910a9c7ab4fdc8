//! Nearest-template matching by Euclidean distance.
//!
//! Every query is a linear O(N·D) scan over the template snapshot. That is
//! adequate up to roughly a thousand enrolled identities; beyond that an
//! approximate nearest-neighbour index is needed.

use crate::config::MatcherConfig;
use crate::template_store::TemplateSnapshot;
use crate::types::{Descriptor, MatchResult};

/// Distances closer than this are treated as equal for tie-breaking.
const TIE_TOLERANCE: f32 = 1e-6;

pub trait Matcher {
    /// Compare `query` against every template in `gallery`.
    fn compare(&self, query: &Descriptor, gallery: &TemplateSnapshot) -> MatchResult;
}

/// Accepts the nearest template only if it passes two independent gates:
/// `distance < distance_threshold` and `confidence >= confidence_threshold`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    config: MatcherConfig,
}

impl EuclideanMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// `clamp(1 - distance / distance_threshold, 0, 1)`.
    pub fn confidence(&self, distance: f32) -> f32 {
        if distance.is_nan() {
            return 0.0;
        }
        (1.0 - distance / self.config.distance_threshold).clamp(0.0, 1.0)
    }

    fn accepts(&self, distance: f32, confidence: f32) -> bool {
        distance < self.config.distance_threshold
            && confidence >= self.config.confidence_threshold
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Descriptor, gallery: &TemplateSnapshot) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;

        for (identity, descriptor) in gallery.iter() {
            let distance = query.distance(descriptor);
            best = match best {
                None => Some((identity, distance)),
                Some((best_id, best_distance)) => {
                    if distance < best_distance - TIE_TOLERANCE {
                        Some((identity, distance))
                    } else if (distance - best_distance).abs() <= TIE_TOLERANCE
                        && identity < best_id
                    {
                        Some((identity, distance))
                    } else {
                        Some((best_id, best_distance))
                    }
                }
            };
        }

        let Some((identity, distance)) = best else {
            return MatchResult::unknown();
        };

        let confidence = self.confidence(distance);
        let accepted = self.accepts(distance, confidence);
        tracing::debug!(
            candidate = identity,
            distance,
            confidence,
            accepted,
            "match evaluated"
        );

        MatchResult {
            identity: accepted.then(|| identity.to_string()),
            distance,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template_store::TemplateStore;
    use crate::types::BiometricTemplate;
    use chrono::NaiveDate;

    fn store_with(dim: usize, entries: &[(&str, Vec<f32>)]) -> TemplateStore {
        let store = TemplateStore::new(dim);
        let created_at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        for (identity, values) in entries {
            store
                .upsert(BiometricTemplate {
                    identity: identity.to_string(),
                    descriptor: Descriptor::new(values.clone()),
                    sample_count: 15,
                    created_at,
                })
                .unwrap();
        }
        store
    }

    fn matcher() -> EuclideanMatcher {
        EuclideanMatcher::new(MatcherConfig {
            distance_threshold: 0.6,
            confidence_threshold: 0.55,
        })
    }

    #[test]
    fn test_scenario_alice_accepted() {
        let store = store_with(4, &[("alice", vec![0.0, 0.0, 0.0, 0.0])]);
        let query = Descriptor::new(vec![0.1, 0.0, 0.0, 0.0]);

        let result = matcher().compare(&query, &store.iterate());
        assert_eq!(result.identity.as_deref(), Some("alice"));
        assert!((result.distance - 0.1).abs() < 1e-6);
        assert!((result.confidence - 0.8333).abs() < 1e-3);
    }

    #[test]
    fn test_exact_template_has_full_confidence() {
        let store = store_with(
            3,
            &[("alice", vec![0.2, 0.4, 0.1]), ("bob", vec![0.9, 0.1, 0.3])],
        );
        let query = Descriptor::new(vec![0.9, 0.1, 0.3]);

        let result = matcher().compare(&query, &store.iterate());
        assert_eq!(result.identity.as_deref(), Some("bob"));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_distance_at_threshold_is_rejected_with_zero_confidence() {
        let store = store_with(2, &[("alice", vec![0.0, 0.0])]);
        let m = matcher();

        for d in [0.6f32, 0.75, 3.0] {
            let result = m.compare(&Descriptor::new(vec![d, 0.0]), &store.iterate());
            assert!(result.identity.is_none(), "distance {d} accepted");
            assert_eq!(result.confidence, 0.0);
        }
    }

    #[test]
    fn test_confidence_monotonic_in_distance() {
        let m = matcher();
        let mut previous = m.confidence(0.0);
        assert_eq!(previous, 1.0);
        for step in 1..=100 {
            let c = m.confidence(step as f32 * 0.01);
            assert!(c <= previous, "confidence rose at step {step}");
            assert!((0.0..=1.0).contains(&c));
            previous = c;
        }
    }

    #[test]
    fn test_confidence_gate_independent_of_distance_gate() {
        // distance 0.3 < 0.6 passes the distance gate, confidence 0.5 fails 0.55
        let store = store_with(1, &[("alice", vec![0.0])]);
        let result = matcher().compare(&Descriptor::new(vec![0.3]), &store.iterate());
        assert!(result.identity.is_none());
        assert!((result.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_store_is_unknown() {
        let store = TemplateStore::new(2);
        let result = matcher().compare(&Descriptor::new(vec![0.0, 0.0]), &store.iterate());
        assert!(!result.is_accepted());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_tie_break_prefers_smallest_identity() {
        let store = store_with(
            2,
            &[
                ("carol", vec![0.1, 0.0]),
                ("alice", vec![-0.1, 0.0]),
                ("bob", vec![0.0, 0.1]),
            ],
        );
        let query = Descriptor::new(vec![0.0, 0.0]);

        for _ in 0..5 {
            let result = matcher().compare(&query, &store.iterate());
            assert_eq!(result.identity.as_deref(), Some("alice"));
        }
    }

    #[test]
    fn test_nearest_wins_over_identity_order() {
        let store = store_with(1, &[("alice", vec![0.3]), ("zoe", vec![0.05])]);
        let result = matcher().compare(&Descriptor::new(vec![0.0]), &store.iterate());
        assert_eq!(result.identity.as_deref(), Some("zoe"));
    }
}
