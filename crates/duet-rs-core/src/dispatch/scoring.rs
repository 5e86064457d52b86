//! Ranking of successful adapter replies in auto mode.

use super::AdapterSuccess;
use duet_rs_config::ScoringConfig;
use std::cmp::Ordering;

/// `score = confidence_weight * confidence - latency_weight * latency_secs`.
///
/// Scores closer than `tie_epsilon` are ties; ties go to the faster reply,
/// then to the adapter listed first in the priority order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    confidence_weight: f32,
    latency_weight: f32,
    tie_epsilon: f32,
}

impl ScoringPolicy {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            confidence_weight: config.confidence_weight,
            latency_weight: config.latency_weight,
            tie_epsilon: config.tie_epsilon.max(0.0),
        }
    }

    pub fn score(&self, confidence: f32, latency_secs: f32) -> f32 {
        self.confidence_weight * confidence.clamp(0.0, 1.0) - self.latency_weight * latency_secs
    }

    /// `Greater` when `candidate` should win over `incumbent`.
    fn compare(&self, candidate: &AdapterSuccess, incumbent: &AdapterSuccess) -> Ordering {
        let delta = candidate.score - incumbent.score;
        if delta.abs() > self.tie_epsilon {
            return if delta > 0.0 {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        incumbent
            .latency
            .cmp(&candidate.latency)
            .then_with(|| incumbent.rank.cmp(&candidate.rank))
    }

    /// Index of the winning success, if any.
    pub fn select(&self, successes: &[AdapterSuccess]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, success) in successes.iter().enumerate() {
            best = match best {
                Some(current) if self.compare(success, &successes[current]) != Ordering::Greater => {
                    Some(current)
                }
                _ => Some(index),
            };
        }
        best
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::new(&ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::ScoringPolicy;
    use crate::dispatch::AdapterSuccess;
    use duet_rs_config::ScoringConfig;
    use duet_rs_protocol::AdapterResponse;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn success(policy: &ScoringPolicy, rank: usize, confidence: f32, latency_ms: u64) -> AdapterSuccess {
        let latency = Duration::from_millis(latency_ms);
        AdapterSuccess {
            adapter_id: format!("adapter-{rank}"),
            rank,
            response: AdapterResponse {
                text: "reply".to_string(),
                confidence_hint: confidence,
                model_id: "model".to_string(),
            },
            latency,
            score: policy.score(confidence, latency.as_secs_f32()),
        }
    }

    #[test]
    fn higher_confidence_beats_lower_latency_by_default() {
        let policy = ScoringPolicy::default();
        let successes = vec![success(&policy, 0, 0.7, 500), success(&policy, 1, 0.9, 2000)];
        assert_eq!(policy.select(&successes), Some(1));
    }

    #[test]
    fn latency_weight_can_flip_the_winner() {
        let policy = ScoringPolicy::new(&ScoringConfig {
            latency_weight: 0.2,
            ..ScoringConfig::default()
        });
        let successes = vec![success(&policy, 0, 0.7, 500), success(&policy, 1, 0.9, 2000)];
        assert_eq!(policy.select(&successes), Some(0));
    }

    #[test]
    fn ties_prefer_lower_latency_then_priority() {
        let policy = ScoringPolicy::default();
        let successes = vec![success(&policy, 1, 0.8, 900), success(&policy, 0, 0.8, 300)];
        assert_eq!(policy.select(&successes), Some(1));

        let successes = vec![success(&policy, 1, 0.8, 300), success(&policy, 0, 0.8, 300)];
        assert_eq!(policy.select(&successes), Some(1));
    }

    #[test]
    fn no_successes_selects_nothing() {
        assert_eq!(ScoringPolicy::default().select(&[]), None);
    }
}
