//! Online per-variant statistics.
//!
//! Every update is expressed as a [`StatsDelta`] so storage backends can apply
//! it atomically and in any order: binary observations are counter
//! increments, continuous observations are a single-sample Welford merge.

use crate::types::{MetricKind, MetricStats, VariantStats};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One commutative update to a variant's statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StatsDelta {
    Assignment,
    Observation {
        metric: String,
        kind: MetricKind,
        value: f64,
    },
}

/// Classifies metrics and applies deltas to [`VariantStats`].
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    binary_metrics: HashSet<String>,
}

impl StatsAccumulator {
    pub fn new<I, S>(binary_metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary_metrics: binary_metrics.into_iter().map(Into::into).collect(),
        }
    }

    /// Metrics on the allow-list are binary; anything else is continuous.
    pub fn classify(&self, metric: &str) -> MetricKind {
        if self.binary_metrics.contains(metric) {
            MetricKind::Binary
        } else {
            MetricKind::Continuous
        }
    }

    pub fn observation_delta(&self, metric: &str, value: f64) -> StatsDelta {
        StatsDelta::Observation {
            metric: metric.to_string(),
            kind: self.classify(metric),
            value,
        }
    }

    pub fn apply_assignment(stats: &mut VariantStats) {
        stats.assignments += 1;
    }

    pub fn apply_observation(stats: &mut VariantStats, metric: &str, kind: MetricKind, value: f64) {
        let entry = stats
            .metrics
            .entry(metric.to_string())
            .or_insert_with(|| MetricStats::new(kind));
        match entry.kind {
            MetricKind::Binary => record_binary(entry, value),
            MetricKind::Continuous => record_continuous(entry, value),
        }
    }

    pub fn apply(stats: &mut VariantStats, delta: &StatsDelta) {
        match delta {
            StatsDelta::Assignment => Self::apply_assignment(stats),
            StatsDelta::Observation {
                metric,
                kind,
                value,
            } => Self::apply_observation(stats, metric, *kind, *value),
        }
    }
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new(["click", "conversion"])
    }
}

fn record_binary(stats: &mut MetricStats, value: f64) {
    stats.observations += 1;
    if value > 0.0 {
        stats.successes += 1;
    } else {
        stats.failures += 1;
    }
    stats.alpha = 1.0 + stats.successes as f64;
    stats.beta = 1.0 + stats.failures as f64;
}

fn record_continuous(stats: &mut MetricStats, value: f64) {
    stats.observations += 1;
    let n = stats.observations as f64;
    let delta = value - stats.mean;
    stats.mean += delta / n;
    stats.sum_of_squares += delta * (value - stats.mean);
    stats.sum += value;
    stats.variance = if stats.observations > 1 {
        stats.sum_of_squares / n
    } else {
        0.0
    };
}

/// Rebuilds a [`MetricStats`] from raw persisted counters.
pub fn metric_from_raw(
    kind: MetricKind,
    observations: u64,
    successes: u64,
    failures: u64,
    sum: f64,
    mean: f64,
    m2: f64,
) -> MetricStats {
    let mut stats = MetricStats::new(kind);
    stats.observations = observations;
    match kind {
        MetricKind::Binary => {
            stats.successes = successes;
            stats.failures = failures;
            stats.alpha = 1.0 + successes as f64;
            stats.beta = 1.0 + failures as f64;
        }
        MetricKind::Continuous => {
            stats.sum = sum;
            stats.mean = mean;
            stats.sum_of_squares = m2;
            stats.variance = if observations > 1 {
                m2 / observations as f64
            } else {
                0.0
            };
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator() -> StatsAccumulator {
        StatsAccumulator::new(["click", "conversion"])
    }

    #[test]
    fn test_classify_uses_allow_list() {
        let acc = accumulator();
        assert_eq!(acc.classify("click"), MetricKind::Binary);
        assert_eq!(acc.classify("conversion"), MetricKind::Binary);
        assert_eq!(acc.classify("revenue"), MetricKind::Continuous);
        assert_eq!(acc.classify("Click"), MetricKind::Continuous);
    }

    #[test]
    fn test_binary_beta_parameters() {
        let acc = accumulator();
        let mut stats = VariantStats::default();
        let outcomes = [1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 2.5, -1.0];
        for value in outcomes {
            StatsAccumulator::apply(&mut stats, &acc.observation_delta("click", value));
        }

        let click = stats.metric("click").unwrap();
        assert_eq!(click.observations, 9);
        assert_eq!(click.successes, 4);
        assert_eq!(click.failures, 5);
        assert_eq!(click.alpha, 5.0);
        assert_eq!(click.beta, 6.0);
        assert_eq!(click.observations, click.successes + click.failures);
    }

    #[test]
    fn test_beta_invariant_is_order_independent() {
        let acc = accumulator();
        let values: Vec<f64> = (0..50).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();

        let mut forward = VariantStats::default();
        for v in &values {
            StatsAccumulator::apply(&mut forward, &acc.observation_delta("conversion", *v));
        }
        let mut reverse = VariantStats::default();
        for v in values.iter().rev() {
            StatsAccumulator::apply(&mut reverse, &acc.observation_delta("conversion", *v));
        }

        let s = values.iter().filter(|v| **v > 0.0).count() as f64;
        let k = values.len() as f64;
        assert_eq!(forward, reverse);
        assert_eq!(forward.metric("conversion").unwrap().alpha, 1.0 + s);
        assert_eq!(forward.metric("conversion").unwrap().beta, 1.0 + (k - s));
    }

    #[test]
    fn test_welford_matches_arithmetic_mean() {
        let acc = accumulator();
        let values = [1e9 + 4.0, 1e9 + 7.0, 1e9 + 13.0, 1e9 + 16.0];
        let mut stats = VariantStats::default();
        for v in values.iter().rev() {
            StatsAccumulator::apply(&mut stats, &acc.observation_delta("revenue", *v));
        }

        let revenue = stats.metric("revenue").unwrap();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(((revenue.mean - mean) / mean).abs() < 1e-9);
        // Population variance of {4, 7, 13, 16} is 22.5; naive formulas lose this at 1e9 offsets.
        assert!((revenue.variance - 22.5).abs() < 1e-6);
        assert!((revenue.sample_variance() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_continuous_observation_has_zero_variance() {
        let mut stats = VariantStats::default();
        StatsAccumulator::apply_observation(&mut stats, "latency", MetricKind::Continuous, 42.0);
        let latency = stats.metric("latency").unwrap();
        assert_eq!(latency.mean, 42.0);
        assert_eq!(latency.variance, 0.0);
        assert_eq!(latency.sum, 42.0);
    }

    #[test]
    fn test_assignment_delta_only_touches_counter() {
        let mut stats = VariantStats::default();
        StatsAccumulator::apply(&mut stats, &StatsDelta::Assignment);
        StatsAccumulator::apply(&mut stats, &StatsDelta::Assignment);
        assert_eq!(stats.assignments, 2);
        assert!(stats.metrics.is_empty());
    }

    #[test]
    fn test_metric_from_raw_derives_posterior() {
        let m = metric_from_raw(MetricKind::Binary, 100, 70, 30, 0.0, 0.0, 0.0);
        assert_eq!(m.alpha, 71.0);
        assert_eq!(m.beta, 31.0);

        let c = metric_from_raw(MetricKind::Continuous, 4, 0, 0, 40.0, 10.0, 90.0);
        assert_eq!(c.variance, 22.5);
        assert_eq!(c.alpha, 1.0);
    }
}
