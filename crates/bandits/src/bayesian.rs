//! Pairwise control-vs-treatment comparison.
//!
//! Binary metrics are compared with paired Monte Carlo draws from the two
//! Beta posteriors. Continuous metrics use a frequentist Welch approximation
//! (unequal-variance two-sample test on the running means and variances);
//! its "probability to be best" is the approximate one-sided confidence that
//! the treatment mean exceeds the control mean, not a true posterior.

use crate::numeric::{normal_quantile, quantile_sorted, student_t_cdf};
use experiment_core::types::{
    ComparisonMethod, Interval, MetricKind, MetricStats, RecommendedAction, TestResult,
};
use rand::Rng;
use rand_distr::{Beta, Distribution};
use uuid::Uuid;

/// Monte Carlo draws never go below this; keeps the standard error of the
/// probability estimate under 0.5%.
pub const MIN_DRAWS: usize = 10_000;

/// Decision thresholds for one comparison.
#[derive(Debug, Clone, Copy)]
pub struct TestParams {
    pub significance_threshold: f64,
    pub min_sample_size: u64,
    /// Probability at or below which the treatment is declared clearly worse.
    pub futility_threshold: f64,
}

impl TestParams {
    /// Symmetric thresholds: futility mirrors the significance threshold.
    pub fn new(significance_threshold: f64, min_sample_size: u64) -> Self {
        Self {
            significance_threshold,
            min_sample_size,
            futility_threshold: 1.0 - significance_threshold,
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, Copy)]
pub struct ComparedArm<'a> {
    pub variant_id: Uuid,
    pub stats: &'a MetricStats,
}

impl<'a> ComparedArm<'a> {
    pub fn new(variant_id: Uuid, stats: &'a MetricStats) -> Self {
        Self { variant_id, stats }
    }
}

#[derive(Debug, Clone)]
pub struct BayesianTester {
    draws: usize,
    credible_interval: f64,
}

impl BayesianTester {
    pub fn new(draws: usize, credible_interval: f64) -> Self {
        Self {
            draws: draws.max(MIN_DRAWS),
            credible_interval: credible_interval.clamp(0.5, 0.999),
        }
    }

    pub fn draws(&self) -> usize {
        self.draws
    }

    pub fn compare<R: Rng + ?Sized>(
        &self,
        metric: &str,
        control: ComparedArm<'_>,
        treatment: ComparedArm<'_>,
        params: &TestParams,
        rng: &mut R,
    ) -> TestResult {
        match control.stats.kind {
            MetricKind::Binary => self.compare_binary(metric, control, treatment, params, rng),
            MetricKind::Continuous => self.compare_continuous(metric, control, treatment, params),
        }
    }

    fn compare_binary<R: Rng + ?Sized>(
        &self,
        metric: &str,
        control: ComparedArm<'_>,
        treatment: ComparedArm<'_>,
        params: &TestParams,
        rng: &mut R,
    ) -> TestResult {
        let c = control.stats;
        let t = treatment.stats;

        let mut control_draws = Vec::with_capacity(self.draws);
        let mut treatment_draws = Vec::with_capacity(self.draws);
        let mut lifts = Vec::with_capacity(self.draws);
        let mut wins = 0usize;

        // alpha, beta >= 1 by construction, so both constructors succeed.
        let dists = (Beta::new(c.alpha, c.beta), Beta::new(t.alpha, t.beta));
        let (control_dist, treatment_dist) = match dists {
            (Ok(cd), Ok(td)) => (cd, td),
            _ => {
                return self.degenerate(
                    metric,
                    control,
                    treatment,
                    ComparisonMethod::BetaMonteCarlo,
                )
            }
        };

        for _ in 0..self.draws {
            let cs = control_dist.sample(rng);
            let ts = treatment_dist.sample(rng);
            if ts > cs {
                wins += 1;
            }
            if cs > 0.0 {
                lifts.push((ts - cs) / cs);
            }
            control_draws.push(cs);
            treatment_draws.push(ts);
        }

        control_draws.sort_by(f64::total_cmp);
        treatment_draws.sort_by(f64::total_cmp);
        lifts.sort_by(f64::total_cmp);

        let (lo_q, hi_q) = self.tail_quantiles();
        let probability = wins as f64 / self.draws as f64;
        let control_mean = c.posterior_mean();
        let treatment_mean = t.posterior_mean();
        let absolute_effect = treatment_mean - control_mean;

        TestResult {
            control_variant_id: control.variant_id,
            treatment_variant_id: treatment.variant_id,
            metric: metric.to_string(),
            method: ComparisonMethod::BetaMonteCarlo,
            control_samples: c.observations,
            treatment_samples: t.observations,
            control_mean,
            treatment_mean,
            absolute_effect,
            relative_effect: absolute_effect / control_mean,
            control_interval: Interval::new(
                quantile_sorted(&control_draws, lo_q),
                quantile_sorted(&control_draws, hi_q),
            ),
            treatment_interval: Interval::new(
                quantile_sorted(&treatment_draws, lo_q),
                quantile_sorted(&treatment_draws, hi_q),
            ),
            probability_to_be_best: probability,
            effect_interval: Interval::new(
                quantile_sorted(&lifts, lo_q),
                quantile_sorted(&lifts, hi_q),
            ),
            recommended_action: decide(probability, c.observations, t.observations, params),
        }
    }

    fn compare_continuous(
        &self,
        metric: &str,
        control: ComparedArm<'_>,
        treatment: ComparedArm<'_>,
        params: &TestParams,
    ) -> TestResult {
        let c = control.stats;
        let t = treatment.stats;
        if c.observations < 2 || t.observations < 2 {
            return self.degenerate(
                metric,
                control,
                treatment,
                ComparisonMethod::WelchApproximation,
            );
        }

        let n_c = c.observations as f64;
        let n_t = t.observations as f64;
        let se2_c = c.sample_variance() / n_c;
        let se2_t = t.sample_variance() / n_t;
        let se = (se2_c + se2_t).sqrt();
        let diff = t.mean - c.mean;

        let probability = if se > 0.0 {
            // Welch-Satterthwaite degrees of freedom
            let df_denom = se2_c.powi(2) / (n_c - 1.0) + se2_t.powi(2) / (n_t - 1.0);
            let df = if df_denom > 0.0 {
                (se2_c + se2_t).powi(2) / df_denom
            } else {
                f64::INFINITY
            };
            student_t_cdf(diff / se, df)
        } else if diff > 0.0 {
            1.0
        } else if diff < 0.0 {
            0.0
        } else {
            0.5
        };

        let z = normal_quantile(1.0 - (1.0 - self.credible_interval) / 2.0);
        let arm_interval = |m: &MetricStats, se2: f64| {
            let half = z * se2.sqrt();
            Interval::new(m.mean - half, m.mean + half)
        };
        let (relative_effect, effect_interval) = if c.mean != 0.0 {
            let scale = c.mean.abs();
            (
                diff / scale,
                Interval::new((diff - z * se) / scale, (diff + z * se) / scale),
            )
        } else {
            (0.0, Interval::new(diff - z * se, diff + z * se))
        };

        TestResult {
            control_variant_id: control.variant_id,
            treatment_variant_id: treatment.variant_id,
            metric: metric.to_string(),
            method: ComparisonMethod::WelchApproximation,
            control_samples: c.observations,
            treatment_samples: t.observations,
            control_mean: c.mean,
            treatment_mean: t.mean,
            absolute_effect: diff,
            relative_effect,
            control_interval: arm_interval(c, se2_c),
            treatment_interval: arm_interval(t, se2_t),
            probability_to_be_best: probability,
            effect_interval,
            recommended_action: decide(probability, c.observations, t.observations, params),
        }
    }

    /// Result for arms without enough data to compare.
    fn degenerate(
        &self,
        metric: &str,
        control: ComparedArm<'_>,
        treatment: ComparedArm<'_>,
        method: ComparisonMethod,
    ) -> TestResult {
        let c = control.stats.point_estimate();
        let t = treatment.stats.point_estimate();
        TestResult {
            control_variant_id: control.variant_id,
            treatment_variant_id: treatment.variant_id,
            metric: metric.to_string(),
            method,
            control_samples: control.stats.observations,
            treatment_samples: treatment.stats.observations,
            control_mean: c,
            treatment_mean: t,
            absolute_effect: t - c,
            relative_effect: 0.0,
            control_interval: Interval::point(c),
            treatment_interval: Interval::point(t),
            probability_to_be_best: 0.5,
            effect_interval: Interval::point(0.0),
            recommended_action: RecommendedAction::Continue,
        }
    }

    fn tail_quantiles(&self) -> (f64, f64) {
        let tail = (1.0 - self.credible_interval) / 2.0;
        (tail, 1.0 - tail)
    }
}

impl Default for BayesianTester {
    fn default() -> Self {
        Self::new(20_000, 0.95)
    }
}

fn decide(
    probability: f64,
    control_n: u64,
    treatment_n: u64,
    params: &TestParams,
) -> RecommendedAction {
    let enough = control_n >= params.min_sample_size && treatment_n >= params.min_sample_size;
    if enough && probability >= params.significance_threshold {
        RecommendedAction::Conclude
    } else if enough && probability <= params.futility_threshold {
        RecommendedAction::Stop
    } else {
        RecommendedAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::accumulator::metric_from_raw;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn binary(observations: u64, successes: u64) -> MetricStats {
        metric_from_raw(
            MetricKind::Binary,
            observations,
            successes,
            observations - successes,
            0.0,
            0.0,
            0.0,
        )
    }

    fn continuous(n: u64, mean: f64, sample_variance: f64) -> MetricStats {
        let m2 = sample_variance * (n - 1) as f64;
        metric_from_raw(MetricKind::Continuous, n, 0, 0, mean * n as f64, mean, m2)
    }

    #[test]
    fn test_clear_winner_concludes() {
        let mut rng = StdRng::seed_from_u64(1);
        let control = binary(100, 50);
        let treatment = binary(100, 70);
        assert_eq!((control.alpha, control.beta), (51.0, 51.0));
        assert_eq!((treatment.alpha, treatment.beta), (71.0, 31.0));

        let result = BayesianTester::default().compare(
            "conversion",
            ComparedArm::new(Uuid::new_v4(), &control),
            ComparedArm::new(Uuid::new_v4(), &treatment),
            &TestParams::new(0.95, 100),
            &mut rng,
        );

        assert!(result.probability_to_be_best > 0.99, "p = {}", result.probability_to_be_best);
        assert_eq!(result.recommended_action, RecommendedAction::Conclude);
        assert_eq!(result.method, ComparisonMethod::BetaMonteCarlo);
        assert!((result.control_mean - 0.5).abs() < 1e-12);
        // Posterior lift is roughly (0.696 - 0.5) / 0.5.
        assert!(result.effect_interval.lower > 0.0);
        assert!(result.effect_interval.contains(result.relative_effect));
        assert!(result.control_interval.contains(0.5));
        assert!(result.treatment_interval.contains(0.7));
    }

    #[test]
    fn test_identical_arms_continue() {
        let mut rng = StdRng::seed_from_u64(2);
        let arm = binary(500, 100);
        let result = BayesianTester::default().compare(
            "click",
            ComparedArm::new(Uuid::new_v4(), &arm),
            ComparedArm::new(Uuid::new_v4(), &arm),
            &TestParams::new(0.95, 100),
            &mut rng,
        );
        assert!((result.probability_to_be_best - 0.5).abs() < 0.03);
        assert_eq!(result.recommended_action, RecommendedAction::Continue);
        assert!(result.effect_interval.contains(0.0));
    }

    #[test]
    fn test_clearly_worse_treatment_stops() {
        let mut rng = StdRng::seed_from_u64(3);
        let control = binary(400, 200);
        let treatment = binary(400, 120);
        let result = BayesianTester::default().compare(
            "conversion",
            ComparedArm::new(Uuid::new_v4(), &control),
            ComparedArm::new(Uuid::new_v4(), &treatment),
            &TestParams::new(0.95, 100),
            &mut rng,
        );
        assert!(result.probability_to_be_best < 0.01);
        assert_eq!(result.recommended_action, RecommendedAction::Stop);
    }

    #[test]
    fn test_min_sample_size_gates_decision() {
        let mut rng = StdRng::seed_from_u64(4);
        let control = binary(100, 50);
        let treatment = binary(100, 70);
        let result = BayesianTester::default().compare(
            "conversion",
            ComparedArm::new(Uuid::new_v4(), &control),
            ComparedArm::new(Uuid::new_v4(), &treatment),
            &TestParams::new(0.95, 1_000),
            &mut rng,
        );
        assert!(result.probability_to_be_best > 0.99);
        assert_eq!(result.recommended_action, RecommendedAction::Continue);
    }

    #[test]
    fn test_draws_have_a_floor() {
        assert_eq!(BayesianTester::new(100, 0.95).draws(), MIN_DRAWS);
        assert_eq!(BayesianTester::new(50_000, 0.95).draws(), 50_000);
    }

    #[test]
    fn test_welch_comparison_on_continuous_metric() {
        let control = continuous(200, 10.0, 4.0);
        let treatment = continuous(200, 11.0, 4.0);
        let mut rng = StdRng::seed_from_u64(5);
        let result = BayesianTester::default().compare(
            "revenue",
            ComparedArm::new(Uuid::new_v4(), &control),
            ComparedArm::new(Uuid::new_v4(), &treatment),
            &TestParams::new(0.95, 100),
            &mut rng,
        );

        assert_eq!(result.method, ComparisonMethod::WelchApproximation);
        assert!((result.absolute_effect - 1.0).abs() < 1e-9);
        assert!((result.relative_effect - 0.1).abs() < 1e-9);
        assert!(result.probability_to_be_best > 0.999);
        assert_eq!(result.recommended_action, RecommendedAction::Conclude);
        // 1.0 ± 1.96 * 0.2, scaled by the control mean.
        assert!((result.effect_interval.lower - 0.0608).abs() < 1e-3);
        assert!((result.effect_interval.upper - 0.1392).abs() < 1e-3);
        assert!(result.control_interval.contains(10.0));
    }

    #[test]
    fn test_welch_small_samples_use_t_tails() {
        // se = 1 and Welch df = 4, so t = 1.9 gives P ~ 0.935 (z would give ~0.971).
        let control = continuous(3, 10.0, 1.5);
        let treatment = continuous(3, 11.9, 1.5);
        let mut rng = StdRng::seed_from_u64(7);
        let result = BayesianTester::default().compare(
            "revenue",
            ComparedArm::new(Uuid::new_v4(), &control),
            ComparedArm::new(Uuid::new_v4(), &treatment),
            &TestParams::new(0.95, 3),
            &mut rng,
        );

        let p = result.probability_to_be_best;
        assert!((p - 0.9349).abs() < 1e-3, "p = {p}");
        assert_eq!(result.recommended_action, RecommendedAction::Continue);
    }

    #[test]
    fn test_continuous_without_data_is_inconclusive() {
        let control = MetricStats::new(MetricKind::Continuous);
        let treatment = continuous(50, 3.0, 1.0);
        let mut rng = StdRng::seed_from_u64(6);
        let result = BayesianTester::default().compare(
            "latency",
            ComparedArm::new(Uuid::new_v4(), &control),
            ComparedArm::new(Uuid::new_v4(), &treatment),
            &TestParams::new(0.95, 1),
            &mut rng,
        );
        assert_eq!(result.probability_to_be_best, 0.5);
        assert_eq!(result.recommended_action, RecommendedAction::Continue);
    }
}
