//! Variant selection policies: Thompson Sampling, UCB1, Epsilon-Greedy and
//! fixed-weight allocation.
//!
//! Selection is pure: it reads [`ArmSnapshot`]s and an injected RNG and
//! returns the index of the chosen arm. Exact ties under any scoring rule are
//! broken uniformly at random.

use experiment_core::types::{MetricKind, PolicyParams, SelectionPolicy, Variant};
use experiment_core::{ExperimentError, ExperimentResult};
use rand::Rng;
use rand_distr::{Beta, Distribution, Normal};
use uuid::Uuid;

/// Plays a continuous arm gets as a forced explorer before a sparse arm is
/// scored against the pooled prior instead.
pub const FORCED_EXPLORATION_PLAYS: u64 = 20;

/// Posterior belief about an arm's reward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Posterior {
    Beta { alpha: f64, beta: f64 },
    Normal { mean: f64, std_err: f64 },
    /// Fewer than two observations. Explored first until the arm has had
    /// [`FORCED_EXPLORATION_PLAYS`] assignments, then scored against the
    /// prior pooled from the informed arms.
    Uninformed,
}

/// What a policy needs to know about one variant.
#[derive(Debug, Clone)]
pub struct ArmSnapshot {
    pub variant_id: Uuid,
    pub weight: f64,
    pub assignments: u64,
    /// Observations of the scored metric.
    pub observations: u64,
    /// Success rate for binary metrics, running mean for continuous ones.
    pub mean: f64,
    pub posterior: Posterior,
}

impl ArmSnapshot {
    /// Snapshot `variant` on `metric`. `kind` is used when the metric has no
    /// observations yet.
    pub fn from_variant(variant: &Variant, metric: &str, kind: MetricKind) -> Self {
        let stats = variant.stats.metric(metric);
        let kind = stats.map(|s| s.kind).unwrap_or(kind);
        let (mean, posterior) = match (kind, stats) {
            (MetricKind::Binary, Some(s)) => (
                s.point_estimate(),
                Posterior::Beta {
                    alpha: s.alpha,
                    beta: s.beta,
                },
            ),
            (MetricKind::Binary, None) => (
                0.0,
                Posterior::Beta {
                    alpha: 1.0,
                    beta: 1.0,
                },
            ),
            (MetricKind::Continuous, Some(s)) if s.observations > 1 => (
                s.mean,
                Posterior::Normal {
                    mean: s.mean,
                    std_err: (s.sample_variance() / s.observations as f64).sqrt(),
                },
            ),
            (MetricKind::Continuous, Some(s)) => (s.mean, Posterior::Uninformed),
            (MetricKind::Continuous, None) => (0.0, Posterior::Uninformed),
        };

        Self {
            variant_id: variant.id,
            weight: variant.weight,
            assignments: variant.stats.assignments,
            observations: stats.map(|s| s.observations).unwrap_or(0),
            mean,
            posterior,
        }
    }

    /// Binary arm with an explicit Beta posterior.
    pub fn beta(variant_id: Uuid, alpha: f64, beta: f64, assignments: u64) -> Self {
        Self {
            variant_id,
            weight: 0.0,
            assignments,
            observations: (alpha + beta - 2.0).max(0.0) as u64,
            mean: alpha / (alpha + beta),
            posterior: Posterior::Beta { alpha, beta },
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.posterior {
            Posterior::Beta { alpha, beta } => match Beta::new(alpha, beta) {
                Ok(dist) => dist.sample(rng),
                Err(_) => alpha / (alpha + beta),
            },
            Posterior::Normal { mean, std_err } if std_err > 0.0 => {
                match Normal::new(mean, std_err) {
                    Ok(dist) => dist.sample(rng),
                    Err(_) => mean,
                }
            }
            Posterior::Normal { mean, .. } => mean,
            Posterior::Uninformed => f64::INFINITY,
        }
    }
}

/// A configured selection policy.
#[derive(Debug, Clone)]
pub struct VariantSelector {
    policy: SelectionPolicy,
    params: PolicyParams,
}

impl VariantSelector {
    pub fn new(policy: SelectionPolicy, params: PolicyParams) -> Self {
        Self { policy, params }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Choose one arm; returns its index in `arms`.
    pub fn select<R: Rng + ?Sized>(
        &self,
        arms: &[ArmSnapshot],
        rng: &mut R,
    ) -> ExperimentResult<usize> {
        if arms.is_empty() {
            return Err(ExperimentError::InvalidVariantConfiguration(
                "no variants to select from".into(),
            ));
        }

        let index = match self.policy {
            SelectionPolicy::ThompsonSampling => thompson_sampling(arms, rng),
            SelectionPolicy::Ucb1 => ucb1(arms, self.params.ucb_c, rng),
            SelectionPolicy::EpsilonGreedy => {
                let total: u64 = arms.iter().map(|a| a.assignments).sum();
                let epsilon = effective_epsilon(&self.params, total);
                epsilon_greedy(arms, epsilon, rng)
            }
            SelectionPolicy::WeightedRandom => weighted_random(arms, rng)?,
        };
        Ok(index)
    }
}

fn thompson_sampling<R: Rng + ?Sized>(arms: &[ArmSnapshot], rng: &mut R) -> usize {
    let prior = pooled_prior(arms);
    let samples: Vec<f64> = arms
        .iter()
        .map(|arm| match (arm.posterior, prior) {
            (Posterior::Uninformed, Some(prior))
                if arm.assignments >= FORCED_EXPLORATION_PLAYS =>
            {
                prior.sample_sparse(arm, rng)
            }
            _ => arm.sample(rng),
        })
        .collect();
    argmax_uniform_ties(&samples, rng)
}

/// Outcome distribution pooled over the arms with a Normal posterior.
#[derive(Debug, Clone, Copy)]
struct PooledPrior {
    mean: f64,
    std_dev: f64,
}

impl PooledPrior {
    /// Posterior for an arm with at most one observation, treating the
    /// prior as a single pseudo-observation.
    fn sample_sparse<R: Rng + ?Sized>(&self, arm: &ArmSnapshot, rng: &mut R) -> f64 {
        let k = arm.observations.min(1) as f64;
        let mean = (self.mean + k * arm.mean) / (1.0 + k);
        let std_dev = self.std_dev / (1.0 + k).sqrt();
        match Normal::new(mean, std_dev) {
            Ok(dist) if std_dev > 0.0 => dist.sample(rng),
            _ => mean,
        }
    }
}

fn pooled_prior(arms: &[ArmSnapshot]) -> Option<PooledPrior> {
    let mut n = 0.0;
    let mut sum = 0.0;
    let mut dof = 0.0;
    let mut sum_sq = 0.0;
    for arm in arms {
        if let Posterior::Normal { mean, std_err } = arm.posterior {
            let obs = arm.observations as f64;
            if obs < 2.0 {
                continue;
            }
            n += obs;
            sum += obs * mean;
            // std_err^2 * n is the arm's sample variance.
            dof += obs - 1.0;
            sum_sq += (obs - 1.0) * std_err * std_err * obs;
        }
    }
    (n > 0.0).then(|| PooledPrior {
        mean: sum / n,
        std_dev: (sum_sq / dof).sqrt(),
    })
}

fn ucb1<R: Rng + ?Sized>(arms: &[ArmSnapshot], c: f64, rng: &mut R) -> usize {
    // Cold start: every unplayed arm is tried before any scoring happens.
    let unplayed: Vec<usize> = arms
        .iter()
        .enumerate()
        .filter(|(_, a)| a.assignments == 0)
        .map(|(i, _)| i)
        .collect();
    if !unplayed.is_empty() {
        return unplayed[rng.gen_range(0..unplayed.len())];
    }

    let total: u64 = arms.iter().map(|a| a.assignments).sum();
    let log_total = (total as f64).ln();
    let scores: Vec<f64> = arms
        .iter()
        .map(|a| a.mean + c * (log_total / a.assignments as f64).sqrt())
        .collect();
    argmax_uniform_ties(&scores, rng)
}

fn epsilon_greedy<R: Rng + ?Sized>(arms: &[ArmSnapshot], epsilon: f64, rng: &mut R) -> usize {
    if rng.gen::<f64>() < epsilon {
        return rng.gen_range(0..arms.len());
    }
    let means: Vec<f64> = arms.iter().map(|a| a.mean).collect();
    argmax_uniform_ties(&means, rng)
}

/// Exploration rate after `total_assignments` plays.
///
/// Without decay this is the configured epsilon. With decay it follows
/// `epsilon / (1 + decay_rate * total)`, floored at a strictly positive
/// `min_epsilon`, so it is non-increasing and never reaches zero.
pub fn effective_epsilon(params: &PolicyParams, total_assignments: u64) -> f64 {
    let epsilon = params.epsilon.clamp(0.0, 1.0);
    if !params.epsilon_decay {
        return epsilon;
    }
    let floor = params.min_epsilon.clamp(f64::MIN_POSITIVE, 1.0);
    let decayed = epsilon / (1.0 + params.decay_rate.max(0.0) * total_assignments as f64);
    decayed.max(floor)
}

fn weighted_random<R: Rng + ?Sized>(arms: &[ArmSnapshot], rng: &mut R) -> ExperimentResult<usize> {
    let weights: Vec<f64> = arms.iter().map(|a| a.weight).collect();
    let total = validate_weights(&weights)?;

    let mut r = rng.gen_range(0.0..total);
    let mut last_positive = 0;
    for (i, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        last_positive = i;
        r -= w;
        if r <= 0.0 {
            return Ok(i);
        }
    }
    // Floating-point residue past the final bucket.
    Ok(last_positive)
}

/// Checks that weights can be normalised; returns their sum.
pub fn validate_weights(weights: &[f64]) -> ExperimentResult<f64> {
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0 || **w > 1.0) {
        return Err(ExperimentError::InvalidVariantConfiguration(format!(
            "variant weight {bad} is outside [0, 1]"
        )));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(ExperimentError::InvalidVariantConfiguration(
            "variant weights sum to zero and cannot be normalized".into(),
        ));
    }
    Ok(total)
}

/// Index of the maximum score; exact ties are resolved uniformly at random.
/// NaN scores never win unless every score is NaN.
fn argmax_uniform_ties<R: Rng + ?Sized>(scores: &[f64], rng: &mut R) -> usize {
    let best = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<usize> = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == best)
        .map(|(i, _)| i)
        .collect();
    if tied.is_empty() {
        return rng.gen_range(0..scores.len());
    }
    tied[rng.gen_range(0..tied.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weighted_arms(weights: &[f64]) -> Vec<ArmSnapshot> {
        weights
            .iter()
            .map(|w| ArmSnapshot {
                variant_id: Uuid::new_v4(),
                weight: *w,
                assignments: 0,
                observations: 0,
                mean: 0.0,
                posterior: Posterior::Beta {
                    alpha: 1.0,
                    beta: 1.0,
                },
            })
            .collect()
    }

    fn arm_with_mean(mean: f64, assignments: u64) -> ArmSnapshot {
        ArmSnapshot {
            variant_id: Uuid::new_v4(),
            weight: 0.5,
            assignments,
            observations: 0,
            mean,
            posterior: Posterior::Uninformed,
        }
    }

    fn normal_arm(mean: f64, std_dev: f64, observations: u64) -> ArmSnapshot {
        ArmSnapshot {
            variant_id: Uuid::new_v4(),
            weight: 0.5,
            assignments: observations,
            observations,
            mean,
            posterior: Posterior::Normal {
                mean,
                std_err: std_dev / (observations as f64).sqrt(),
            },
        }
    }

    #[test]
    fn test_thompson_converges_to_better_arm() {
        let mut rng = StdRng::seed_from_u64(7);
        let true_rates = [0.10, 0.30];
        let mut successes = [0u64; 2];
        let mut failures = [0u64; 2];
        let mut plays = [0u64; 2];
        let selector =
            VariantSelector::new(SelectionPolicy::ThompsonSampling, PolicyParams::default());

        for _ in 0..5_000 {
            let arms: Vec<ArmSnapshot> = (0..2)
                .map(|i| {
                    ArmSnapshot::beta(
                        Uuid::nil(),
                        1.0 + successes[i] as f64,
                        1.0 + failures[i] as f64,
                        plays[i],
                    )
                })
                .collect();
            let chosen = selector.select(&arms, &mut rng).unwrap();
            plays[chosen] += 1;
            if rng.gen::<f64>() < true_rates[chosen] {
                successes[chosen] += 1;
            } else {
                failures[chosen] += 1;
            }
        }

        let share = plays[1] as f64 / 5_000.0;
        assert!(share > 0.90, "treatment share was {share}");
    }

    #[test]
    fn test_thompson_uniform_priors_split_evenly() {
        let mut rng = StdRng::seed_from_u64(11);
        let selector =
            VariantSelector::new(SelectionPolicy::ThompsonSampling, PolicyParams::default());
        let arms = vec![
            ArmSnapshot::beta(Uuid::new_v4(), 1.0, 1.0, 0),
            ArmSnapshot::beta(Uuid::new_v4(), 1.0, 1.0, 0),
        ];

        let mut first = 0u32;
        for _ in 0..10_000 {
            if selector.select(&arms, &mut rng).unwrap() == 0 {
                first += 1;
            }
        }
        let share = first as f64 / 10_000.0;
        assert!((share - 0.5).abs() < 0.03, "first arm share was {share}");
    }

    #[test]
    fn test_weighted_allocation_fidelity() {
        let mut rng = StdRng::seed_from_u64(42);
        let selector =
            VariantSelector::new(SelectionPolicy::WeightedRandom, PolicyParams::default());
        let weights = [0.6, 0.3, 0.1];
        let arms = weighted_arms(&weights);

        let mut counts = [0u32; 3];
        for _ in 0..100_000 {
            counts[selector.select(&arms, &mut rng).unwrap()] += 1;
        }
        for (i, w) in weights.iter().enumerate() {
            let share = counts[i] as f64 / 100_000.0;
            assert!((share - w).abs() < 0.01, "variant {i}: share {share}, weight {w}");
        }
    }

    #[test]
    fn test_weighted_skips_zero_weight_arms() {
        let mut rng = StdRng::seed_from_u64(3);
        let selector =
            VariantSelector::new(SelectionPolicy::WeightedRandom, PolicyParams::default());
        let arms = weighted_arms(&[0.0, 1.0, 0.0]);
        for _ in 0..1_000 {
            assert_eq!(selector.select(&arms, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_weighted_rejects_unnormalizable_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let selector =
            VariantSelector::new(SelectionPolicy::WeightedRandom, PolicyParams::default());
        let err = selector.select(&weighted_arms(&[0.0, 0.0]), &mut rng).unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidVariantConfiguration(_)));

        assert!(validate_weights(&[0.5, -0.1]).is_err());
        assert!(validate_weights(&[f64::NAN, 0.5]).is_err());
        assert_eq!(validate_weights(&[0.25, 0.25]).unwrap(), 0.5);
    }

    #[test]
    fn test_ucb1_cold_start_picks_unplayed_arm() {
        let mut rng = StdRng::seed_from_u64(5);
        let selector = VariantSelector::new(SelectionPolicy::Ucb1, PolicyParams::default());
        let arms = vec![arm_with_mean(0.9, 500), arm_with_mean(0.0, 0), arm_with_mean(0.8, 300)];
        for _ in 0..100 {
            assert_eq!(selector.select(&arms, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_ucb1_exploration_bonus() {
        let mut rng = StdRng::seed_from_u64(5);
        let selector = VariantSelector::new(SelectionPolicy::Ucb1, PolicyParams::default());
        // Arm 1 has a lower mean but far fewer plays, so its bonus dominates.
        let arms = vec![arm_with_mean(0.5, 10_000), arm_with_mean(0.45, 10)];
        assert_eq!(selector.select(&arms, &mut rng).unwrap(), 1);

        // With c = 0 the policy is purely greedy.
        let greedy = VariantSelector::new(
            SelectionPolicy::Ucb1,
            PolicyParams {
                ucb_c: 0.0,
                ..PolicyParams::default()
            },
        );
        assert_eq!(greedy.select(&arms, &mut rng).unwrap(), 0);
    }

    #[test]
    fn test_epsilon_zero_is_greedy_with_random_ties() {
        let mut rng = StdRng::seed_from_u64(9);
        let selector = VariantSelector::new(
            SelectionPolicy::EpsilonGreedy,
            PolicyParams {
                epsilon: 0.0,
                ..PolicyParams::default()
            },
        );
        let arms = vec![arm_with_mean(0.2, 10), arm_with_mean(0.4, 10), arm_with_mean(0.4, 10)];

        let mut counts = [0u32; 3];
        for _ in 0..2_000 {
            counts[selector.select(&arms, &mut rng).unwrap()] += 1;
        }
        assert_eq!(counts[0], 0);
        assert!(counts[1] > 800 && counts[2] > 800, "tie split {counts:?}");
    }

    #[test]
    fn test_epsilon_one_explores_uniformly() {
        let mut rng = StdRng::seed_from_u64(13);
        let selector = VariantSelector::new(
            SelectionPolicy::EpsilonGreedy,
            PolicyParams {
                epsilon: 1.0,
                ..PolicyParams::default()
            },
        );
        let arms = vec![arm_with_mean(0.9, 10), arm_with_mean(0.1, 10)];
        let picks_worse = (0..4_000)
            .filter(|_| selector.select(&arms, &mut rng).unwrap() == 1)
            .count();
        assert!((1_700..2_300).contains(&picks_worse));
    }

    #[test]
    fn test_epsilon_decay_is_monotone_and_positive() {
        let params = PolicyParams {
            epsilon: 0.2,
            epsilon_decay: true,
            decay_rate: 1.0,
            min_epsilon: 0.0,
            ..PolicyParams::default()
        };
        let mut previous = f64::INFINITY;
        for total in [0u64, 1, 10, 1_000, 1_000_000, u64::MAX] {
            let eps = effective_epsilon(&params, total);
            assert!(eps <= previous);
            assert!(eps > 0.0);
            previous = eps;
        }
        assert_eq!(effective_epsilon(&params, 0), 0.2);
        assert!((effective_epsilon(&params, 1) - 0.1).abs() < 1e-12);

        let fixed = PolicyParams::default();
        assert_eq!(effective_epsilon(&fixed, 1_000_000), 0.1);
    }

    #[test]
    fn test_continuous_arms_without_data_are_explored_first() {
        let mut rng = StdRng::seed_from_u64(21);
        let selector =
            VariantSelector::new(SelectionPolicy::ThompsonSampling, PolicyParams::default());
        let arms = vec![normal_arm(50.0, 10.0, 100), arm_with_mean(0.0, 0)];
        assert_eq!(selector.select(&arms, &mut rng).unwrap(), 1);

        let just_below = vec![
            normal_arm(50.0, 10.0, 100),
            arm_with_mean(0.0, FORCED_EXPLORATION_PLAYS - 1),
        ];
        assert_eq!(selector.select(&just_below, &mut rng).unwrap(), 1);
    }

    #[test]
    fn test_sparse_continuous_arm_stops_monopolizing() {
        let mut rng = StdRng::seed_from_u64(23);
        let selector =
            VariantSelector::new(SelectionPolicy::ThompsonSampling, PolicyParams::default());

        // Heavily played, one low observation.
        let mut bad = arm_with_mean(10.0, 5_000);
        bad.observations = 1;
        let arms = vec![normal_arm(50.0, 1.0, 500), bad];
        let bad_picks = (0..1_000)
            .filter(|_| selector.select(&arms, &mut rng).unwrap() == 1)
            .count();
        assert!(bad_picks < 10, "bad arm picked {bad_picks}/1000");

        // Heavily played, never observed: drawn from the pooled prior.
        let arms = vec![normal_arm(50.0, 1.0, 500), arm_with_mean(0.0, 5_000)];
        let silent_picks = (0..2_000)
            .filter(|_| selector.select(&arms, &mut rng).unwrap() == 1)
            .count();
        assert!((700..1_300).contains(&silent_picks), "silent arm picked {silent_picks}/2000");
    }

    #[test]
    fn test_all_uninformed_arms_split_evenly() {
        let mut rng = StdRng::seed_from_u64(29);
        let selector =
            VariantSelector::new(SelectionPolicy::ThompsonSampling, PolicyParams::default());
        let arms = vec![arm_with_mean(0.0, 1_000), arm_with_mean(0.0, 1_000)];
        let first = (0..2_000)
            .filter(|_| selector.select(&arms, &mut rng).unwrap() == 0)
            .count();
        assert!((850..1_150).contains(&first), "first arm picked {first}/2000");
    }

    #[test]
    fn test_empty_arms_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let selector = VariantSelector::new(SelectionPolicy::Ucb1, PolicyParams::default());
        assert!(selector.select(&[], &mut rng).is_err());
    }
}
