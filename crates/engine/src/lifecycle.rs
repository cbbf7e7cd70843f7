//! Experiment lifecycle: creation, the status state machine, assignment,
//! observation intake and reporting.
//!
//! ```text
//! draft ──start──> running <──resume── paused
//!                     │  ──pause──────>  │
//!                     └──conclude──> concluded <──conclude──┘
//! ```
//!
//! Every mutation of the experiment record is a compare-and-swap on its
//! version. Lost races re-read and retry up to `max_update_attempts`.

use crate::ledger::{AssignmentLedger, Resolution};
use crate::storage::GuardedStore;
use chrono::Utc;
use experiment_bandits::{BayesianTester, ComparedArm, TestParams};
use experiment_core::config::EngineConfig;
use experiment_core::event_bus::{AuditEvent, AuditEventType, AuditSink};
use experiment_core::types::{
    Assignment, Experiment, ExperimentConfig, ExperimentRecommendation, ExperimentResults,
    ExperimentStatus, MetricStats, Observation, RecommendedAction, SelectionPolicy, TestResult,
    Variant, VariantConfig, VariantReport, VariantStats,
};
use experiment_core::{ExperimentError, ExperimentResult, ExperimentStore, StatsAccumulator};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Start,
    Pause,
    Resume,
    Conclude,
}

impl Transition {
    fn target(self) -> ExperimentStatus {
        match self {
            Transition::Start | Transition::Resume => ExperimentStatus::Running,
            Transition::Pause => ExperimentStatus::Paused,
            Transition::Conclude => ExperimentStatus::Concluded,
        }
    }

    fn allowed_from(self, status: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, status),
            (Transition::Start, Draft | Paused)
                | (Transition::Pause, Running)
                | (Transition::Resume, Paused)
                | (Transition::Conclude, Running | Paused)
        )
    }

    fn event_type(self) -> AuditEventType {
        match self {
            Transition::Start => AuditEventType::ExperimentStarted,
            Transition::Pause => AuditEventType::ExperimentPaused,
            Transition::Resume => AuditEventType::ExperimentResumed,
            Transition::Conclude => AuditEventType::ExperimentConcluded,
        }
    }
}

pub struct ExperimentEngine {
    store: GuardedStore,
    ledger: AssignmentLedger,
    accumulator: Arc<StatsAccumulator>,
    tester: BayesianTester,
    audit: Arc<dyn AuditSink>,
    rng: Mutex<StdRng>,
    config: EngineConfig,
}

impl ExperimentEngine {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let store = GuardedStore::new(
            store,
            Duration::from_millis(config.store_timeout_ms.max(1)),
        );
        let accumulator = Arc::new(StatsAccumulator::new(config.binary_metrics.iter().cloned()));
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            store_timeout_ms = config.store_timeout_ms,
            monte_carlo_draws = config.monte_carlo_draws,
            seeded = config.rng_seed.is_some(),
            "Experiment engine initialized"
        );

        Self {
            ledger: AssignmentLedger::new(store.clone(), accumulator.clone()),
            tester: BayesianTester::new(config.monte_carlo_draws, config.credible_interval),
            store,
            accumulator,
            audit,
            rng: Mutex::new(rng),
            config,
        }
    }

    pub async fn create_experiment(
        &self,
        config: ExperimentConfig,
        variants: Vec<VariantConfig>,
    ) -> ExperimentResult<Experiment> {
        validate_config(&config)?;
        validate_variants(&config, &variants)?;

        let controls = variants.iter().filter(|v| v.is_control).count();
        if controls != 1 {
            warn!(
                experiment = %config.name,
                controls,
                "Experiment should have exactly one control variant"
            );
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let experiment = Experiment {
            id,
            variants: variants
                .into_iter()
                .map(|v| Variant {
                    id: Uuid::new_v4(),
                    experiment_id: id,
                    name: v.name,
                    is_control: v.is_control,
                    weight: v.weight,
                    config: v.config,
                    stats: VariantStats::default(),
                })
                .collect(),
            config,
            status: ExperimentStatus::Draft,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            concluded_at: None,
            winner_variant_id: None,
        };

        if !self.store.insert_experiment(&experiment).await? {
            return Err(ExperimentError::Conflict(id));
        }

        info!(
            experiment_id = %id,
            name = %experiment.config.name,
            policy = ?experiment.config.policy,
            variants = experiment.variants.len(),
            "Experiment created"
        );
        metrics::counter!("experiments.created").increment(1);
        self.audit.emit(
            AuditEvent::new(AuditEventType::ExperimentCreated, id).with_detail(serde_json::json!({
                "name": experiment.config.name,
                "variants": experiment.variants.len(),
            })),
        );
        Ok(experiment)
    }

    pub async fn start_experiment(&self, experiment_id: Uuid) -> ExperimentResult<Experiment> {
        self.transition(experiment_id, Transition::Start, None).await
    }

    pub async fn pause_experiment(&self, experiment_id: Uuid) -> ExperimentResult<Experiment> {
        self.transition(experiment_id, Transition::Pause, None).await
    }

    pub async fn resume_experiment(&self, experiment_id: Uuid) -> ExperimentResult<Experiment> {
        self.transition(experiment_id, Transition::Resume, None).await
    }

    /// Conclude with an optional winner. Pass the winner from a prior
    /// report, or `None` for a "no significant difference" outcome.
    pub async fn conclude_experiment(
        &self,
        experiment_id: Uuid,
        winner_variant_id: Option<Uuid>,
    ) -> ExperimentResult<Experiment> {
        self.transition(experiment_id, Transition::Conclude, winner_variant_id)
            .await
    }

    /// Replace the weights of existing variants. Allowed in any state but
    /// `concluded`; the variant set itself cannot change.
    pub async fn update_variant_weights(
        &self,
        experiment_id: Uuid,
        weights: HashMap<Uuid, f64>,
    ) -> ExperimentResult<Experiment> {
        let experiment = self
            .modify(experiment_id, |experiment| {
                if experiment.status.is_terminal() {
                    return Err(ExperimentError::ExperimentNotRunning {
                        id: experiment.id,
                        status: experiment.status,
                    });
                }
                if weights.len() != experiment.variants.len()
                    || experiment.variants.iter().any(|v| !weights.contains_key(&v.id))
                {
                    return Err(ExperimentError::InvalidVariantConfiguration(
                        "weights must name exactly the experiment's existing variants".into(),
                    ));
                }
                let ordered: Vec<f64> =
                    experiment.variants.iter().map(|v| weights[&v.id]).collect();
                check_weights(experiment.config.policy, &ordered)?;
                for variant in &mut experiment.variants {
                    variant.weight = weights[&variant.id];
                }
                Ok(())
            })
            .await?;

        info!(experiment_id = %experiment_id, "Variant weights updated");
        self.audit.emit(
            AuditEvent::new(AuditEventType::WeightsUpdated, experiment_id)
                .with_detail(serde_json::json!({ "weights": weights })),
        );
        Ok(experiment)
    }

    pub async fn get_experiment(&self, experiment_id: Uuid) -> ExperimentResult<Experiment> {
        self.store.hydrated_experiment(experiment_id).await
    }

    pub async fn assign_variant(
        &self,
        experiment_id: Uuid,
        identity_key: &str,
        context: Option<serde_json::Value>,
    ) -> ExperimentResult<Assignment> {
        if identity_key.is_empty() {
            return Err(ExperimentError::InvalidConfiguration(
                "identity key must not be empty".into(),
            ));
        }
        let experiment = self.store.experiment(experiment_id).await?;
        let resolution = self
            .ledger
            .get_or_create(&experiment, identity_key, context, &self.rng)
            .await?;

        match &resolution {
            Resolution::Created(a) => {
                metrics::counter!("experiments.assignments.created").increment(1);
                debug!(
                    experiment_id = %experiment_id,
                    variant_id = %a.variant_id,
                    enrolled = a.enrolled,
                    "Variant assigned"
                );
                self.audit.emit(
                    AuditEvent::new(AuditEventType::VariantAssigned, experiment_id)
                        .with_variant(a.variant_id)
                        .with_assignment(a.id)
                        .with_identity(identity_key)
                        .with_detail(serde_json::json!({ "enrolled": a.enrolled })),
                );
            }
            Resolution::Existing(_) => {
                metrics::counter!("experiments.assignments.sticky").increment(1);
            }
        }
        Ok(resolution.into_assignment())
    }

    /// Record one outcome against an assignment. Observations from
    /// identities outside the traffic allocation are stored but not
    /// aggregated.
    pub async fn record_observation(
        &self,
        assignment_id: Uuid,
        metric: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> ExperimentResult<Observation> {
        if metric.is_empty() {
            return Err(ExperimentError::InvalidConfiguration(
                "metric name must not be empty".into(),
            ));
        }
        if !value.is_finite() {
            return Err(ExperimentError::InvalidConfiguration(format!(
                "observation value {value} is not finite"
            )));
        }

        let assignment = self.store.assignment(assignment_id).await?;
        let experiment = self.store.experiment(assignment.experiment_id).await?;
        if experiment.status != ExperimentStatus::Running {
            return Err(ExperimentError::ExperimentNotRunning {
                id: experiment.id,
                status: experiment.status,
            });
        }

        let observation = Observation {
            id: Uuid::new_v4(),
            assignment_id,
            experiment_id: experiment.id,
            variant_id: assignment.variant_id,
            metric: metric.to_string(),
            value,
            metadata,
            observed_at: Utc::now(),
        };
        let delta = assignment
            .enrolled
            .then(|| self.accumulator.observation_delta(metric, value));
        self.store
            .record_observation(&observation, delta.as_ref())
            .await?;

        metrics::counter!("experiments.observations").increment(1);
        self.audit.emit(
            AuditEvent::new(AuditEventType::ObservationRecorded, experiment.id)
                .with_variant(assignment.variant_id)
                .with_assignment(assignment_id)
                .with_detail(serde_json::json!({
                    "metric": metric,
                    "value": value,
                    "aggregated": assignment.enrolled,
                })),
        );
        Ok(observation)
    }

    /// Compare every treatment against the control on the primary metric.
    pub async fn get_experiment_report(
        &self,
        experiment_id: Uuid,
    ) -> ExperimentResult<ExperimentResults> {
        let experiment = self.store.hydrated_experiment(experiment_id).await?;
        let control = experiment.control().ok_or_else(|| {
            ExperimentError::InvalidVariantConfiguration("experiment has no variants".into())
        })?;

        let metric = experiment.config.primary_metric.as_str();
        let kind = self.accumulator.classify(metric);
        let empty = MetricStats::new(kind);
        let stats_of = |v: &Variant| {
            v.stats
                .metric(metric)
                .cloned()
                .unwrap_or_else(|| empty.clone())
        };
        let params = TestParams::new(
            experiment.config.significance_threshold,
            experiment.config.min_sample_size,
        );

        // Sampling runs on a generator derived from the shared one.
        let mut rng = StdRng::seed_from_u64(self.rng.lock().gen());
        let control_stats = stats_of(control);
        let tests: Vec<TestResult> = experiment
            .variants
            .iter()
            .filter(|v| v.id != control.id)
            .map(|treatment| {
                let treatment_stats = stats_of(treatment);
                self.tester.compare(
                    metric,
                    ComparedArm::new(control.id, &control_stats),
                    ComparedArm::new(treatment.id, &treatment_stats),
                    &params,
                    &mut rng,
                )
            })
            .collect();

        let winner = pick_winner(&tests);
        let total_assignments = experiment.total_assignments();
        let recommendation = recommend(
            winner,
            &tests,
            total_assignments,
            &experiment.config,
            experiment.variants.len(),
            self.config.no_winner_sample_factor,
        );

        metrics::counter!("experiments.reports").increment(1);
        self.audit.emit(
            AuditEvent::new(AuditEventType::ReportGenerated, experiment_id).with_detail(
                serde_json::json!({
                    "winner": winner,
                    "recommendation": recommendation,
                }),
            ),
        );

        Ok(ExperimentResults {
            experiment_id,
            status: experiment.status,
            primary_metric: metric.to_string(),
            total_assignments,
            total_observations: experiment.total_observations(),
            variants: experiment
                .variants
                .iter()
                .map(|v| VariantReport {
                    variant_id: v.id,
                    name: v.name.clone(),
                    is_control: v.is_control,
                    weight: v.weight,
                    stats: v.stats.clone(),
                })
                .collect(),
            tests,
            winner,
            recommendation,
            generated_at: Utc::now(),
        })
    }

    async fn transition(
        &self,
        experiment_id: Uuid,
        transition: Transition,
        winner: Option<Uuid>,
    ) -> ExperimentResult<Experiment> {
        let experiment = self
            .modify(experiment_id, |experiment| {
                let from = experiment.status;
                if from.is_terminal() {
                    return Err(ExperimentError::ExperimentNotRunning {
                        id: experiment.id,
                        status: from,
                    });
                }
                if !transition.allowed_from(from) {
                    return Err(ExperimentError::InvalidStateTransition {
                        from,
                        to: transition.target(),
                    });
                }
                if let Some(winner) = winner {
                    if experiment.variant(&winner).is_none() {
                        return Err(ExperimentError::InvalidVariantConfiguration(format!(
                            "winner {winner} is not a variant of this experiment"
                        )));
                    }
                }

                let now = Utc::now();
                experiment.status = transition.target();
                match transition {
                    Transition::Start if experiment.started_at.is_none() => {
                        experiment.started_at = Some(now);
                    }
                    Transition::Conclude => {
                        experiment.concluded_at = Some(now);
                        experiment.winner_variant_id = winner;
                    }
                    _ => {}
                }
                Ok(())
            })
            .await?;

        info!(
            experiment_id = %experiment_id,
            status = %experiment.status,
            version = experiment.version,
            "Experiment status changed"
        );
        let mut event = AuditEvent::new(transition.event_type(), experiment_id);
        if let Some(winner) = experiment.winner_variant_id {
            event = event.with_variant(winner);
        }
        self.audit.emit(event);
        Ok(experiment)
    }

    /// Read-modify-CAS loop on the experiment record. `apply` may reject the
    /// current state; its error is returned as-is.
    async fn modify<F>(&self, experiment_id: Uuid, apply: F) -> ExperimentResult<Experiment>
    where
        F: Fn(&mut Experiment) -> ExperimentResult<()>,
    {
        for attempt in 1..=self.config.max_update_attempts.max(1) {
            let current = self.store.experiment(experiment_id).await?;
            let expected = current.version;
            let mut next = current;
            apply(&mut next)?;
            next.updated_at = Utc::now();

            if self.store.update_experiment(&next, expected).await? {
                next.version = expected + 1;
                self.store.hydrate(&mut next).await?;
                return Ok(next);
            }
            debug!(
                experiment_id = %experiment_id,
                attempt,
                "Experiment update lost a race, retrying"
            );
        }
        metrics::counter!("experiments.update_conflicts").increment(1);
        Err(ExperimentError::Conflict(experiment_id))
    }
}

fn validate_config(config: &ExperimentConfig) -> ExperimentResult<()> {
    let invalid = |msg: String| Err(ExperimentError::InvalidConfiguration(msg));
    if config.name.trim().is_empty() {
        return invalid("experiment name must not be empty".into());
    }
    if config.primary_metric.trim().is_empty() {
        return invalid("primary metric must not be empty".into());
    }
    let t = config.significance_threshold;
    if !(t > 0.5 && t < 1.0) {
        return invalid(format!("significance threshold {t} must be in (0.5, 1)"));
    }
    let a = config.traffic_allocation;
    if !(a > 0.0 && a <= 1.0) {
        return invalid(format!("traffic allocation {a} must be in (0, 1]"));
    }
    let p = &config.policy_params;
    if !(0.0..=1.0).contains(&p.epsilon) {
        return invalid(format!("epsilon {} must be in [0, 1]", p.epsilon));
    }
    if !(p.min_epsilon > 0.0 && p.min_epsilon <= 1.0) {
        return invalid(format!("min_epsilon {} must be in (0, 1]", p.min_epsilon));
    }
    if !(p.ucb_c.is_finite() && p.ucb_c >= 0.0) {
        return invalid(format!("ucb_c {} must be a non-negative number", p.ucb_c));
    }
    if !(p.decay_rate.is_finite() && p.decay_rate >= 0.0) {
        return invalid(format!("decay_rate {} must be a non-negative number", p.decay_rate));
    }
    Ok(())
}

fn validate_variants(
    config: &ExperimentConfig,
    variants: &[VariantConfig],
) -> ExperimentResult<()> {
    if variants.len() < 2 {
        return Err(ExperimentError::InvalidVariantConfiguration(format!(
            "an experiment needs at least two variants, got {}",
            variants.len()
        )));
    }
    if variants.iter().any(|v| v.name.trim().is_empty()) {
        return Err(ExperimentError::InvalidVariantConfiguration(
            "variant names must not be empty".into(),
        ));
    }
    let weights: Vec<f64> = variants.iter().map(|v| v.weight).collect();
    check_weights(config.policy, &weights)
}

/// Every weight must lie in [0, 1]; fixed allocation also needs a positive sum.
fn check_weights(policy: SelectionPolicy, weights: &[f64]) -> ExperimentResult<()> {
    match policy {
        SelectionPolicy::WeightedRandom => {
            experiment_bandits::selector::validate_weights(weights).map(|_| ())
        }
        _ => match weights.iter().find(|w| !w.is_finite() || **w < 0.0 || **w > 1.0) {
            Some(bad) => Err(ExperimentError::InvalidVariantConfiguration(format!(
                "variant weight {bad} is outside [0, 1]"
            ))),
            None => Ok(()),
        },
    }
}

/// The treatment with the highest probability to be best among those whose
/// test clears both the significance threshold and the sample-size gate.
fn pick_winner(tests: &[TestResult]) -> Option<Uuid> {
    tests
        .iter()
        .filter(|t| t.recommended_action == RecommendedAction::Conclude)
        .max_by(|a, b| a.probability_to_be_best.total_cmp(&b.probability_to_be_best))
        .map(|t| t.treatment_variant_id)
}

fn recommend(
    winner: Option<Uuid>,
    tests: &[TestResult],
    total_assignments: u64,
    config: &ExperimentConfig,
    variant_count: usize,
    no_winner_sample_factor: f64,
) -> ExperimentRecommendation {
    if let Some(variant_id) = winner {
        return ExperimentRecommendation::DeclareWinner { variant_id };
    }
    let all_stopped = !tests.is_empty()
        && tests
            .iter()
            .all(|t| t.recommended_action == RecommendedAction::Stop);
    let sample_cap = config.min_sample_size as f64 * variant_count as f64 * no_winner_sample_factor;
    if all_stopped || total_assignments as f64 >= sample_cap {
        ExperimentRecommendation::ConcludeNoWinner
    } else {
        ExperimentRecommendation::Continue
    }
}
