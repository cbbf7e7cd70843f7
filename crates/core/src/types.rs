use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ─── Experiment ─────────────────────────────────────────────────────────

/// Lifecycle status. `Concluded` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Concluded,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Concluded)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Concluded => "concluded",
        };
        f.write_str(s)
    }
}

/// Variant selection policy used on each assignment request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    ThompsonSampling,
    Ucb1,
    EpsilonGreedy,
    /// Fixed allocation by variant weight (classic and Bayesian A/B tests).
    WeightedRandom,
}

/// Policy-specific tuning knobs. Unused knobs are ignored by other policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyParams {
    #[serde(default = "default_ucb_c")]
    pub ucb_c: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub epsilon_decay: bool,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    #[serde(default = "default_min_epsilon")]
    pub min_epsilon: f64,
}

fn default_ucb_c() -> f64 {
    2.0
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_decay_rate() -> f64 {
    1.0
}

fn default_min_epsilon() -> f64 {
    0.001
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            ucb_c: default_ucb_c(),
            epsilon: default_epsilon(),
            epsilon_decay: false,
            decay_rate: default_decay_rate(),
            min_epsilon: default_min_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub policy: SelectionPolicy,
    pub primary_metric: String,
    /// Fraction of identities enrolled in the experiment, in (0, 1].
    #[serde(default = "default_traffic_allocation")]
    pub traffic_allocation: f64,
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: f64,
    #[serde(default)]
    pub policy_params: PolicyParams,
}

fn default_traffic_allocation() -> f64 {
    1.0
}

fn default_min_sample_size() -> u64 {
    100
}

fn default_significance_threshold() -> f64 {
    0.95
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>, primary_metric: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            policy: SelectionPolicy::default(),
            primary_metric: primary_metric.into(),
            traffic_allocation: default_traffic_allocation(),
            min_sample_size: default_min_sample_size(),
            significance_threshold: default_significance_threshold(),
            policy_params: PolicyParams::default(),
        }
    }
}

/// Caller-supplied definition of one variant at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantConfig {
    pub name: String,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub name: String,
    pub is_control: bool,
    pub weight: f64,
    pub config: serde_json::Value,
    #[serde(default)]
    pub stats: VariantStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub config: ExperimentConfig,
    pub variants: Vec<Variant>,
    pub status: ExperimentStatus,
    /// Optimistic-concurrency version, bumped by the store on every update.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub concluded_at: Option<DateTime<Utc>>,
    pub winner_variant_id: Option<Uuid>,
}

impl Experiment {
    pub fn variant(&self, id: &Uuid) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == *id)
    }

    /// The control arm: the first variant flagged as control, else the first variant.
    pub fn control(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| v.is_control)
            .or_else(|| self.variants.first())
    }

    pub fn total_assignments(&self) -> u64 {
        self.variants.iter().map(|v| v.stats.assignments).sum()
    }

    pub fn total_observations(&self) -> u64 {
        self.variants
            .iter()
            .flat_map(|v| v.stats.metrics.values())
            .map(|m| m.observations)
            .sum()
    }
}

// ─── Statistics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Binary,
    Continuous,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Binary => "binary",
            MetricKind::Continuous => "continuous",
        }
    }
}

/// Running summary of one metric for one variant.
///
/// Binary metrics keep a Beta(1 + successes, 1 + failures) posterior.
/// Continuous metrics keep Welford state: `sum_of_squares` holds the running
/// sum of squared deviations from the mean (M2), `variance` is M2 / n.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricStats {
    pub kind: MetricKind,
    pub observations: u64,
    pub successes: u64,
    pub failures: u64,
    pub alpha: f64,
    pub beta: f64,
    pub sum: f64,
    pub sum_of_squares: f64,
    pub mean: f64,
    pub variance: f64,
}

impl MetricStats {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            observations: 0,
            successes: 0,
            failures: 0,
            alpha: 1.0,
            beta: 1.0,
            sum: 0.0,
            sum_of_squares: 0.0,
            mean: 0.0,
            variance: 0.0,
        }
    }

    /// Observed success rate (binary) or running mean (continuous).
    pub fn point_estimate(&self) -> f64 {
        match self.kind {
            MetricKind::Binary if self.observations > 0 => {
                self.successes as f64 / self.observations as f64
            }
            MetricKind::Binary => 0.0,
            MetricKind::Continuous => self.mean,
        }
    }

    /// Mean of the Beta posterior, alpha / (alpha + beta).
    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Unbiased (n - 1) sample variance.
    pub fn sample_variance(&self) -> f64 {
        if self.observations > 1 {
            self.sum_of_squares / (self.observations - 1) as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariantStats {
    pub assignments: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricStats>,
}

impl VariantStats {
    pub fn metric(&self, name: &str) -> Option<&MetricStats> {
        self.metrics.get(name)
    }
}

// ─── Assignments & Observations ─────────────────────────────────────────

/// Sticky routing of one identity to one variant. Never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub identity_key: String,
    /// False when the identity fell outside the experiment's traffic allocation.
    pub enrolled: bool,
    /// Variant configuration as it was when the assignment was made.
    pub variant_config: serde_json::Value,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub assigned_at: DateTime<Utc>,
}

/// Append-only outcome record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub observed_at: DateTime<Utc>,
}

// ─── Results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    Conclude,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn point(value: f64) -> Self {
        Self::new(value, value)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// How a [`TestResult`] was computed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMethod {
    /// Paired Monte Carlo draws from the two Beta posteriors.
    BetaMonteCarlo,
    /// Frequentist Welch approximation on running means and variances.
    WelchApproximation,
}

/// Pairwise comparison of a treatment against the control on one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub control_variant_id: Uuid,
    pub treatment_variant_id: Uuid,
    pub metric: String,
    pub method: ComparisonMethod,
    pub control_samples: u64,
    pub treatment_samples: u64,
    pub control_mean: f64,
    pub treatment_mean: f64,
    pub absolute_effect: f64,
    pub relative_effect: f64,
    pub control_interval: Interval,
    pub treatment_interval: Interval,
    /// Probability that the treatment outperforms the control.
    pub probability_to_be_best: f64,
    /// Interval on the relative lift (treatment - control) / control.
    pub effect_interval: Interval,
    pub recommended_action: RecommendedAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ExperimentRecommendation {
    Continue,
    DeclareWinner { variant_id: Uuid },
    ConcludeNoWinner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantReport {
    pub variant_id: Uuid,
    pub name: String,
    pub is_control: bool,
    pub weight: f64,
    pub stats: VariantStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: Uuid,
    pub status: ExperimentStatus,
    pub primary_metric: String,
    pub total_assignments: u64,
    pub total_observations: u64,
    pub variants: Vec<VariantReport>,
    pub tests: Vec<TestResult>,
    pub winner: Option<Uuid>,
    pub recommendation: ExperimentRecommendation,
    pub generated_at: DateTime<Utc>,
}
