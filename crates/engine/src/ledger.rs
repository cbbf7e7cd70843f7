//! Sticky assignment ledger.
//!
//! Guarantees one assignment per (experiment, identity). The create path
//! goes through the store's insert-if-absent primitive, so a writer that
//! loses a race adopts the winner's row and does not bump any counter.

use crate::storage::GuardedStore;
use chrono::Utc;
use experiment_bandits::{ArmSnapshot, VariantSelector};
use experiment_core::types::{Assignment, Experiment, ExperimentStatus};
use experiment_core::{ExperimentError, ExperimentResult, StatsAccumulator};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// How an assignment request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The identity already had an assignment (or another writer won the race).
    Existing(Assignment),
    /// This call persisted a new assignment.
    Created(Assignment),
}

impl Resolution {
    pub fn assignment(&self) -> &Assignment {
        match self {
            Resolution::Existing(a) | Resolution::Created(a) => a,
        }
    }

    pub fn into_assignment(self) -> Assignment {
        match self {
            Resolution::Existing(a) | Resolution::Created(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Resolution::Created(_))
    }
}

pub struct AssignmentLedger {
    store: GuardedStore,
    accumulator: Arc<StatsAccumulator>,
}

impl AssignmentLedger {
    pub fn new(store: GuardedStore, accumulator: Arc<StatsAccumulator>) -> Self {
        Self { store, accumulator }
    }

    pub async fn get_or_create(
        &self,
        experiment: &Experiment,
        identity_key: &str,
        context: Option<serde_json::Value>,
        rng: &Mutex<StdRng>,
    ) -> ExperimentResult<Resolution> {
        if experiment.status != ExperimentStatus::Running {
            return Err(ExperimentError::ExperimentNotRunning {
                id: experiment.id,
                status: experiment.status,
            });
        }

        if let Some(existing) = self.store.find_assignment(experiment.id, identity_key).await? {
            return Ok(Resolution::Existing(existing));
        }

        let enrolled = is_enrolled(
            &experiment.id,
            identity_key,
            experiment.config.traffic_allocation,
        );
        let variant_id = if enrolled {
            self.select(experiment, rng).await?
        } else {
            experiment
                .control()
                .map(|v| v.id)
                .ok_or_else(|| {
                    ExperimentError::InvalidVariantConfiguration(
                        "experiment has no variants".into(),
                    )
                })?
        };
        let variant = experiment.variant(&variant_id).ok_or_else(|| {
            ExperimentError::InvalidVariantConfiguration(format!(
                "variant {variant_id} not in experiment"
            ))
        })?;

        let candidate = Assignment {
            id: Uuid::new_v4(),
            experiment_id: experiment.id,
            variant_id,
            identity_key: identity_key.to_string(),
            enrolled,
            variant_config: variant.config.clone(),
            context,
            assigned_at: Utc::now(),
        };

        let stored = self.store.insert_assignment_if_absent(&candidate).await?;
        if stored.id != candidate.id {
            debug!(
                experiment_id = %experiment.id,
                assignment_id = %stored.id,
                "Concurrent assignment won the race"
            );
            return Ok(Resolution::Existing(stored));
        }
        Ok(Resolution::Created(stored))
    }

    /// Run the experiment's policy over live stats on the primary metric.
    async fn select(&self, experiment: &Experiment, rng: &Mutex<StdRng>) -> ExperimentResult<Uuid> {
        let mut hydrated = experiment.clone();
        self.store.hydrate(&mut hydrated).await?;

        let metric = &hydrated.config.primary_metric;
        let kind = self.accumulator.classify(metric);
        let arms: Vec<ArmSnapshot> = hydrated
            .variants
            .iter()
            .map(|v| ArmSnapshot::from_variant(v, metric, kind))
            .collect();

        let selector = VariantSelector::new(
            hydrated.config.policy,
            hydrated.config.policy_params.clone(),
        );
        let index = selector.select(&arms, &mut *rng.lock())?;
        Ok(arms[index].variant_id)
    }
}

/// FNV-1a over the experiment id and identity key.
fn enrollment_hash(experiment_id: &Uuid, identity_key: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in experiment_id
        .as_bytes()
        .iter()
        .chain(b":")
        .chain(identity_key.as_bytes())
    {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Whether the identity falls inside the experiment's traffic allocation.
pub fn is_enrolled(experiment_id: &Uuid, identity_key: &str, traffic_allocation: f64) -> bool {
    if traffic_allocation >= 1.0 {
        return true;
    }
    let bucket = (enrollment_hash(experiment_id, identity_key) % 10_000) as f64 / 10_000.0;
    bucket < traffic_allocation
}
