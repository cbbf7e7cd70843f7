//! Timeout-guarded access to the storage collaborator.
//!
//! Every call is bounded by `store_timeout_ms`. Store failures and timeouts
//! both surface as `CollaboratorUnavailable`; nothing is retried here.

use experiment_core::error::StoreResult;
use experiment_core::types::{Assignment, Experiment, Observation, VariantStats};
use experiment_core::{ExperimentError, ExperimentResult, ExperimentStore, StatsDelta};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn ExperimentStore>,
    timeout: Duration,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn ExperimentStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guard<T, F>(&self, op: &'static str, call: F) -> ExperimentResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                metrics::counter!("experiments.collaborator_errors", "op" => op).increment(1);
                warn!(op, error = %e, "Store call failed");
                Err(e.into())
            }
            Err(_) => {
                metrics::counter!("experiments.collaborator_errors", "op" => op).increment(1);
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Store call timed out");
                Err(ExperimentError::CollaboratorUnavailable(format!(
                    "store {op} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    pub async fn insert_experiment(&self, experiment: &Experiment) -> ExperimentResult<bool> {
        self.guard("insert_experiment", self.inner.insert_experiment(experiment))
            .await
    }

    /// The experiment record, or `ExperimentNotFound`.
    pub async fn experiment(&self, id: Uuid) -> ExperimentResult<Experiment> {
        self.guard("get_experiment", self.inner.get_experiment(id))
            .await?
            .ok_or(ExperimentError::ExperimentNotFound(id))
    }

    /// The experiment record with live per-variant stats filled in.
    pub async fn hydrated_experiment(&self, id: Uuid) -> ExperimentResult<Experiment> {
        let mut experiment = self.experiment(id).await?;
        self.hydrate(&mut experiment).await?;
        Ok(experiment)
    }

    pub async fn hydrate(&self, experiment: &mut Experiment) -> ExperimentResult<()> {
        let mut stats = self.load_stats(experiment.id).await?;
        for variant in &mut experiment.variants {
            variant.stats = stats.remove(&variant.id).unwrap_or_default();
        }
        Ok(())
    }

    pub async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_version: u64,
    ) -> ExperimentResult<bool> {
        self.guard(
            "update_experiment",
            self.inner.update_experiment(experiment, expected_version),
        )
        .await
    }

    pub async fn find_assignment(
        &self,
        experiment_id: Uuid,
        identity_key: &str,
    ) -> ExperimentResult<Option<Assignment>> {
        self.guard(
            "find_assignment",
            self.inner.find_assignment(experiment_id, identity_key),
        )
        .await
    }

    /// The assignment record, or `AssignmentNotFound`.
    pub async fn assignment(&self, id: Uuid) -> ExperimentResult<Assignment> {
        self.guard("get_assignment", self.inner.get_assignment(id))
            .await?
            .ok_or(ExperimentError::AssignmentNotFound(id))
    }

    pub async fn insert_assignment_if_absent(
        &self,
        assignment: &Assignment,
    ) -> ExperimentResult<Assignment> {
        self.guard(
            "insert_assignment_if_absent",
            self.inner.insert_assignment_if_absent(assignment),
        )
        .await
    }

    pub async fn record_observation(
        &self,
        observation: &Observation,
        delta: Option<&StatsDelta>,
    ) -> ExperimentResult<()> {
        self.guard(
            "record_observation",
            self.inner.record_observation(observation, delta),
        )
        .await
    }

    pub async fn load_stats(
        &self,
        experiment_id: Uuid,
    ) -> ExperimentResult<HashMap<Uuid, VariantStats>> {
        self.guard("load_stats", self.inner.load_stats(experiment_id))
            .await
    }
}
