//! In-process experiment store backed by DashMap.
//! Entry-level locking gives each primitive the atomicity the engine relies
//! on. Used for development, single-node deployments and as the test fake.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use experiment_core::error::StoreResult;
use experiment_core::types::{Assignment, Experiment, Observation, VariantStats};
use experiment_core::{ExperimentStore, StatsAccumulator, StatsDelta};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    experiments: DashMap<Uuid, Experiment>,
    assignments: DashMap<Uuid, Assignment>,
    identities: DashMap<(Uuid, String), Uuid>,
    observations: DashMap<Uuid, Vec<Observation>>,
    /// Per-variant stats keyed by experiment id.
    stats: DashMap<Uuid, HashMap<Uuid, VariantStats>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All observations recorded for an experiment, in append order.
    pub fn observations(&self, experiment_id: &Uuid) -> Vec<Observation> {
        self.observations
            .get(experiment_id)
            .map(|o| o.value().clone())
            .unwrap_or_default()
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    fn apply_delta(&self, experiment_id: Uuid, variant_id: Uuid, delta: &StatsDelta) {
        let mut variants = self.stats.entry(experiment_id).or_default();
        StatsAccumulator::apply(variants.entry(variant_id).or_default(), delta);
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<bool> {
        match self.experiments.entry(experiment.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(experiment.clone());
                Ok(true)
            }
        }
    }

    async fn get_experiment(&self, id: Uuid) -> StoreResult<Option<Experiment>> {
        Ok(self.experiments.get(&id).map(|e| e.value().clone()))
    }

    async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_version: u64,
    ) -> StoreResult<bool> {
        let Some(mut current) = self.experiments.get_mut(&experiment.id) else {
            return Ok(false);
        };
        if current.version != expected_version {
            debug!(
                experiment_id = %experiment.id,
                expected = expected_version,
                actual = current.version,
                "Experiment version mismatch"
            );
            return Ok(false);
        }
        let mut next = experiment.clone();
        next.version = expected_version + 1;
        *current = next;
        Ok(true)
    }

    async fn find_assignment(
        &self,
        experiment_id: Uuid,
        identity_key: &str,
    ) -> StoreResult<Option<Assignment>> {
        let id = match self.identities.get(&(experiment_id, identity_key.to_string())) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.assignments.get(&id).map(|a| a.value().clone()))
    }

    async fn get_assignment(&self, id: Uuid) -> StoreResult<Option<Assignment>> {
        Ok(self.assignments.get(&id).map(|a| a.value().clone()))
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: &Assignment,
    ) -> StoreResult<Assignment> {
        let key = (assignment.experiment_id, assignment.identity_key.clone());
        // The identity entry stays locked until the assignment row and its
        // counter are visible, so a racing writer always finds both.
        let existing = match self.identities.entry(key) {
            Entry::Occupied(slot) => *slot.get(),
            Entry::Vacant(slot) => {
                self.assignments.insert(assignment.id, assignment.clone());
                if assignment.enrolled {
                    self.apply_delta(
                        assignment.experiment_id,
                        assignment.variant_id,
                        &StatsDelta::Assignment,
                    );
                }
                slot.insert(assignment.id);
                return Ok(assignment.clone());
            }
        };
        Ok(self
            .assignments
            .get(&existing)
            .map(|a| a.value().clone())
            .unwrap_or_else(|| assignment.clone()))
    }

    async fn record_observation(
        &self,
        observation: &Observation,
        delta: Option<&StatsDelta>,
    ) -> StoreResult<()> {
        let mut log = self.observations.entry(observation.experiment_id).or_default();
        if let Some(delta) = delta {
            self.apply_delta(observation.experiment_id, observation.variant_id, delta);
        }
        log.push(observation.clone());
        Ok(())
    }

    async fn load_stats(&self, experiment_id: Uuid) -> StoreResult<HashMap<Uuid, VariantStats>> {
        Ok(self
            .stats
            .get(&experiment_id)
            .map(|variants| variants.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use experiment_core::types::{ExperimentConfig, ExperimentStatus, MetricKind};
    use std::sync::Arc;

    fn experiment() -> Experiment {
        let now = Utc::now();
        Experiment {
            id: Uuid::new_v4(),
            config: ExperimentConfig::new("checkout-button", "conversion"),
            variants: Vec::new(),
            status: ExperimentStatus::Draft,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            concluded_at: None,
            winner_variant_id: None,
        }
    }

    fn assignment(experiment_id: Uuid, identity: &str) -> Assignment {
        Assignment {
            id: Uuid::new_v4(),
            experiment_id,
            variant_id: Uuid::new_v4(),
            identity_key: identity.to_string(),
            enrolled: true,
            variant_config: serde_json::json!({}),
            context: None,
            assigned_at: Utc::now(),
        }
    }

    fn observation(assignment: &Assignment, metric: &str, value: f64) -> Observation {
        Observation {
            id: Uuid::new_v4(),
            assignment_id: assignment.id,
            experiment_id: assignment.experiment_id,
            variant_id: assignment.variant_id,
            metric: metric.to_string(),
            value,
            metadata: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_experiment_is_conditional() {
        let store = MemoryStore::new();
        let exp = experiment();
        assert!(store.insert_experiment(&exp).await.unwrap());
        assert!(!store.insert_experiment(&exp).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_experiment_compare_and_swap() {
        let store = MemoryStore::new();
        let mut exp = experiment();
        store.insert_experiment(&exp).await.unwrap();

        exp.status = ExperimentStatus::Running;
        assert!(store.update_experiment(&exp, 0).await.unwrap());
        // Stale writer loses.
        assert!(!store.update_experiment(&exp, 0).await.unwrap());

        let stored = store.get_experiment(exp.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, ExperimentStatus::Running);
    }

    #[tokio::test]
    async fn test_first_assignment_wins() {
        let store = MemoryStore::new();
        let experiment_id = Uuid::new_v4();
        let first = assignment(experiment_id, "user-1");
        let second = assignment(experiment_id, "user-1");

        let stored_first = store.insert_assignment_if_absent(&first).await.unwrap();
        let stored_second = store.insert_assignment_if_absent(&second).await.unwrap();
        assert_eq!(stored_first.id, first.id);
        assert_eq!(stored_second.id, first.id);
        assert_eq!(store.assignment_count(), 1);

        let found = store.find_assignment(experiment_id, "user-1").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_assignment(experiment_id, "user-2").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_conditional_insert_single_row() {
        let store = Arc::new(MemoryStore::new());
        let experiment_id = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_assignment_if_absent(&assignment(experiment_id, "shared"))
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.assignment_count(), 1);
    }

    #[tokio::test]
    async fn test_enrolled_insert_counts_once() {
        let store = MemoryStore::new();
        let experiment_id = Uuid::new_v4();
        let first = assignment(experiment_id, "user-1");
        let mut retry = assignment(experiment_id, "user-1");
        retry.variant_id = first.variant_id;

        store.insert_assignment_if_absent(&first).await.unwrap();
        store.insert_assignment_if_absent(&retry).await.unwrap();

        let mut outside = assignment(experiment_id, "user-2");
        outside.enrolled = false;
        store.insert_assignment_if_absent(&outside).await.unwrap();

        let stats = store.load_stats(experiment_id).await.unwrap();
        assert_eq!(stats[&first.variant_id].assignments, 1);
        assert!(!stats.contains_key(&outside.variant_id));
    }

    #[tokio::test]
    async fn test_observations_accumulate() {
        let store = MemoryStore::new();
        let first = assignment(Uuid::new_v4(), "user-1");
        let (e, v) = (first.experiment_id, first.variant_id);
        store.insert_assignment_if_absent(&first).await.unwrap();

        for value in [1.0, 0.0, 1.0] {
            let delta = StatsDelta::Observation {
                metric: "click".into(),
                kind: MetricKind::Binary,
                value,
            };
            store
                .record_observation(&observation(&first, "click", value), Some(&delta))
                .await
                .unwrap();
        }
        // Stored without aggregation.
        store
            .record_observation(&observation(&first, "click", 1.0), None)
            .await
            .unwrap();

        let stats = store.load_stats(e).await.unwrap();
        let variant = &stats[&v];
        assert_eq!(variant.assignments, 1);
        assert_eq!(variant.metric("click").unwrap().alpha, 3.0);
        assert_eq!(variant.metric("click").unwrap().beta, 2.0);
        assert_eq!(store.observations(&e).len(), 4);
        assert!(store.load_stats(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_isolated_per_experiment() {
        let store = MemoryStore::new();
        let a = assignment(Uuid::new_v4(), "user-1");
        let b = assignment(Uuid::new_v4(), "user-1");
        store.insert_assignment_if_absent(&a).await.unwrap();
        store.insert_assignment_if_absent(&b).await.unwrap();

        let stats = store.load_stats(a.experiment_id).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key(&a.variant_id));
    }
}
