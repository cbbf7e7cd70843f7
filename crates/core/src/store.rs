//! Storage collaborator contract.
//!
//! The engine never holds a lock across a storage round trip. Instead the
//! store exposes atomic primitives: a versioned compare-and-swap on the
//! experiment record, an insert-if-absent on (experiment, identity) for
//! assignments, and commutative stats deltas. Each primitive writes its
//! row and the matching counters together, so a failed call leaves no
//! partial state behind.

use crate::accumulator::StatsDelta;
use crate::error::StoreResult;
use crate::types::{Assignment, Experiment, Observation, VariantStats};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Insert a new experiment. Returns false if the id already exists.
    async fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<bool>;

    async fn get_experiment(&self, id: Uuid) -> StoreResult<Option<Experiment>>;

    /// Replace the experiment record if its stored version equals
    /// `expected_version`. On success the stored version becomes
    /// `expected_version + 1`.
    async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_version: u64,
    ) -> StoreResult<bool>;

    async fn find_assignment(
        &self,
        experiment_id: Uuid,
        identity_key: &str,
    ) -> StoreResult<Option<Assignment>>;

    async fn get_assignment(&self, id: Uuid) -> StoreResult<Option<Assignment>>;

    /// Persist `assignment` unless one already exists for its
    /// (experiment, identity) pair. Returns whichever row is stored.
    ///
    /// A newly stored enrolled assignment also increments its variant's
    /// assignment counter in the same atomic step.
    async fn insert_assignment_if_absent(&self, assignment: &Assignment)
        -> StoreResult<Assignment>;

    /// Append `observation` and, when given, apply `delta` to the stats of
    /// the observation's variant as one atomic step.
    async fn record_observation(
        &self,
        observation: &Observation,
        delta: Option<&StatsDelta>,
    ) -> StoreResult<()>;

    /// Live stats for every variant of the experiment that has any.
    async fn load_stats(&self, experiment_id: Uuid) -> StoreResult<HashMap<Uuid, VariantStats>>;
}
