//! Named-operation surface.
//!
//! Transports map their method names onto [`Operation`] and hand the raw
//! JSON params to [`dispatch`]. Only the operations listed here are callable.

use crate::lifecycle::ExperimentEngine;
use experiment_core::types::{ExperimentConfig, VariantConfig};
use experiment_core::{ExperimentError, ExperimentResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateExperiment,
    StartExperiment,
    PauseExperiment,
    ResumeExperiment,
    AssignVariant,
    RecordObservation,
    GetExperimentReport,
    ConcludeExperiment,
    GetExperiment,
    UpdateVariantWeights,
}

impl Operation {
    pub const ALL: [Operation; 10] = [
        Operation::CreateExperiment,
        Operation::StartExperiment,
        Operation::PauseExperiment,
        Operation::ResumeExperiment,
        Operation::AssignVariant,
        Operation::RecordObservation,
        Operation::GetExperimentReport,
        Operation::ConcludeExperiment,
        Operation::GetExperiment,
        Operation::UpdateVariantWeights,
    ];

    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateExperiment => "createExperiment",
            Operation::StartExperiment => "startExperiment",
            Operation::PauseExperiment => "pauseExperiment",
            Operation::ResumeExperiment => "resumeExperiment",
            Operation::AssignVariant => "assignVariant",
            Operation::RecordObservation => "recordObservation",
            Operation::GetExperimentReport => "getExperimentReport",
            Operation::ConcludeExperiment => "concludeExperiment",
            Operation::GetExperiment => "getExperiment",
            Operation::UpdateVariantWeights => "updateVariantWeights",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ExperimentError::UnknownOperation(s.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateExperimentParams {
    pub config: ExperimentConfig,
    pub variants: Vec<VariantConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ExperimentIdParams {
    pub experiment_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AssignVariantParams {
    pub experiment_id: Uuid,
    pub identity_key: String,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RecordObservationParams {
    pub assignment_id: Uuid,
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ConcludeExperimentParams {
    pub experiment_id: Uuid,
    #[serde(default)]
    pub winner_variant_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVariantWeightsParams {
    pub experiment_id: Uuid,
    pub weights: HashMap<Uuid, f64>,
}

fn params<T: serde::de::DeserializeOwned>(raw: Value) -> ExperimentResult<T> {
    Ok(serde_json::from_value(raw)?)
}

/// Decode `raw` for `operation`, run it and encode the result.
pub async fn dispatch(
    engine: &ExperimentEngine,
    operation: Operation,
    raw: Value,
) -> ExperimentResult<Value> {
    debug!(operation = %operation, "Dispatching operation");
    let result = match operation {
        Operation::CreateExperiment => {
            let p: CreateExperimentParams = params(raw)?;
            serde_json::to_value(engine.create_experiment(p.config, p.variants).await?)?
        }
        Operation::StartExperiment => {
            let p: ExperimentIdParams = params(raw)?;
            serde_json::to_value(engine.start_experiment(p.experiment_id).await?)?
        }
        Operation::PauseExperiment => {
            let p: ExperimentIdParams = params(raw)?;
            serde_json::to_value(engine.pause_experiment(p.experiment_id).await?)?
        }
        Operation::ResumeExperiment => {
            let p: ExperimentIdParams = params(raw)?;
            serde_json::to_value(engine.resume_experiment(p.experiment_id).await?)?
        }
        Operation::AssignVariant => {
            let p: AssignVariantParams = params(raw)?;
            serde_json::to_value(
                engine
                    .assign_variant(p.experiment_id, &p.identity_key, p.context)
                    .await?,
            )?
        }
        Operation::RecordObservation => {
            let p: RecordObservationParams = params(raw)?;
            serde_json::to_value(
                engine
                    .record_observation(p.assignment_id, &p.metric, p.value, p.metadata)
                    .await?,
            )?
        }
        Operation::GetExperimentReport => {
            let p: ExperimentIdParams = params(raw)?;
            serde_json::to_value(engine.get_experiment_report(p.experiment_id).await?)?
        }
        Operation::ConcludeExperiment => {
            let p: ConcludeExperimentParams = params(raw)?;
            serde_json::to_value(
                engine
                    .conclude_experiment(p.experiment_id, p.winner_variant_id)
                    .await?,
            )?
        }
        Operation::GetExperiment => {
            let p: ExperimentIdParams = params(raw)?;
            serde_json::to_value(engine.get_experiment(p.experiment_id).await?)?
        }
        Operation::UpdateVariantWeights => {
            let p: UpdateVariantWeightsParams = params(raw)?;
            serde_json::to_value(
                engine
                    .update_variant_weights(p.experiment_id, p.weights)
                    .await?,
            )?
        }
    };
    Ok(result)
}
