//! Audit event bus: the sink trait experiment audit events are emitted into.
//!
//! The engine accepts an `Arc<dyn AuditSink>`. Emission is fire-and-forget:
//! implementations must never block the caller and never surface failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExperimentCreated,
    ExperimentStarted,
    ExperimentPaused,
    ExperimentResumed,
    ExperimentConcluded,
    WeightsUpdated,
    VariantAssigned,
    ObservationRecorded,
    ReportGenerated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ExperimentCreated => "experiment_created",
            AuditEventType::ExperimentStarted => "experiment_started",
            AuditEventType::ExperimentPaused => "experiment_paused",
            AuditEventType::ExperimentResumed => "experiment_resumed",
            AuditEventType::ExperimentConcluded => "experiment_concluded",
            AuditEventType::WeightsUpdated => "weights_updated",
            AuditEventType::VariantAssigned => "variant_assigned",
            AuditEventType::ObservationRecorded => "observation_recorded",
            AuditEventType::ReportGenerated => "report_generated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub experiment_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub assignment_id: Option<Uuid>,
    pub identity_key: Option<String>,
    pub detail: serde_json::Value,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, experiment_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            experiment_id,
            variant_id: None,
            assignment_id: None,
            identity_key: None,
            detail: serde_json::Value::Null,
            node_id: "local".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_variant(mut self, variant_id: Uuid) -> Self {
        self.variant_id = Some(variant_id);
        self
    }

    pub fn with_assignment(mut self, assignment_id: Uuid) -> Self {
        self.assignment_id = Some(assignment_id);
        self
    }

    pub fn with_identity(mut self, identity_key: impl Into<String>) -> Self {
        self.identity_key = Some(identity_key.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Best-effort audit telemetry collaborator.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// No-op sink for tests and deployments without an audit backend.
pub struct NoOpSink;

impl AuditSink for NoOpSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn count_type(&self, event_type: AuditEventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl AuditSink for CaptureSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

pub fn noop_sink() -> Arc<dyn AuditSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
