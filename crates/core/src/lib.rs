pub mod accumulator;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod store;
pub mod types;

pub use accumulator::{StatsAccumulator, StatsDelta};
pub use config::AppConfig;
pub use error::{ExperimentError, ExperimentResult, StoreError, StoreResult};
pub use event_bus::{AuditEvent, AuditEventType, AuditSink};
pub use store::ExperimentStore;
