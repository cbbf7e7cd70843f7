//! Experimentation engine: sticky assignment, lifecycle state machine,
//! reporting and the named-operation surface transports bind to.

#![warn(clippy::unwrap_used)]

pub mod ledger;
pub mod lifecycle;
pub mod rpc;
pub mod storage;

pub use ledger::{AssignmentLedger, Resolution};
pub use lifecycle::ExperimentEngine;
pub use rpc::{dispatch, Operation};
pub use storage::GuardedStore;
