//! Decision algorithms for experiments: multi-armed bandit variant
//! selection and Bayesian control-vs-treatment comparison.

pub mod bayesian;
pub mod numeric;
pub mod selector;

pub use bayesian::{BayesianTester, ComparedArm, TestParams};
pub use selector::{ArmSnapshot, Posterior, VariantSelector};
