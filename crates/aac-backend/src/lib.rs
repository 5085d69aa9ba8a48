//! # aac-backend
//!
//! The execution backend contract consumed by the configuration engine, and
//! an in-process simulated backend with a virtual clock for testing and
//! offline experiments.

pub mod backend;
pub mod simulated;

pub use backend::{BackendError, BackendResult, ExecutionBackend, InstanceInfo};
pub use simulated::{RuntimeModel, SimulatedBackend, SimulatedBackendConfig};
