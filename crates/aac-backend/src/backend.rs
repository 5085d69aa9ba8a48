//! Execution backend abstraction.

use aac_types::{ConfigId, Course, InstanceId, JobId, JobRequest, JobResult, ParamConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A benchmark instance with its numeric features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub name: String,
    pub features: Vec<f64>,
}

/// Errors surfaced by backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("configuration not found: {config_id}")]
    ConfigNotFound { config_id: ConfigId },
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },
    #[error("invalid job request: {message}")]
    InvalidRequest { message: String },
    #[error("job {job_id} could not be killed: {reason}")]
    KillFailed { job_id: JobId, reason: String },
    #[error("backend connection failed: {message}")]
    Connection { message: String },
    #[error("backend internal error: {message}")]
    Internal { message: String },
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Everything the engine needs from the system that runs target-program jobs
/// and stores their results. A backend is bound to a single experiment.
///
/// Implementations may talk to a shared database and a grid of workers, or
/// simulate execution locally (see [`super::simulated::SimulatedBackend`]).
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn experiment_id(&self) -> u32;

    // -- Jobs -----------------------------------------------------------------

    /// Launch a batch of jobs for one configuration. The batch becomes visible
    /// as a whole or not at all.
    async fn launch_jobs(
        &self,
        config_id: ConfigId,
        requests: &[JobRequest],
    ) -> BackendResult<Vec<JobId>>;

    async fn get_job(&self, id: JobId) -> BackendResult<JobResult>;

    /// Fetch several jobs at once. Unknown ids are an error.
    async fn get_jobs(&self, ids: &[JobId]) -> BackendResult<HashMap<JobId, JobResult>>;

    /// All jobs ever launched for a configuration.
    async fn get_runs(&self, config_id: ConfigId) -> BackendResult<Vec<JobResult>>;

    async fn kill_job(&self, id: JobId) -> BackendResult<()>;

    // -- Configurations -------------------------------------------------------

    async fn create_config(&self, params: &ParamConfig, name: &str) -> BackendResult<ConfigId>;

    /// Delete a configuration together with its jobs.
    async fn remove_config(&self, id: ConfigId) -> BackendResult<()>;

    /// Id of an existing configuration with exactly these parameters.
    async fn find_config(&self, params: &ParamConfig) -> BackendResult<Option<ConfigId>>;

    async fn get_config(&self, id: ConfigId) -> BackendResult<ParamConfig>;

    async fn config_name(&self, id: ConfigId) -> BackendResult<String>;

    /// Configurations of the experiment, optionally only those carrying `hint`.
    async fn config_ids(&self, hint: Option<&str>) -> BackendResult<Vec<ConfigId>>;

    async fn set_config_hint(&self, id: ConfigId, hint: &str) -> BackendResult<()>;

    async fn rename_config(&self, id: ConfigId, name: &str) -> BackendResult<()>;

    // -- Capacity -------------------------------------------------------------

    /// Number of worker cores currently serving the experiment.
    async fn core_count(&self) -> BackendResult<usize>;

    /// Jobs of the experiment that are not finished yet.
    async fn active_job_count(&self) -> BackendResult<usize>;

    async fn job_count(&self, config_id: ConfigId) -> BackendResult<usize>;

    // -- Benchmark ------------------------------------------------------------

    async fn course(&self) -> BackendResult<Course>;

    async fn instances(&self) -> BackendResult<Vec<InstanceInfo>>;

    /// Let time pass: a real sleep for live backends, a virtual clock
    /// advance for simulated ones.
    async fn pause(&self, duration: Duration);
}
