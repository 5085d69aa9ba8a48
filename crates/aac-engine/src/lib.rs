// Automated algorithm configuration engine
// Races candidate configurations against an incumbent on a shared compute backend

#[macro_use]
pub mod errors;

pub mod candidate;
pub mod config;
pub mod context;
pub mod events;
pub mod orchestrator;
pub mod racing;
pub mod search;

use aac_backend::ExecutionBackend;
use aac_types::ParameterSpace;
use std::sync::Arc;

pub use candidate::{Candidate, JobCounts};
pub use config::{BackendCredentials, ModelBasedConfig, RacingConfig, SearchConfig, TunerConfig};
pub use context::{RunStats, TuningContext};
pub use errors::{TunerError, TunerResult};
pub use events::TunerEvent;
pub use orchestrator::{Orchestrator, TuningOutcome};
pub use racing::{CappedRacing, CappingReport, RacingRegistry, RacingStrategy};
pub use search::{ModelBasedSearch, RandomSearch, SearchRegistry, SearchStrategy};

/// Tune `space` on `backend` with the strategies named in `config`.
pub async fn run(
    config: TunerConfig,
    backend: Arc<dyn ExecutionBackend>,
    space: ParameterSpace,
) -> TunerResult<TuningOutcome> {
    Orchestrator::new(config, backend, space).await?.start().await
}
