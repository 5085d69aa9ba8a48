//! Racing strategies: decide which candidates survive, when the incumbent
//! changes and how much new work the cluster can absorb.

pub mod capped;

use aac_types::ConfigId;
use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::config::TunerConfig;
use crate::context::TuningContext;
use crate::errors::{TunerError, TunerResult};

pub use capped::CappedRacing;

/// Outcome of one aggressive capping pass. Kill and removal failures are
/// counted here instead of aborting the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CappingReport {
    pub capped: Vec<ConfigId>,
    pub failed_kills: usize,
    pub failed_removals: usize,
}

impl CappingReport {
    pub fn is_empty(&self) -> bool {
        self.capped.is_empty()
    }
}

#[async_trait]
pub trait RacingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Current incumbent, once `init_first` has run.
    fn incumbent(&self) -> Option<ConfigId>;

    /// Make `id` the first incumbent and evaluate it on the initial course.
    async fn init_first(&mut self, ctx: &mut TuningContext, id: ConfigId) -> TunerResult<()>;

    /// How many new candidates the compute capacity justifies.
    fn compute_optimal_expansion(
        &self,
        ctx: &TuningContext,
        cores: usize,
        active_jobs: usize,
        pending: usize,
    ) -> usize;

    /// Seed freshly generated candidates with runs and start racing them.
    async fn candidates_created(
        &mut self,
        ctx: &mut TuningContext,
        ids: &[ConfigId],
    ) -> TunerResult<()>;

    /// Judge candidates whose outstanding work has completed.
    async fn candidates_finished(
        &mut self,
        ctx: &mut TuningContext,
        ids: &[ConfigId],
    ) -> TunerResult<CappingReport>;

    /// Flag candidates to lose the next time they are judged.
    fn stop_evaluation(&mut self, ids: &[ConfigId]);

    /// Up to `n` best candidates, best first.
    fn best_candidates(&self, n: usize) -> Vec<ConfigId>;

    /// Called once when tuning ends.
    async fn race_finished(&mut self, ctx: &mut TuningContext) -> TunerResult<()>;
}

pub type RacingFactory = fn(&TunerConfig) -> Box<dyn RacingStrategy>;

/// Racing strategies by name.
pub struct RacingRegistry {
    factories: BTreeMap<String, RacingFactory>,
}

impl Default for RacingRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("capped", |_| Box::new(CappedRacing::new()));
        registry.register("Roar_aggrCapping", |_| Box::new(CappedRacing::new()));
        registry.register("roar", |_| Box::new(CappedRacing::without_capping()));
        registry.register("ROAR", |_| Box::new(CappedRacing::without_capping()));
        registry
    }
}

impl RacingRegistry {
    pub fn register(&mut self, name: &str, factory: RacingFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str, config: &TunerConfig) -> TunerResult<Box<dyn RacingStrategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TunerError::UnknownStrategy {
                kind: "racing",
                name: name.to_string(),
            })?;
        Ok(factory(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_aliases() {
        let registry = RacingRegistry::default();
        let config = TunerConfig::default();
        assert_eq!(registry.create("capped", &config).unwrap().name(), "capped");
        assert_eq!(
            registry.create("Roar_aggrCapping", &config).unwrap().name(),
            "capped"
        );
        assert_eq!(registry.create("ROAR", &config).unwrap().name(), "roar");
        assert!(matches!(
            registry.create("irace", &config),
            Err(TunerError::UnknownStrategy { kind: "racing", .. })
        ));
    }
}
