//! Search strategies: propose new candidate configurations.

pub mod model_based;
pub mod random;

use aac_backend::InstanceInfo;
use aac_types::{ConfigId, ParamConfig, ParameterSpace};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;

use crate::config::TunerConfig;
use crate::context::TuningContext;
use crate::errors::{TunerError, TunerResult};

pub use model_based::ModelBasedSearch;
pub use random::RandomSearch;

/// Random draws tried before concluding the space has no valid configuration left.
const MAX_DRAW_ATTEMPTS: usize = 1000;

/// A uniformly random configuration that passes validation.
pub(crate) fn draw_valid<R: Rng + ?Sized>(space: &ParameterSpace, rng: &mut R) -> Option<ParamConfig> {
    (0..MAX_DRAW_ATTEMPTS)
        .map(|_| space.random_config(rng))
        .find(|config| space.is_valid(config))
}

#[async_trait]
pub trait SearchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once the first incumbent is known.
    async fn incumbent_selected(
        &mut self,
        _ctx: &mut TuningContext,
        _id: ConfigId,
    ) -> TunerResult<()> {
        Ok(())
    }

    /// Create up to `n` new candidates in the backend. May return fewer,
    /// including none, when the strategy is waiting for data.
    async fn generate(&mut self, ctx: &mut TuningContext, n: usize) -> TunerResult<Vec<ConfigId>>;

    /// Called once when tuning ends.
    fn search_finished(&mut self, _ctx: &TuningContext) {}
}

pub type SearchFactory =
    fn(&TunerConfig, &ParameterSpace, &[InstanceInfo]) -> TunerResult<Box<dyn SearchStrategy>>;

fn random_factory(
    config: &TunerConfig,
    _space: &ParameterSpace,
    _instances: &[InstanceInfo],
) -> TunerResult<Box<dyn SearchStrategy>> {
    Ok(Box::new(RandomSearch::new(config.seed_search)))
}

fn model_based_factory(
    config: &TunerConfig,
    space: &ParameterSpace,
    instances: &[InstanceInfo],
) -> TunerResult<Box<dyn SearchStrategy>> {
    Ok(Box::new(ModelBasedSearch::new(config, space, instances)?))
}

/// Search strategies by name.
pub struct SearchRegistry {
    factories: BTreeMap<String, SearchFactory>,
}

impl Default for SearchRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("random", random_factory);
        registry.register("ROAR", random_factory);
        registry.register("model_based", model_based_factory);
        registry.register("SMBO", model_based_factory);
        registry
    }
}

impl SearchRegistry {
    pub fn register(&mut self, name: &str, factory: SearchFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        name: &str,
        config: &TunerConfig,
        space: &ParameterSpace,
        instances: &[InstanceInfo],
    ) -> TunerResult<Box<dyn SearchStrategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TunerError::UnknownStrategy {
                kind: "search",
                name: name.to_string(),
            })?;
        factory(config, space, instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aac_types::ParameterKind;

    #[test]
    fn test_registry_resolves_aliases() {
        let registry = SearchRegistry::default();
        let config = TunerConfig::default();
        let space = ParameterSpace::new().add_real("x", 0.0, 1.0);
        assert_eq!(
            registry.create("ROAR", &config, &space, &[]).unwrap().name(),
            "random"
        );
        assert_eq!(
            registry.create("SMBO", &config, &space, &[]).unwrap().name(),
            "model_based"
        );
        assert!(registry.names().any(|n| n == "model_based"));
        assert!(matches!(
            registry.create("genetic", &config, &space, &[]),
            Err(TunerError::UnknownStrategy { kind: "search", .. })
        ));
    }

    #[test]
    fn test_unencodable_space_is_rejected_for_model_based() {
        let registry = SearchRegistry::default();
        let space = ParameterSpace::new().add_real("x", 0.0, 1.0).add_mixed(
            "m",
            vec![ParameterKind::Flag, ParameterKind::Real { low: 0.0, high: 1.0 }],
        );
        let config = TunerConfig::default();
        assert!(matches!(
            registry.create("model_based", &config, &space, &[]),
            Err(TunerError::Surrogate(_))
        ));
        assert!(registry.create("random", &config, &space, &[]).is_ok());
    }
}
