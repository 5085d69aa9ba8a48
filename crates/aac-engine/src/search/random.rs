use aac_types::ConfigId;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use super::{draw_valid, SearchStrategy};
use crate::context::TuningContext;
use crate::errors::TunerResult;

/// Uniformly random configurations.
#[derive(Debug)]
pub struct RandomSearch {
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

#[async_trait]
impl SearchStrategy for RandomSearch {
    fn name(&self) -> &str {
        "random"
    }

    async fn generate(&mut self, ctx: &mut TuningContext, n: usize) -> TunerResult<Vec<ConfigId>> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(config) = draw_valid(&ctx.space, &mut self.rng) else {
                warn!(generated = ids.len(), "No valid random configuration found");
                break;
            };
            let name = ctx.space.canonical_name(&config);
            ids.push(ctx.create_candidate(config, &name).await?);
        }
        debug!(generated = ids.len(), "Generated random configurations");
        Ok(ids)
    }
}
