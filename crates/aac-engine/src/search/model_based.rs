//! Sequential model-based search.
//!
//! Starts with a space-filling design drawn from a Halton sequence. Once
//! uncensored observations exist, a censored random forest is fitted on
//! (configuration, projected instance features) -> cost and new
//! configurations are chosen by optimizing an optimistic confidence bound,
//! `-mean + lambda * stddev`, for a batch of exploration weights `lambda`
//! drawn from an exponential distribution.
//!
//! Each weight is optimized as an independent task on a dedicated rayon
//! pool and returns its own ranking. Rankings are merged afterwards against
//! the set of already selected configurations, so no configuration is
//! chosen twice.

use aac_backend::InstanceInfo;
use aac_surrogate::{
    CensoredRandomForest, ForestConfig, HaltonSequence, Observation, Pca, SurrogateError,
};
use aac_types::{
    ConfigId, CostFunction, InstanceId, ParamConfig, ParameterSpace,
};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use super::{draw_valid, SearchStrategy};
use crate::config::{ModelBasedConfig, TunerConfig};
use crate::context::TuningContext;
use crate::errors::TunerResult;

/// Smallest cost the log model accepts.
const LOG_FLOOR: f64 = 1e-15;
/// Local search only moves on improvements above this.
const LS_MIN_IMPROVEMENT: f64 = 1e-5;
/// Entries each per-weight ranking keeps for the merge.
const RANKING_DEPTH: usize = 100;
/// Consecutive invalid Halton points tolerated before the design gives up.
const MAX_INVALID_DESIGN_POINTS: usize = 1000;
const RANDOM_CHUNK: usize = 256;
const DEFAULT_NEIGHBOURHOOD_STDDEV: f64 = 0.2;
const DEFAULT_NEIGHBOURHOOD_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    DefaultNeighbourhood,
    Random,
    LocalSearch,
}

impl Origin {
    fn label(&self) -> &'static str {
        match self {
            Origin::DefaultNeighbourhood => "Default neighbour",
            Origin::Random => "OCB random",
            Origin::LocalSearch => "OCB local search",
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    config: ParamConfig,
    origin: Origin,
}

/// A scored point of one ranking.
#[derive(Debug, Clone)]
struct Ranked {
    config: ParamConfig,
    name: String,
    score: f64,
    origin: Origin,
}

#[derive(Debug, Clone)]
struct Scored {
    config: ParamConfig,
    mean: f64,
    std_dev: f64,
}

impl Scored {
    fn criterion(&self, lambda: f64) -> f64 {
        -self.mean + lambda * self.std_dev
    }
}

/// Read-only view shared by the per-weight acquisition tasks.
struct Acquisition<'a> {
    forest: &'a CensoredRandomForest,
    space: &'a ParameterSpace,
    instances: &'a [Vec<f64>],
    config: &'a ModelBasedConfig,
}

impl Acquisition<'_> {
    fn predict(&self, encoded: &[f64]) -> Option<(f64, f64)> {
        self.forest
            .predict_marginal(encoded, self.instances)
            .ok()
            .map(|p| (p.mean, p.std_dev()))
    }

    /// Hill-climb from `start` through Gaussian neighbourhoods.
    fn local_search(&self, start: &Scored, lambda: f64, rng: &mut ChaCha8Rng) -> (ParamConfig, f64) {
        let mut current = start.config.clone();
        let mut current_score = start.criterion(lambda);
        for _ in 0..self.config.max_local_search_steps {
            let neighbours = self.space.gaussian_neighbourhood(
                &current,
                rng,
                self.config.ls_stddev,
                self.config.ls_samples,
            );
            let best = neighbours
                .into_iter()
                .filter_map(|n| {
                    let encoded = self.space.encode(&n).ok()?;
                    let (mean, std_dev) = self.predict(&encoded)?;
                    Some((n, -mean + lambda * std_dev))
                })
                .max_by(|a, b| a.1.total_cmp(&b.1));
            match best {
                Some((next, score)) if score > current_score + LS_MIN_IMPROVEMENT => {
                    current = next;
                    current_score = score;
                }
                _ => break,
            }
        }
        (current, current_score)
    }

    /// Ranking of candidate points for one exploration weight, best first.
    fn rank(&self, lambda: f64, existing: &[Scored], random: &[Scored], seed: u64) -> Vec<Ranked> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut top: Vec<&Scored> = existing.iter().collect();
        top.sort_by(|a, b| b.criterion(lambda).total_cmp(&a.criterion(lambda)));
        top.truncate(self.config.num_top_ls);

        let mut ranking: Vec<Ranked> = top
            .into_iter()
            .map(|start| {
                let (config, score) = self.local_search(start, lambda, &mut rng);
                Ranked {
                    name: self.space.canonical_name(&config),
                    config,
                    score,
                    origin: Origin::LocalSearch,
                }
            })
            .collect();

        let mut by_score: Vec<&Scored> = random.iter().collect();
        by_score.sort_by(|a, b| b.criterion(lambda).total_cmp(&a.criterion(lambda)));
        ranking.extend(by_score.into_iter().take(RANKING_DEPTH).map(|s| Ranked {
            name: self.space.canonical_name(&s.config),
            config: s.config.clone(),
            score: s.criterion(lambda),
            origin: Origin::Random,
        }));

        ranking.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranking.truncate(RANKING_DEPTH);
        ranking
    }
}

/// Counters reported when the search finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionStats {
    pub from_random: usize,
    pub from_local_search: usize,
    pub model_fits: usize,
    pub random_injections: usize,
}

pub struct ModelBasedSearch {
    config: ModelBasedConfig,
    job_time_limit: f64,
    rng: ChaCha8Rng,
    pool: ThreadPool,
    forest: CensoredRandomForest,
    /// Projected features per instance, indexed like `instance_index`.
    instance_features: Vec<Vec<f64>>,
    instance_index: HashMap<InstanceId, usize>,
    halton: HaltonSequence,
    initial_design_size: usize,
    /// Every candidate this search created.
    generated: Vec<ConfigId>,
    /// Design points and random injections; no further random batch is
    /// injected while one of them is still unevaluated.
    initial_design: Vec<ConfigId>,
    /// Canonical names of configurations already chosen.
    selected: HashSet<String>,
    queue: VecDeque<Queued>,
    stats: SelectionStats,
}

impl ModelBasedSearch {
    pub fn new(
        tuner: &TunerConfig,
        space: &ParameterSpace,
        instances: &[InstanceInfo],
    ) -> TunerResult<Self> {
        if let Some(name) = space.first_unencodable() {
            return Err(SurrogateError::UnsupportedDomain {
                name: name.to_string(),
            }
            .into());
        }
        let config = tuner.search.model_based.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_procs)
            .thread_name(|i| format!("aac-search-{i}"))
            .build()
            .map_err(|e| internal_error!("failed to build search thread pool: {e}"))?;

        let rows: Vec<Vec<f64>> = instances.iter().map(|i| i.features.clone()).collect();
        let pca = Pca::fit(&rows, config.num_pc)?;
        let instance_features = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut projected = pca.transform(row);
                if config.use_instance_index_feature {
                    projected.push(i as f64);
                }
                projected
            })
            .collect();
        let instance_index = instances
            .iter()
            .enumerate()
            .map(|(i, info)| (info.id, i))
            .collect();

        info!(
            parameters = space.len(),
            instances = instances.len(),
            components = pca.n_components(),
            threads = config.num_procs,
            "Model-based search ready"
        );
        Ok(Self {
            forest: CensoredRandomForest::new(ForestConfig::default().with_n_trees(config.n_trees)),
            initial_design_size: config.initial_configs_factor * space.len(),
            job_time_limit: f64::from(tuner.job_cpu_time_limit),
            rng: ChaCha8Rng::seed_from_u64(tuner.seed_search),
            pool,
            instance_features,
            instance_index,
            halton: HaltonSequence::new(space.len()),
            generated: Vec::new(),
            initial_design: Vec::new(),
            selected: HashSet::new(),
            queue: VecDeque::new(),
            stats: SelectionStats::default(),
            config,
        })
    }

    pub fn stats(&self) -> SelectionStats {
        self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn transform(&self, y: f64) -> f64 {
        if !self.config.log_model {
            return y;
        }
        if y <= 0.0 {
            warn!(cost = y, "Non-positive cost under the log model, clamping");
            return LOG_FLOOR.log10();
        }
        y.log10()
    }

    /// One observation per finished run of every known candidate.
    fn training_data(&self, ctx: &TuningContext) -> Vec<Observation> {
        let par1 = CostFunction::Par { penalty_factor: 1.0 };
        let mut data = Vec::new();
        for candidate in ctx.candidates() {
            let Ok(theta) = ctx.space.encode(candidate.config()) else {
                continue;
            };
            for job in candidate.finished_jobs() {
                let Some(&idx) = self.instance_index.get(&job.pair.instance) else {
                    continue;
                };
                let mut features = theta.clone();
                features.extend_from_slice(&self.instance_features[idx]);
                data.push(Observation {
                    features,
                    y: self.transform(par1.single_cost(job)),
                    censored: job.is_censored(),
                });
            }
        }
        data
    }

    /// Whether some design point or injected configuration is still unevaluated, either waiting for
    /// its first runs or with runs in flight.
    fn initial_design_running(&self, ctx: &TuningContext) -> bool {
        self.initial_design.iter().any(|id| {
            ctx.candidate(*id)
                .map(|c| !c.finished && (c.job_count() == 0 || !c.is_done()))
                .unwrap_or(false)
        })
    }

    async fn create(
        &mut self,
        ctx: &mut TuningContext,
        config: ParamConfig,
        name: &str,
    ) -> TunerResult<ConfigId> {
        let id = ctx.create_candidate(config, name).await?;
        self.generated.push(id);
        Ok(id)
    }

    /// Next valid Halton configuration not chosen before.
    fn next_design_point(&mut self, space: &ParameterSpace) -> Option<(ParamConfig, u64)> {
        for _ in 0..MAX_INVALID_DESIGN_POINTS {
            let position = self.halton.position();
            let config = space.config_from_unit_point(&self.halton.next_point());
            if !space.is_valid(&config) {
                continue;
            }
            if self.selected.insert(space.canonical_name(&config)) {
                return Some((config, position));
            }
        }
        None
    }

    fn random_thetas(&mut self, space: &ParameterSpace) -> Vec<ParamConfig> {
        let total = self.config.num_random_theta;
        let chunks = total.div_ceil(RANDOM_CHUNK);
        let seeds: Vec<u64> = (0..chunks).map(|_| self.rng.gen()).collect();
        self.pool.install(|| {
            seeds
                .into_par_iter()
                .enumerate()
                .flat_map_iter(|(chunk, seed)| {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed);
                    let size = RANDOM_CHUNK.min(total - chunk * RANDOM_CHUNK);
                    (0..size)
                        .map(|_| space.random_config(&mut rng))
                        .filter(|c| space.is_valid(c))
                        .collect::<Vec<_>>()
                })
                .collect()
        })
    }

    fn score(&self, space: &ParameterSpace, configs: Vec<ParamConfig>) -> TunerResult<Vec<Scored>> {
        let (configs, encoded): (Vec<ParamConfig>, Vec<Vec<f64>>) = configs
            .into_iter()
            .filter_map(|c| space.encode(&c).ok().map(|e| (c, e)))
            .unzip();
        let predictions = self.pool.install(|| {
            self.forest
                .predict_marginal_batch(&encoded, &self.instance_features)
        })?;
        Ok(configs
            .into_iter()
            .zip(predictions)
            .map(|(config, p)| Scored {
                config,
                mean: p.mean,
                std_dev: p.std_dev(),
            })
            .collect())
    }

    /// Fit the surrogate and optimize the acquisition criterion for a fresh
    /// batch of exploration weights. Returns the chosen configurations.
    fn select(&mut self, ctx: &TuningContext, data: &[Observation]) -> TunerResult<Vec<Queued>> {
        let cap = self.transform(10.0 * self.job_time_limit);
        let mut forest = CensoredRandomForest::new(
            ForestConfig::default()
                .with_n_trees(self.config.n_trees)
                .with_seed(self.rng.gen()),
        );
        self.pool.install(|| forest.fit(data, cap))?;
        self.forest = forest;
        self.stats.model_fits += 1;

        let space = &ctx.space;
        let existing: Vec<ParamConfig> = ctx.candidates().map(|c| c.config().clone()).collect();
        let existing = self.score(space, existing)?;
        let random = self.random_thetas(space);
        let random = self.score(space, random)?;

        let exp = Exp::new(1.0 / self.config.ocb_exp_mu)
            .map_err(|e| config_error!("invalid ocb_exp_mu: {e}"))?;
        let draws: Vec<(f64, u64)> = (0..self.config.queue_size)
            .map(|_| (exp.sample(&mut self.rng), self.rng.gen()))
            .collect();

        let acquisition = Acquisition {
            forest: &self.forest,
            space,
            instances: &self.instance_features,
            config: &self.config,
        };
        let rankings: Vec<Vec<Ranked>> = self.pool.install(|| {
            draws
                .par_iter()
                .map(|&(lambda, seed)| acquisition.rank(lambda, &existing, &random, seed))
                .collect()
        });

        let mut chosen = Vec::new();
        for ranking in rankings {
            let Some(first) = ranking.first() else {
                continue;
            };
            let tied = ranking
                .iter()
                .take_while(|r| r.score == first.score)
                .count();
            let start = self.rng.gen_range(0..tied);
            let mut taken = 0;
            for i in 0..ranking.len() {
                if taken == self.config.num_top_sel {
                    break;
                }
                let pick = if i < tied { &ranking[(start + i) % tied] } else { &ranking[i] };
                if !self.selected.insert(pick.name.clone()) {
                    continue;
                }
                match pick.origin {
                    Origin::Random => self.stats.from_random += 1,
                    _ => self.stats.from_local_search += 1,
                }
                chosen.push(Queued {
                    config: pick.config.clone(),
                    origin: pick.origin,
                });
                taken += 1;
            }
        }
        debug!(
            observations = data.len(),
            existing = existing.len(),
            random = random.len(),
            chosen = chosen.len(),
            "Acquisition round complete"
        );
        Ok(chosen)
    }

    async fn refill(&mut self, ctx: &mut TuningContext, data: &[Observation]) -> TunerResult<()> {
        let chosen = self.select(ctx, data)?;
        let mut fresh = Vec::with_capacity(chosen.len());
        for queued in chosen {
            if ctx.backend.find_config(&queued.config).await?.is_some() {
                warn!(
                    config = %ctx.space.canonical_name(&queued.config),
                    "Selected configuration already exists, skipping"
                );
                continue;
            }
            fresh.push(queued);
        }
        fresh.shuffle(&mut self.rng);
        self.queue.extend(fresh);
        Ok(())
    }

    async fn inject_random(
        &mut self,
        ctx: &mut TuningContext,
        count: usize,
        ids: &mut Vec<ConfigId>,
    ) -> TunerResult<()> {
        let mut injected = 0;
        for _ in 0..count {
            let Some(config) = draw_valid(&ctx.space, &mut self.rng) else {
                warn!(injected, "No valid random configuration found");
                break;
            };
            let name = ctx.space.canonical_name(&config);
            self.selected.insert(name.clone());
            let id = self.create(ctx, config, &name).await?;
            self.initial_design.push(id);
            ids.push(id);
            injected += 1;
        }
        self.stats.random_injections += injected;
        info!(injected, "No uncensored observations, injected random configurations");
        Ok(())
    }

    async fn release(&mut self, ctx: &mut TuningContext, n: usize) -> TunerResult<Vec<ConfigId>> {
        let mut ids = Vec::new();
        while ids.len() < n {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            let id = self.create(ctx, queued.config, queued.origin.label()).await?;
            ids.push(id);
        }
        Ok(ids)
    }
}

#[async_trait]
impl SearchStrategy for ModelBasedSearch {
    fn name(&self) -> &str {
        "model_based"
    }

    async fn incumbent_selected(&mut self, ctx: &mut TuningContext, id: ConfigId) -> TunerResult<()> {
        let config = ctx.candidate(id)?.config().clone();
        self.selected.insert(ctx.space.canonical_name(&config));
        if self.config.initial_design_from_default {
            let neighbours = ctx.space.gaussian_neighbourhood(
                &config,
                &mut self.rng,
                DEFAULT_NEIGHBOURHOOD_STDDEV,
                DEFAULT_NEIGHBOURHOOD_SAMPLES,
            );
            for neighbour in neighbours {
                if self.selected.insert(ctx.space.canonical_name(&neighbour)) {
                    self.queue.push_back(Queued {
                        config: neighbour,
                        origin: Origin::DefaultNeighbourhood,
                    });
                }
            }
            debug!(queued = self.queue.len(), "Queued neighbourhood of the incumbent");
        }
        Ok(())
    }

    async fn generate(&mut self, ctx: &mut TuningContext, n: usize) -> TunerResult<Vec<ConfigId>> {
        let mut ids = Vec::with_capacity(n);

        if self.generated.len() < self.initial_design_size {
            ids.extend(self.release(ctx, n).await?);
            while ids.len() < n && self.generated.len() < self.initial_design_size {
                let Some((config, position)) = self.next_design_point(&ctx.space) else {
                    warn!("No valid initial design point found");
                    self.initial_design_size = self.generated.len();
                    break;
                };
                let id = self.create(ctx, config, &format!("SN: {position}")).await?;
                self.initial_design.push(id);
                ids.push(id);
            }
            if ids.len() == n {
                return Ok(ids);
            }
        }

        if self.queue.len() < self.config.queue_size {
            let data = self.training_data(ctx);
            if data.iter().all(|o| o.censored) {
                // Nothing to fit yet: hand out what is queued, then explore at random.
                ids.extend(self.release(ctx, n - ids.len()).await?);
                if ids.len() < n && !self.initial_design_running(ctx) {
                    self.inject_random(ctx, n - ids.len(), &mut ids).await?;
                }
                return Ok(ids);
            }
            self.refill(ctx, &data).await?;
        }
        let missing = n - ids.len();
        ids.extend(self.release(ctx, missing).await?);
        Ok(ids)
    }

    fn search_finished(&mut self, _ctx: &TuningContext) {
        info!(
            generated = self.generated.len(),
            from_random = self.stats.from_random,
            from_local_search = self.stats.from_local_search,
            model_fits = self.stats.model_fits,
            random_injections = self.stats.random_injections,
            "Model-based search finished"
        );
    }
}
