//! The main tuning loop.
//!
//! Each iteration asks racing how much new work the cluster can absorb,
//! lets search fill it, polls all pending candidates and hands the finished
//! ones back to racing. The loop ends when the CPU budget is spent or no
//! candidate is left pending.

use aac_backend::ExecutionBackend;
use aac_types::{ConfigId, ParamConfig, ParameterSpace};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::TunerConfig;
use crate::context::TuningContext;
use crate::errors::{TunerError, TunerResult};
use crate::events::TunerEvent;
use crate::racing::{RacingRegistry, RacingStrategy};
use crate::search::{SearchRegistry, SearchStrategy};

/// Upper bound on candidates requested from search in one iteration.
const MAX_BATCH: usize = 210;
const CORE_POLL: Duration = Duration::from_secs(10);
const DEFAULT_HINT: &str = "default";
const RACE_HINT: &str = "race";

/// Summary of a completed tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningOutcome {
    pub run_id: Uuid,
    pub experiment_id: u32,
    pub best: ConfigId,
    pub best_name: String,
    pub best_config: ParamConfig,
    /// Cost of the best configuration over all its finished runs.
    pub best_cost: f64,
    pub best_runs: usize,
    pub candidates_generated: usize,
    pub jobs_generated: usize,
    pub comparisons: usize,
    pub cpu_time: f64,
    pub iterations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Orchestrator {
    ctx: TuningContext,
    racing: Box<dyn RacingStrategy>,
    search: Box<dyn SearchStrategy>,
    run_id: Uuid,
}

impl Orchestrator {
    /// Orchestrator with the built-in strategies.
    pub async fn new(
        config: TunerConfig,
        backend: Arc<dyn ExecutionBackend>,
        space: ParameterSpace,
    ) -> TunerResult<Self> {
        Self::with_registries(
            config,
            backend,
            space,
            &SearchRegistry::default(),
            &RacingRegistry::default(),
        )
        .await
    }

    pub async fn with_registries(
        config: TunerConfig,
        backend: Arc<dyn ExecutionBackend>,
        space: ParameterSpace,
        search: &SearchRegistry,
        racing: &RacingRegistry,
    ) -> TunerResult<Self> {
        config.validate()?;
        if space.is_empty() {
            return Err(config_error!("parameter space has no parameters"));
        }
        let course = backend.course().await?;
        let instances = backend.instances().await?;
        let racing = racing.create(&config.racing.strategy, &config)?;
        let search = search.create(&config.search.strategy, &config, &space, &instances)?;
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            experiment = config.experiment_id,
            search = search.name(),
            racing = racing.name(),
            instances = course.initial_length,
            "Configured tuning run"
        );
        Ok(Self {
            ctx: TuningContext::new(backend, config, space, &course),
            racing,
            search,
            run_id,
        })
    }

    /// Send [`TunerEvent`]s to `tx` while tuning.
    pub fn with_events(mut self, tx: Sender<TunerEvent>) -> Self {
        self.ctx = self.ctx.with_events(tx);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn context(&self) -> &TuningContext {
        &self.ctx
    }

    /// Make the given candidates lose the next time racing judges them.
    pub fn stop_evaluation(&mut self, ids: &[ConfigId]) {
        self.racing.stop_evaluation(ids);
    }

    /// Run the tuning loop to completion.
    pub async fn start(mut self) -> TunerResult<TuningOutcome> {
        let started_at = Utc::now();
        self.wait_for_cores().await?;
        if self.ctx.num_instances == 0 {
            return Err(TunerError::NoInstances);
        }

        let incumbent = self.initial_incumbent().await?;
        self.ctx.assign_number(incumbent)?;
        self.racing.init_first(&mut self.ctx, incumbent).await?;
        self.search.incumbent_selected(&mut self.ctx, incumbent).await?;
        self.ctx.emit(TunerEvent::Started {
            experiment_id: self.ctx.config.experiment_id,
            incumbent,
        });
        info!(run_id = %self.run_id, incumbent = %incumbent, "Tuning started");

        let iterations = self.run_loop().await?;
        self.finish(started_at, iterations).await
    }

    async fn wait_for_cores(&self) -> TunerResult<()> {
        let config = &self.ctx.config;
        loop {
            let cores = self.ctx.backend.core_count().await?;
            if cores >= config.min_cores && (config.max_cores == 0 || cores <= config.max_cores) {
                return Ok(());
            }
            info!(
                cores,
                min_cores = config.min_cores,
                max_cores = config.max_cores,
                "Waiting for core count to come into range"
            );
            self.ctx.backend.pause(CORE_POLL).await;
        }
    }

    /// Pick the configuration racing starts from: the best of the
    /// default-hinted (or else all) configurations with the most runs whose
    /// runs follow the course, or a random one.
    async fn initial_incumbent(&mut self) -> TunerResult<ConfigId> {
        let backend = Arc::clone(&self.ctx.backend);
        let mut ids = backend.config_ids(Some(DEFAULT_HINT)).await?;
        if ids.is_empty() {
            ids = backend.config_ids(None).await?;
        }

        let mut run_counts = Vec::with_capacity(ids.len());
        for id in ids {
            run_counts.push((id, backend.job_count(id).await?));
        }
        let most = run_counts.iter().map(|(_, n)| *n).max().unwrap_or(0);

        let course = backend.course().await?;
        let mut valid = Vec::new();
        for (id, _) in run_counts.into_iter().filter(|(_, n)| *n == most) {
            let pairs: Vec<_> = backend.get_runs(id).await?.iter().map(|j| j.pair).collect();
            if course.covers_prefix(&pairs) {
                valid.push(id);
            } else {
                warn!(config = %id, "Runs do not follow the course, ignoring configuration");
            }
        }

        let incumbent = match valid.split_first() {
            None => {
                let mut rng = ChaCha8Rng::seed_from_u64(self.ctx.config.seed_search);
                let config = self.ctx.space.random_config(&mut rng);
                let name = format!(
                    "First Random Configuration {}",
                    self.ctx.space.canonical_name(&config)
                );
                info!("No usable initial configuration, starting from a random one");
                self.ctx.create_candidate(config, &name).await?
            }
            Some((&first, rest)) => {
                self.ctx.load_candidate(first).await?;
                let mut best = first;
                for &id in rest {
                    self.ctx.load_candidate(id).await?;
                    if self.ctx.compare(id, best)? > 0 {
                        best = id;
                    }
                }
                best
            }
        };

        if let Err(e) = self.ctx.space.validate(self.ctx.candidate(incumbent)?.config()) {
            return Err(TunerError::InvalidIncumbent {
                config_id: incumbent,
                reason: e.to_string(),
            });
        }
        Ok(incumbent)
    }

    async fn run_loop(&mut self) -> TunerResult<usize> {
        let clock = Instant::now();
        let mut last_incumbent = self.racing.incumbent();
        let mut iteration = 0;
        loop {
            iteration += 1;
            let span = info_span!(
                "iteration",
                n = iteration,
                wall_time_s = clock.elapsed().as_secs_f64(),
                cpu_time = self.ctx.stats.cpu_time(),
                candidates = self.ctx.stats.candidates_generated(),
                jobs = self.ctx.stats.jobs_generated(),
            );
            let done = self
                .iterate(&mut last_incumbent)
                .instrument(span)
                .await?;
            if done {
                return Ok(iteration);
            }
        }
    }

    /// One pass of the loop. Returns whether tuning is over.
    async fn iterate(&mut self, last_incumbent: &mut Option<ConfigId>) -> TunerResult<bool> {
        let incumbent = self.racing.incumbent();
        if incumbent != *last_incumbent {
            if let Some(old) = *last_incumbent {
                self.ctx.rename_candidate(old, false).await?;
            }
            if let Some(new) = incumbent {
                self.ctx.rename_candidate(new, true).await?;
            }
            *last_incumbent = incumbent;
        }

        let mut generated = Vec::new();
        if !self.ctx.config.budget_exhausted(self.ctx.stats.cpu_time()) {
            let cores = self.ctx.backend.core_count().await?;
            let active = self.ctx.backend.active_job_count().await?;
            let mut desired =
                self.racing
                    .compute_optimal_expansion(&self.ctx, cores, active, self.ctx.pending.len());

            self.race_hinted().await?;

            if let Some(max) = self.ctx.config.max_candidates {
                desired = desired.min(max.saturating_sub(self.ctx.stats.candidates_generated()));
            }
            let n = desired.min(MAX_BATCH);
            if n > 0 {
                generated = self.search.generate(&mut self.ctx, n).await?;
                for &id in &generated {
                    self.ctx.assign_number(id)?;
                }
                self.racing.candidates_created(&mut self.ctx, &generated).await?;
            }
            debug!(cores, active, desired, generated = generated.len(), "Expanded search");
        }

        if generated.is_empty() {
            self.ctx.backend.pause(self.ctx.config.poll_interval()).await;
        }

        if self.ctx.pending.is_empty() {
            info!("No candidates left to evaluate");
            return Ok(true);
        }

        let pending: Vec<ConfigId> = self.ctx.pending.iter().copied().collect();
        let mut finished = Vec::new();
        for id in pending {
            self.ctx.refresh_candidate(id).await?;
            if self.ctx.candidate(id)?.is_done() {
                finished.push(id);
            }
        }
        for id in &finished {
            self.ctx.pending.remove(id);
            self.ctx.rename_candidate(*id, false).await?;
        }
        if !finished.is_empty() {
            let report = self.racing.candidates_finished(&mut self.ctx, &finished).await?;
            if !report.is_empty() {
                info!(
                    capped = report.capped.len(),
                    failed_kills = report.failed_kills,
                    failed_removals = report.failed_removals,
                    "Aggressive capping"
                );
            }
        }

        let cpu_time = self.ctx.stats.cpu_time();
        if self.ctx.config.budget_exhausted(cpu_time) {
            info!(
                cpu_time,
                budget = self.ctx.config.max_tuning_time,
                "Tuning budget exhausted"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Start racing configurations a user flagged with the race hint. The
    /// hint is consumed even when the configuration already has runs.
    async fn race_hinted(&mut self) -> TunerResult<()> {
        let backend = Arc::clone(&self.ctx.backend);
        for id in backend.config_ids(Some(RACE_HINT)).await? {
            backend.set_config_hint(id, "").await?;
            if backend.job_count(id).await? > 0 {
                debug!(config = %id, "Race-hinted configuration already has runs, skipping");
                continue;
            }
            let config = backend.get_config(id).await?;
            if let Err(e) = self.ctx.space.validate(&config) {
                warn!(config = %id, error = %e, "Ignoring invalid race-hinted configuration");
                continue;
            }
            self.ctx.load_candidate(id).await?.search_name = Some("Race hint".to_string());
            self.ctx.stats.add_candidate();
            self.ctx.assign_number(id)?;
            self.racing.candidates_created(&mut self.ctx, &[id]).await?;
            info!(config = %id, "Racing hinted configuration");
        }
        Ok(())
    }

    async fn finish(mut self, started_at: DateTime<Utc>, iterations: usize) -> TunerResult<TuningOutcome> {
        let best = self
            .racing
            .incumbent()
            .ok_or_else(|| internal_error!("tuning ended without an incumbent"))?;
        self.racing.race_finished(&mut self.ctx).await?;
        self.search.search_finished(&self.ctx);

        let stats = self.ctx.stats;
        let candidate = self.ctx.candidate(best)?;
        let best_name = self.ctx.space.canonical_name(candidate.config());
        let best_cost = candidate.cost(&self.ctx.statistic.function);
        info!(
            candidates = stats.candidates_generated(),
            jobs = stats.jobs_generated(),
            comparisons = stats.comparisons(),
            cpu_time = stats.cpu_time(),
            best = %best,
            config = %best_name,
            cost = best_cost,
            "Tuning finished"
        );
        self.ctx.emit(TunerEvent::Finished {
            best,
            cpu_time: stats.cpu_time(),
        });

        Ok(TuningOutcome {
            run_id: self.run_id,
            experiment_id: self.ctx.config.experiment_id,
            best,
            best_name,
            best_config: candidate.config().clone(),
            best_cost,
            best_runs: candidate.counts().finished,
            candidates_generated: stats.candidates_generated(),
            jobs_generated: stats.jobs_generated(),
            comparisons: stats.comparisons(),
            cpu_time: stats.cpu_time(),
            iterations,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelBasedConfig;
    use crate::run;
    use aac_backend::{SimulatedBackend, SimulatedBackendConfig};
    use aac_types::{JobRequest, ParameterValue};

    /// Bowl with its minimum at x = 0.3: runtime 1 s there, up to ~10 s at the edges.
    fn bowl(instances: usize) -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::with_instance_count(
            SimulatedBackendConfig {
                core_count: 8,
                ..Default::default()
            },
            instances,
            Arc::new(|config, pair| {
                let x = match config.get("x") {
                    Some(ParameterValue::Float(x)) => *x,
                    _ => 0.5,
                };
                1.0 + 18.0 * (x - 0.3).powi(2) + f64::from(pair.instance.0 % 3) * 0.1
            }),
        ))
    }

    fn space() -> ParameterSpace {
        ParameterSpace::new().add_real("x", 0.0, 1.0)
    }

    fn config() -> TunerConfig {
        TunerConfig::default()
            .with_job_cpu_time_limit(10)
            .with_parcours(2, 5)
            .with_poll_interval(Duration::from_secs(1))
            .with_max_candidates(15)
    }

    fn with_x(x: f64) -> ParamConfig {
        let mut config = ParamConfig::new();
        config.set("x", ParameterValue::Float(x));
        config
    }

    #[tokio::test]
    async fn test_random_search_improves_on_default() {
        let backend = bowl(5);
        let default = backend.create_config(&with_x(0.9), "default").await.unwrap();
        backend.set_config_hint(default, "default").await.unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let orchestrator = Orchestrator::new(config(), backend.clone(), space())
            .await
            .unwrap()
            .with_events(tx);
        let outcome = orchestrator.start().await.unwrap();

        assert_eq!(outcome.candidates_generated, 15);
        assert!(outcome.iterations > 1);
        assert!(outcome.finished_at >= outcome.started_at);
        // x = 0.9 costs about 7.5 s per run; almost any challenger beats it.
        assert_ne!(outcome.best, default);
        assert!(outcome.best_cost < 7.0);
        assert!(outcome.cpu_time > 0.0);
        assert!(outcome.comparisons > 0);

        let events: Vec<TunerEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(TunerEvent::Started { incumbent, .. }) if *incumbent == default));
        assert!(matches!(events.last(), Some(TunerEvent::Finished { best, .. }) if *best == outcome.best));
        assert!(events
            .iter()
            .any(|e| matches!(e, TunerEvent::IncumbentChanged { .. })));

        let name = backend.config_name(outcome.best).await.unwrap();
        assert!(name.starts_with("_ BEST"));
    }

    #[tokio::test]
    async fn test_model_based_search_runs_to_completion() {
        let backend = bowl(4);
        let model = ModelBasedConfig {
            initial_configs_factor: 4,
            num_random_theta: 200,
            queue_size: 4,
            num_top_ls: 2,
            num_top_sel: 2,
            n_trees: 4,
            num_procs: 2,
            ..ModelBasedConfig::default()
        };
        let config = config()
            .with_search("model_based")
            .with_model_based(model)
            .with_max_candidates(12);
        let outcome = run(config, backend, space()).await.unwrap();
        // The random first incumbent, the design, then model picks.
        assert!(outcome.candidates_generated > 5);
        assert!(outcome.candidates_generated <= 12);
        assert!(outcome.best_cost < 10.0);
    }

    #[tokio::test]
    async fn test_experiment_without_instances_fails() {
        let backend = bowl(0);
        let result = run(config(), backend, space()).await;
        assert!(matches!(result, Err(TunerError::NoInstances)));
    }

    #[tokio::test]
    async fn test_invalid_default_configuration_is_fatal() {
        let backend = bowl(3);
        let id = backend.create_config(&with_x(4.0), "default").await.unwrap();
        backend.set_config_hint(id, "default").await.unwrap();
        let result = run(config(), backend, space()).await;
        assert!(matches!(
            result,
            Err(TunerError::InvalidIncumbent { config_id, .. }) if config_id == id
        ));
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_rejected_up_front() {
        let result = Orchestrator::new(config().with_racing("irace"), bowl(3), space()).await;
        assert!(matches!(result, Err(TunerError::UnknownStrategy { .. })));
    }

    #[tokio::test]
    async fn test_initial_incumbent_prefers_most_runs_on_the_course() {
        let backend = bowl(4);
        let fresh = backend.create_config(&with_x(0.3), "fresh").await.unwrap();
        let seasoned = backend.create_config(&with_x(0.6), "seasoned").await.unwrap();
        let stray = backend.create_config(&with_x(0.31), "stray").await.unwrap();
        for id in [fresh, seasoned, stray] {
            backend.set_config_hint(id, "default").await.unwrap();
        }
        backend
            .launch_jobs(seasoned, &[JobRequest::from_course(10, 0); 2])
            .await
            .unwrap();
        // Two runs, but not on the first course entries.
        let course = backend.course().await.unwrap();
        let off_course: Vec<JobRequest> = course.entries[2..4]
            .iter()
            .map(|p| JobRequest::for_pair(*p, 10, 0))
            .collect();
        backend.launch_jobs(stray, &off_course).await.unwrap();

        let outcome = run(config().with_max_candidates(0), backend, space())
            .await
            .unwrap();
        assert_eq!(outcome.best, seasoned);
        assert_eq!(outcome.candidates_generated, 0);
        assert_eq!(outcome.best_runs, 5);
    }

    #[tokio::test]
    async fn test_random_first_incumbent_when_nothing_is_registered() {
        let backend = bowl(3);
        let outcome = run(config().with_max_candidates(1), backend.clone(), space())
            .await
            .unwrap();
        assert_eq!(outcome.candidates_generated, 1);
        let name = backend.config_name(outcome.best).await.unwrap();
        assert!(name.contains("First Random Configuration"));
    }

    #[tokio::test]
    async fn test_race_hinted_configurations_are_raced() {
        let backend = bowl(3);
        let default = backend.create_config(&with_x(0.9), "default").await.unwrap();
        backend.set_config_hint(default, "default").await.unwrap();
        let hinted = backend.create_config(&with_x(0.3), "user pick").await.unwrap();
        backend.set_config_hint(hinted, "race").await.unwrap();

        let outcome = run(config().with_max_candidates(0), backend.clone(), space())
            .await
            .unwrap();
        assert!(backend.config_ids(Some("race")).await.unwrap().is_empty());
        assert!(backend.job_count(hinted).await.unwrap() > 0);
        assert_eq!(outcome.best, hinted);
        assert_eq!(outcome.candidates_generated, 1);
    }

    #[tokio::test]
    async fn test_race_hint_is_cleared_on_configurations_with_runs() {
        let backend = bowl(3);
        let default = backend.create_config(&with_x(0.9), "default").await.unwrap();
        backend.set_config_hint(default, "default").await.unwrap();
        let evaluated = backend.create_config(&with_x(0.3), "evaluated").await.unwrap();
        backend
            .launch_jobs(evaluated, &[JobRequest::from_course(10, 0)])
            .await
            .unwrap();
        backend.set_config_hint(evaluated, "race").await.unwrap();

        let outcome = run(config().with_max_candidates(0), backend.clone(), space())
            .await
            .unwrap();
        assert!(backend.config_ids(Some("race")).await.unwrap().is_empty());
        assert_eq!(backend.job_count(evaluated).await.unwrap(), 1);
        assert_eq!(outcome.best, default);
        assert_eq!(outcome.candidates_generated, 0);
    }

    #[tokio::test]
    async fn test_race_hinted_configuration_counts_toward_max_candidates() {
        let backend = bowl(3);
        let default = backend.create_config(&with_x(0.9), "default").await.unwrap();
        backend.set_config_hint(default, "default").await.unwrap();
        let hinted = backend.create_config(&with_x(0.4), "user pick").await.unwrap();
        backend.set_config_hint(hinted, "race").await.unwrap();

        let outcome = run(config().with_max_candidates(3), backend.clone(), space())
            .await
            .unwrap();
        // The hinted configuration plus two from search.
        assert_eq!(outcome.candidates_generated, 3);
        assert!(backend.job_count(hinted).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_budget_stops_tuning() {
        let backend = bowl(5);
        let config = config()
            .with_max_tuning_time(40.0)
            .with_max_candidates(1000);
        let outcome = run(config, backend, space()).await.unwrap();
        assert!(outcome.cpu_time > 40.0);
        assert!(outcome.candidates_generated < 1000);
    }

    #[tokio::test]
    async fn test_waits_for_minimum_core_count() {
        let backend = bowl(3);
        backend.set_core_count(0);
        let config = config().with_cores(2, 0).with_max_candidates(0);
        let orchestrator = Orchestrator::new(config, backend.clone(), space())
            .await
            .unwrap();
        let handle = tokio::spawn(orchestrator.start());
        // The orchestrator keeps polling in virtual time until cores appear.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(backend.clock() >= 10.0);
        backend.set_core_count(4);
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.candidates_generated, 1);
    }
}
