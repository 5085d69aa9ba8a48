//! Shared state of a tuning run.
//!
//! [`TuningContext`] owns the candidate registry, the pending working set and
//! the run counters. Racing and search strategies receive it by mutable
//! reference, so every backend interaction that changes a candidate goes
//! through one place.

use aac_backend::ExecutionBackend;
use aac_types::{
    ConfigId, CostStatistic, Course, JobId, JobRequest, JobResult, ParamConfig, ParameterSpace,
};
use crossbeam_channel::Sender;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::candidate::Candidate;
use crate::config::TunerConfig;
use crate::errors::{TunerError, TunerResult};
use crate::events::TunerEvent;

/// Counters of a tuning run. Only ever incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunStats {
    candidates_generated: usize,
    jobs_generated: usize,
    comparisons: usize,
    cpu_time: f64,
}

impl RunStats {
    pub fn add_candidate(&mut self) {
        self.candidates_generated += 1;
    }

    pub fn add_jobs(&mut self, n: usize) {
        self.jobs_generated += n;
    }

    pub fn add_comparison(&mut self) {
        self.comparisons += 1;
    }

    pub fn add_cpu_time(&mut self, seconds: f64) {
        if seconds > 0.0 {
            self.cpu_time += seconds;
        }
    }

    pub fn candidates_generated(&self) -> usize {
        self.candidates_generated
    }

    pub fn jobs_generated(&self) -> usize {
        self.jobs_generated
    }

    pub fn comparisons(&self) -> usize {
        self.comparisons
    }

    /// Cumulated CPU time of all finished jobs, in seconds.
    pub fn cpu_time(&self) -> f64 {
        self.cpu_time
    }
}

pub struct TuningContext {
    pub backend: Arc<dyn ExecutionBackend>,
    pub config: TunerConfig,
    pub space: ParameterSpace,
    pub statistic: CostStatistic,
    candidates: HashMap<ConfigId, Candidate>,
    /// Candidates with outstanding work that racing has not yet judged.
    pub pending: BTreeSet<ConfigId>,
    /// Number of benchmark instances; the course's initial length.
    pub num_instances: usize,
    pub stats: RunStats,
    /// Randomness used for racing decisions.
    pub rng: ChaCha8Rng,
    events: Option<Sender<TunerEvent>>,
    next_number: u32,
}

impl TuningContext {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        config: TunerConfig,
        space: ParameterSpace,
        course: &Course,
    ) -> Self {
        let statistic = config.statistic();
        let rng = ChaCha8Rng::seed_from_u64(config.seed_racing);
        Self {
            backend,
            statistic,
            space,
            candidates: HashMap::new(),
            pending: BTreeSet::new(),
            num_instances: course.initial_length,
            stats: RunStats::default(),
            rng,
            events: None,
            next_number: 0,
            config,
        }
    }

    pub fn with_events(mut self, tx: Sender<TunerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn emit(&self, event: TunerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    pub fn candidate(&self, id: ConfigId) -> TunerResult<&Candidate> {
        self.candidates
            .get(&id)
            .ok_or(TunerError::UnknownCandidate(id))
    }

    pub fn candidate_mut(&mut self, id: ConfigId) -> TunerResult<&mut Candidate> {
        self.candidates
            .get_mut(&id)
            .ok_or(TunerError::UnknownCandidate(id))
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn contains(&self, id: ConfigId) -> bool {
        self.candidates.contains_key(&id)
    }

    /// Upper bound on the runs the incumbent is evaluated on.
    pub fn max_incumbent_runs(&self) -> usize {
        self.config.max_parcours_expansion_factor * self.num_instances
    }

    /// Job priority of `id`: earlier candidates run first.
    pub fn priority_of(&self, id: ConfigId) -> i32 {
        let number = self
            .candidates
            .get(&id)
            .and_then(|c| c.number)
            .unwrap_or(0);
        i32::MAX - i32::try_from(number).unwrap_or(i32::MAX)
    }

    #[cfg(test)]
    pub(crate) fn insert_candidate(&mut self, candidate: Candidate) {
        self.candidates.insert(candidate.id(), candidate);
    }

    /// Register a new configuration with the backend and track it.
    pub async fn create_candidate(
        &mut self,
        config: ParamConfig,
        name: &str,
    ) -> TunerResult<ConfigId> {
        let id = self.backend.create_config(&config, name).await?;
        let mut candidate = Candidate::new(id, config);
        candidate.search_name = Some(name.to_string());
        self.candidates.insert(id, candidate);
        self.stats.add_candidate();
        debug!(candidate = %id, name, "Created candidate");
        Ok(id)
    }

    /// Track a configuration that already exists in the backend, loading
    /// its parameters and runs.
    pub async fn load_candidate(&mut self, id: ConfigId) -> TunerResult<&mut Candidate> {
        if !self.candidates.contains_key(&id) {
            let config = self.backend.get_config(id).await?;
            let mut candidate = Candidate::new(id, config);
            for job in self.backend.get_runs(id).await? {
                candidate.put_job(job);
            }
            self.candidates.insert(id, candidate);
        }
        self.candidate_mut(id)
    }

    /// Give `id` the next display number unless it already has one.
    pub fn assign_number(&mut self, id: ConfigId) -> TunerResult<u32> {
        let next = self.next_number;
        let candidate = self.candidate_mut(id)?;
        if let Some(n) = candidate.number {
            return Ok(n);
        }
        candidate.number = Some(next);
        self.next_number += 1;
        Ok(next)
    }

    /// Reload the runs of `id`; the CPU time of newly finished runs is added
    /// to the budget.
    pub async fn refresh_candidate(&mut self, id: ConfigId) -> TunerResult<()> {
        let candidate = self
            .candidates
            .get_mut(&id)
            .ok_or(TunerError::UnknownCandidate(id))?;
        let cpu = candidate.refresh(self.backend.as_ref()).await?;
        self.stats.add_cpu_time(cpu);
        Ok(())
    }

    /// Paired comparison of `a` against `b`; positive when `a` is better.
    pub fn compare(&mut self, a: ConfigId, b: ConfigId) -> TunerResult<i32> {
        let result = self.candidate(a)?.compare(self.candidate(b)?, &self.statistic);
        self.stats.add_comparison();
        Ok(result)
    }

    fn merge_jobs(&mut self, id: ConfigId, jobs: Vec<JobResult>) -> TunerResult<()> {
        let candidate = self.candidate_mut(id)?;
        for job in jobs {
            candidate.put_job(job);
        }
        Ok(())
    }

    async fn launch(&mut self, id: ConfigId, requests: &[JobRequest]) -> TunerResult<usize> {
        if requests.is_empty() {
            return Ok(0);
        }
        self.candidate(id)?;
        let ids: Vec<JobId> = self.backend.launch_jobs(id, requests).await?;
        let jobs = self.backend.get_jobs(&ids).await?;
        let mut launched: Vec<_> = jobs.into_values().collect();
        launched.sort_by_key(|j| j.id);
        self.merge_jobs(id, launched)?;
        self.stats.add_jobs(ids.len());
        Ok(ids.len())
    }

    /// Launch `n` runs on the next course entries `id` has not run yet, in a
    /// single batch.
    pub async fn expand_candidate(
        &mut self,
        id: ConfigId,
        n: usize,
        priority: i32,
    ) -> TunerResult<usize> {
        let limit = self.config.job_cpu_time_limit;
        let requests = vec![JobRequest::from_course(limit, priority); n];
        let launched = self.launch(id, &requests).await?;
        debug!(candidate = %id, launched, "Expanded candidate");
        Ok(launched)
    }

    /// Launch for `to` up to `n` runs on pairs `from` has finished and `to`
    /// has never run. Returns the number launched.
    pub async fn add_random_job(
        &mut self,
        n: usize,
        to: ConfigId,
        from: ConfigId,
        priority: i32,
    ) -> TunerResult<usize> {
        self.refresh_candidate(to).await?;
        self.refresh_candidate(from).await?;
        let pairs = {
            let target = self.candidates.get(&to).ok_or(TunerError::UnknownCandidate(to))?;
            let source = self
                .candidates
                .get(&from)
                .ok_or(TunerError::UnknownCandidate(from))?;
            target.missing_pairs_from(source, n, &mut self.rng)
        };
        let limit = self.config.job_cpu_time_limit;
        let requests: Vec<JobRequest> = pairs
            .into_iter()
            .map(|p| JobRequest::for_pair(p, limit, priority))
            .collect();
        self.launch(to, &requests).await
    }

    /// Update the backend name of `id` to reflect its racing state.
    pub async fn rename_candidate(&self, id: ConfigId, best: bool) -> TunerResult<()> {
        let candidate = self.candidate(id)?;
        let mut parts = Vec::new();
        if best {
            parts.push("_ BEST".to_string());
        }
        if let Some(n) = candidate.incumbent_number {
            parts.push(format!("-{n}-"));
        }
        if let Some(n) = candidate.number {
            parts.push(n.to_string());
        }
        if let Some(name) = candidate.name() {
            parts.push(name);
        }
        let counts = candidate.counts();
        parts.push(format!("Runs: {}/{}", counts.finished, counts.total()));
        parts.push(format!("ID: {id}"));
        if let Err(e) = self.backend.rename_config(id, &parts.join(" ")).await {
            warn!(candidate = %id, error = %e, "Failed to rename configuration");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aac_backend::{SimulatedBackend, SimulatedBackendConfig};

    pub(crate) async fn context(instances: usize, cores: usize) -> TuningContext {
        let backend = SimulatedBackend::with_instance_count(
            SimulatedBackendConfig {
                core_count: cores,
                ..Default::default()
            },
            instances,
            Arc::new(|_, pair| 1.0 + f64::from(pair.instance.0)),
        );
        let course = backend.course().await.unwrap();
        let space = ParameterSpace::new().add_real("x", 0.0, 1.0);
        TuningContext::new(Arc::new(backend), TunerConfig::default(), space, &course)
    }

    #[tokio::test]
    async fn test_expand_takes_course_entries_in_order() {
        let mut ctx = context(5, 4).await;
        let id = ctx
            .create_candidate(ctx.space.default_config(), "default")
            .await
            .unwrap();
        assert_eq!(ctx.expand_candidate(id, 3, 0).await.unwrap(), 3);
        let course = ctx.backend.course().await.unwrap();
        let pairs: Vec<_> = ctx.candidate(id).unwrap().jobs().iter().map(|j| j.pair).collect();
        assert_eq!(pairs, course.entries[..3].to_vec());
        assert_eq!(ctx.stats.jobs_generated(), 3);
        assert_eq!(ctx.stats.candidates_generated(), 1);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let mut ctx = context(4, 4).await;
        let id = ctx
            .create_candidate(ctx.space.default_config(), "c")
            .await
            .unwrap();
        ctx.expand_candidate(id, 4, 0).await.unwrap();
        ctx.backend.pause(std::time::Duration::from_secs(100)).await;

        ctx.refresh_candidate(id).await.unwrap();
        let counts = ctx.candidate(id).unwrap().counts();
        let cpu = ctx.stats.cpu_time();
        ctx.refresh_candidate(id).await.unwrap();
        assert_eq!(ctx.candidate(id).unwrap().counts(), counts);
        assert_eq!(ctx.stats.cpu_time(), cpu);
        assert_eq!(counts.finished, 4);
        // Runtimes are 1 + instance index.
        assert!((cpu - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_add_random_job_never_duplicates() {
        let mut ctx = context(6, 8).await;
        let from = ctx
            .create_candidate(ctx.space.default_config(), "from")
            .await
            .unwrap();
        let mut other = ctx.space.default_config();
        other.set("x", aac_types::ParameterValue::Float(0.25));
        let to = ctx.create_candidate(other, "to").await.unwrap();

        ctx.expand_candidate(from, 5, 0).await.unwrap();
        ctx.expand_candidate(to, 2, 0).await.unwrap();
        ctx.backend.pause(std::time::Duration::from_secs(100)).await;

        // from has finished 5 pairs; to shares the first 2 of them.
        let launched = ctx.add_random_job(10, to, from, 0).await.unwrap();
        assert_eq!(launched, 3);
        let again = ctx.add_random_job(10, to, from, 0).await.unwrap();
        assert_eq!(again, 0);

        let candidate = ctx.candidate(to).unwrap();
        assert_eq!(candidate.pairs().len(), candidate.job_count());
        assert_eq!(candidate.job_count(), 5);
    }

    #[tokio::test]
    async fn test_create_and_fetch_round_trip() {
        let mut ctx = context(2, 2).await;
        let mut config = ctx.space.default_config();
        config.set("x", aac_types::ParameterValue::Float(0.75));
        let name = ctx.space.canonical_name(&config);
        let id = ctx.create_candidate(config, &name).await.unwrap();

        let fetched = ctx.backend.get_config(id).await.unwrap();
        assert_eq!(ctx.space.canonical_name(&fetched), name);
        assert_eq!(ctx.backend.find_config(&fetched).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_numbers_are_assigned_once() {
        let mut ctx = context(2, 2).await;
        let a = ctx
            .create_candidate(ctx.space.default_config(), "a")
            .await
            .unwrap();
        assert_eq!(ctx.assign_number(a).unwrap(), 0);
        assert_eq!(ctx.assign_number(a).unwrap(), 0);
        assert!(ctx.assign_number(ConfigId(999)).is_err());
    }
}
