//! Simulated execution backend for offline tuning runs and tests.
//!
//! Keeps configurations and jobs in memory and executes jobs on a fixed
//! number of virtual cores. Time only moves when [`ExecutionBackend::pause`]
//! is called, so a whole tuning run completes as fast as the engine can
//! drive it. Job runtimes come from a pluggable [`RuntimeModel`].

use aac_types::{
    ConfigId, Course, InstanceId, InstanceSeed, JobId, JobRequest, JobResult, JobStatus,
    ParamConfig, ResultCode,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{BackendError, BackendResult, ExecutionBackend, InstanceInfo};

/// Runtime in CPU seconds of a configuration on one instance/seed pair.
/// Non-finite values are reported as crashes.
pub type RuntimeModel = Arc<dyn Fn(&ParamConfig, &InstanceSeed) -> f64 + Send + Sync>;

/// Configuration for the simulated backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedBackendConfig {
    pub experiment_id: u32,
    /// Number of virtual cores executing jobs in parallel.
    pub core_count: usize,
    /// Virtual seconds that pass per second of requested pause.
    pub time_multiplicator: f64,
    /// Seed for course generation.
    pub seed: u64,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        Self {
            experiment_id: 1,
            core_count: 8,
            time_multiplicator: 1.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct ConfigRecord {
    params: ParamConfig,
    name: String,
    hint: Option<String>,
}

#[derive(Debug, Clone)]
struct JobRecord {
    result: JobResult,
    started_at: Option<f64>,
    /// Modelled runtime; `None` for jobs that crash.
    runtime: Option<f64>,
}

impl JobRecord {
    /// Virtual time at which a running job completes.
    fn finish_at(&self) -> Option<f64> {
        let start = self.started_at?;
        let limit = f64::from(self.result.time_limit);
        Some(start + self.runtime.map(|r| r.min(limit)).unwrap_or(0.0))
    }
}

#[derive(Debug)]
struct SimState {
    clock: f64,
    next_config: u64,
    next_job: u64,
    core_count: usize,
    configs: BTreeMap<ConfigId, ConfigRecord>,
    jobs: BTreeMap<JobId, JobRecord>,
    course: Course,
    instances: Vec<InstanceInfo>,
    rng: ChaCha8Rng,
    fail_cleanup: bool,
}

impl SimState {
    fn require_config(&self, id: ConfigId) -> BackendResult<&ConfigRecord> {
        self.configs
            .get(&id)
            .ok_or(BackendError::ConfigNotFound { config_id: id })
    }

    /// Append one fresh seed per instance to the course.
    fn extend_course(&mut self) {
        let mut ids: Vec<InstanceId> = self.instances.iter().map(|i| i.id).collect();
        ids.shuffle(&mut self.rng);
        for id in ids {
            let seed = self.rng.gen_range(0..u64::from(u32::MAX));
            self.course.entries.push(InstanceSeed::new(id, seed));
        }
        debug!(length = self.course.len(), "Extended course");
    }

    /// Start queued jobs on free cores, highest priority first.
    fn schedule(&mut self) {
        let running = self.jobs.values().filter(|j| j.result.is_running()).count();
        let free = self.core_count.saturating_sub(running);
        if free == 0 {
            return;
        }
        let mut queued: Vec<(i32, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.result.is_not_started())
            .map(|j| (j.result.priority, j.result.id))
            .collect();
        queued.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let clock = self.clock;
        for (_, id) in queued.into_iter().take(free) {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.result.status = JobStatus::Running;
                job.started_at = Some(clock);
            }
        }
    }

    fn complete(job: &mut JobRecord) {
        let limit = f64::from(job.result.time_limit);
        let (code, time) = match job.runtime {
            None => (ResultCode::Crashed, 0.0),
            Some(r) if r >= limit => (ResultCode::Timeout, limit),
            Some(r) => (ResultCode::Success, r),
        };
        job.result.status = JobStatus::Finished(code);
        job.result.result_time = time;
    }

    /// Move the virtual clock forward by `dt`, completing jobs on the way.
    fn advance(&mut self, dt: f64) {
        let target = self.clock + dt.max(0.0);
        loop {
            self.schedule();
            let next = self
                .jobs
                .values()
                .filter(|j| j.result.is_running())
                .filter_map(|j| j.finish_at())
                .fold(f64::INFINITY, f64::min);
            if next > target {
                break;
            }
            self.clock = self.clock.max(next);
            let clock = self.clock;
            for job in self.jobs.values_mut() {
                if job.result.is_running() && job.finish_at().is_some_and(|t| t <= clock) {
                    Self::complete(job);
                }
            }
        }
        self.clock = target;
        self.schedule();
    }
}

/// In-process backend with a virtual clock.
pub struct SimulatedBackend {
    config: SimulatedBackendConfig,
    model: RuntimeModel,
    state: Mutex<SimState>,
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SimulatedBackend {
    pub fn new(
        config: SimulatedBackendConfig,
        instances: Vec<InstanceInfo>,
        model: RuntimeModel,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut state = SimState {
            clock: 0.0,
            next_config: 1,
            next_job: 1,
            core_count: config.core_count,
            configs: BTreeMap::new(),
            jobs: BTreeMap::new(),
            course: Course::new(Vec::new(), instances.len()),
            instances,
            rng,
            fail_cleanup: false,
        };
        if !state.instances.is_empty() {
            state.extend_course();
        }
        info!(
            experiment = config.experiment_id,
            instances = state.instances.len(),
            cores = config.core_count,
            "Simulated backend ready"
        );
        Self {
            config,
            model,
            state: Mutex::new(state),
        }
    }

    /// Backend with `count` synthetic instances carrying three random features each.
    pub fn with_instance_count(
        config: SimulatedBackendConfig,
        count: usize,
        model: RuntimeModel,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));
        let instances = (0..count)
            .map(|i| InstanceInfo {
                id: InstanceId(i as u32),
                name: format!("instance-{i}"),
                features: (0..3).map(|_| rng.gen_range(0.0..100.0)).collect(),
            })
            .collect();
        Self::new(config, instances, model)
    }

    /// Current virtual time in seconds.
    pub fn clock(&self) -> f64 {
        self.state.lock().clock
    }

    pub fn set_core_count(&self, cores: usize) {
        self.state.lock().core_count = cores;
    }

    /// Make `kill_job` and `remove_config` fail, to exercise best-effort cleanup.
    pub fn set_fail_cleanup(&self, fail: bool) {
        self.state.lock().fail_cleanup = fail;
    }

    /// Run the clock until every launched job has finished.
    pub fn run_to_completion(&self) {
        let mut state = self.state.lock();
        while state.jobs.values().any(|j| !j.result.is_finished()) {
            let next = state
                .jobs
                .values()
                .filter(|j| j.result.is_running())
                .filter_map(|j| j.finish_at())
                .fold(f64::INFINITY, f64::min);
            let dt = if next.is_finite() {
                next - state.clock
            } else {
                0.0
            };
            let before = state.jobs.values().filter(|j| j.result.is_finished()).count();
            state.advance(dt);
            let after = state.jobs.values().filter(|j| j.result.is_finished()).count();
            if after == before && state.core_count == 0 {
                break;
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    fn experiment_id(&self) -> u32 {
        self.config.experiment_id
    }

    async fn launch_jobs(
        &self,
        config_id: ConfigId,
        requests: &[JobRequest],
    ) -> BackendResult<Vec<JobId>> {
        let mut state = self.state.lock();
        let params = state.require_config(config_id)?.params.clone();
        if let Some(bad) = requests.iter().find(|r| r.time_limit == 0) {
            return Err(BackendError::InvalidRequest {
                message: format!("time limit must be positive, got {}", bad.time_limit),
            });
        }

        let mut taken: HashSet<InstanceSeed> = state
            .jobs
            .values()
            .filter(|j| j.result.config_id == config_id)
            .map(|j| j.result.pair)
            .collect();

        let mut pairs = Vec::with_capacity(requests.len());
        for request in requests {
            let pair = match request.pair {
                Some(pair) => pair,
                None => loop {
                    let next = state.course.entries.iter().find(|p| !taken.contains(*p));
                    match next {
                        Some(pair) => break *pair,
                        None if state.instances.is_empty() => {
                            return Err(BackendError::InvalidRequest {
                                message: "experiment has no instances".to_string(),
                            })
                        }
                        None => state.extend_course(),
                    }
                },
            };
            taken.insert(pair);
            pairs.push(pair);
        }

        let mut ids = Vec::with_capacity(requests.len());
        for (request, pair) in requests.iter().zip(pairs) {
            let id = JobId(state.next_job);
            state.next_job += 1;
            let runtime = (self.model)(&params, &pair);
            let record = JobRecord {
                result: JobResult {
                    id,
                    config_id,
                    pair,
                    status: JobStatus::NotStarted,
                    result_time: 0.0,
                    time_limit: request.time_limit,
                    priority: request.priority,
                },
                started_at: None,
                runtime: runtime.is_finite().then_some(runtime.max(0.0)),
            };
            state.jobs.insert(id, record);
            ids.push(id);
        }
        state.schedule();
        debug!(config = %config_id, jobs = ids.len(), "Launched jobs");
        Ok(ids)
    }

    async fn get_job(&self, id: JobId) -> BackendResult<JobResult> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .map(|j| j.result.clone())
            .ok_or(BackendError::JobNotFound { job_id: id })
    }

    async fn get_jobs(&self, ids: &[JobId]) -> BackendResult<HashMap<JobId, JobResult>> {
        let state = self.state.lock();
        ids.iter()
            .map(|id| {
                state
                    .jobs
                    .get(id)
                    .map(|j| (*id, j.result.clone()))
                    .ok_or(BackendError::JobNotFound { job_id: *id })
            })
            .collect()
    }

    async fn get_runs(&self, config_id: ConfigId) -> BackendResult<Vec<JobResult>> {
        let state = self.state.lock();
        state.require_config(config_id)?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.result.config_id == config_id)
            .map(|j| j.result.clone())
            .collect())
    }

    async fn kill_job(&self, id: JobId) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.fail_cleanup {
            return Err(BackendError::KillFailed {
                job_id: id,
                reason: "worker unreachable".to_string(),
            });
        }
        let clock = state.clock;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(BackendError::JobNotFound { job_id: id })?;
        if !job.result.is_finished() {
            job.result.status = JobStatus::Finished(ResultCode::Killed);
            job.result.result_time = job.started_at.map(|s| clock - s).unwrap_or(0.0);
        }
        Ok(())
    }

    async fn create_config(&self, params: &ParamConfig, name: &str) -> BackendResult<ConfigId> {
        let mut state = self.state.lock();
        let id = ConfigId(state.next_config);
        state.next_config += 1;
        state.configs.insert(
            id,
            ConfigRecord {
                params: params.clone(),
                name: name.to_string(),
                hint: None,
            },
        );
        Ok(id)
    }

    async fn remove_config(&self, id: ConfigId) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.fail_cleanup {
            return Err(BackendError::Connection {
                message: "database unavailable".to_string(),
            });
        }
        state
            .configs
            .remove(&id)
            .ok_or(BackendError::ConfigNotFound { config_id: id })?;
        state.jobs.retain(|_, j| j.result.config_id != id);
        Ok(())
    }

    async fn find_config(&self, params: &ParamConfig) -> BackendResult<Option<ConfigId>> {
        Ok(self
            .state
            .lock()
            .configs
            .iter()
            .find(|(_, c)| &c.params == params)
            .map(|(id, _)| *id))
    }

    async fn get_config(&self, id: ConfigId) -> BackendResult<ParamConfig> {
        Ok(self.state.lock().require_config(id)?.params.clone())
    }

    async fn config_name(&self, id: ConfigId) -> BackendResult<String> {
        Ok(self.state.lock().require_config(id)?.name.clone())
    }

    async fn config_ids(&self, hint: Option<&str>) -> BackendResult<Vec<ConfigId>> {
        Ok(self
            .state
            .lock()
            .configs
            .iter()
            .filter(|(_, c)| hint.is_none() || c.hint.as_deref() == hint)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn set_config_hint(&self, id: ConfigId, hint: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        let record = state
            .configs
            .get_mut(&id)
            .ok_or(BackendError::ConfigNotFound { config_id: id })?;
        record.hint = (!hint.is_empty()).then(|| hint.to_string());
        Ok(())
    }

    async fn rename_config(&self, id: ConfigId, name: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        let record = state
            .configs
            .get_mut(&id)
            .ok_or(BackendError::ConfigNotFound { config_id: id })?;
        record.name = name.to_string();
        Ok(())
    }

    async fn core_count(&self) -> BackendResult<usize> {
        Ok(self.state.lock().core_count)
    }

    async fn active_job_count(&self) -> BackendResult<usize> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| !j.result.is_finished())
            .count())
    }

    async fn job_count(&self, config_id: ConfigId) -> BackendResult<usize> {
        let state = self.state.lock();
        state.require_config(config_id)?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.result.config_id == config_id)
            .count())
    }

    async fn course(&self) -> BackendResult<Course> {
        Ok(self.state.lock().course.clone())
    }

    async fn instances(&self) -> BackendResult<Vec<InstanceInfo>> {
        Ok(self.state.lock().instances.clone())
    }

    async fn pause(&self, duration: Duration) {
        let dt = duration.as_secs_f64() * self.config.time_multiplicator;
        self.state.lock().advance(dt);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aac_types::ParameterValue;

    fn constant_model(runtime: f64) -> RuntimeModel {
        Arc::new(move |_, _| runtime)
    }

    fn backend(cores: usize, instances: usize, runtime: f64) -> SimulatedBackend {
        let config = SimulatedBackendConfig {
            core_count: cores,
            ..Default::default()
        };
        SimulatedBackend::with_instance_count(config, instances, constant_model(runtime))
    }

    fn params(x: i64) -> ParamConfig {
        let mut p = ParamConfig::new();
        p.set("x", ParameterValue::Int(x));
        p
    }

    #[tokio::test]
    async fn test_course_driven_launch_follows_course() {
        let b = backend(4, 5, 1.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        let jobs = b
            .launch_jobs(id, &[JobRequest::from_course(10, 0); 3])
            .await
            .unwrap();
        let course = b.course().await.unwrap();
        let runs = b.get_jobs(&jobs).await.unwrap();
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(runs[job].pair, course.entries[i]);
        }
    }

    #[tokio::test]
    async fn test_course_extends_when_exhausted() {
        let b = backend(4, 2, 1.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        b.launch_jobs(id, &[JobRequest::from_course(10, 0); 5])
            .await
            .unwrap();
        let course = b.course().await.unwrap();
        assert!(course.len() >= 5);
        assert_eq!(course.initial_length, 2);
    }

    #[tokio::test]
    async fn test_invalid_batch_launches_nothing() {
        let b = backend(4, 3, 1.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        let requests = [JobRequest::from_course(10, 0), JobRequest::from_course(0, 0)];
        assert!(b.launch_jobs(id, &requests).await.is_err());
        assert_eq!(b.job_count(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pause_runs_jobs_on_cores() {
        let b = backend(2, 4, 3.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        b.launch_jobs(id, &[JobRequest::from_course(10, 0); 4])
            .await
            .unwrap();
        assert_eq!(b.active_job_count().await.unwrap(), 4);

        b.pause(Duration::from_secs(3)).await;
        assert_eq!(b.active_job_count().await.unwrap(), 2);

        b.pause(Duration::from_secs(3)).await;
        assert_eq!(b.active_job_count().await.unwrap(), 0);
        let runs = b.get_runs(id).await.unwrap();
        assert!(runs.iter().all(|r| r.is_successful() && r.result_time == 3.0));
    }

    #[tokio::test]
    async fn test_slow_runs_time_out_at_limit() {
        let b = backend(1, 1, 50.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        let jobs = b
            .launch_jobs(id, &[JobRequest::from_course(5, 0)])
            .await
            .unwrap();
        b.run_to_completion();
        let job = b.get_job(jobs[0]).await.unwrap();
        assert_eq!(job.status, JobStatus::Finished(ResultCode::Timeout));
        assert_eq!(job.result_time, 5.0);
    }

    #[tokio::test]
    async fn test_higher_priority_runs_first() {
        let b = backend(1, 3, 1.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        // The single core is taken by the first launch.
        b.launch_jobs(id, &[JobRequest::from_course(10, 0)])
            .await
            .unwrap();
        let low = b
            .launch_jobs(id, &[JobRequest::from_course(10, 1)])
            .await
            .unwrap();
        let high = b
            .launch_jobs(id, &[JobRequest::from_course(10, 5)])
            .await
            .unwrap();
        b.pause(Duration::from_secs(1)).await;
        assert!(b.get_job(high[0]).await.unwrap().is_running());
        assert!(b.get_job(low[0]).await.unwrap().is_not_started());
    }

    #[tokio::test]
    async fn test_kill_and_remove() {
        let b = backend(1, 2, 100.0);
        let id = b.create_config(&params(1), "one").await.unwrap();
        let jobs = b
            .launch_jobs(id, &[JobRequest::from_course(200, 0)])
            .await
            .unwrap();

        b.set_fail_cleanup(true);
        assert!(b.kill_job(jobs[0]).await.is_err());
        b.set_fail_cleanup(false);

        b.kill_job(jobs[0]).await.unwrap();
        assert_eq!(
            b.get_job(jobs[0]).await.unwrap().status,
            JobStatus::Finished(ResultCode::Killed)
        );
        b.remove_config(id).await.unwrap();
        assert!(b.get_job(jobs[0]).await.is_err());
        assert!(b.config_ids(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hints_and_lookup() {
        let b = backend(1, 2, 1.0);
        let a = b.create_config(&params(1), "a").await.unwrap();
        let c = b.create_config(&params(2), "c").await.unwrap();
        b.set_config_hint(c, "race").await.unwrap();

        assert_eq!(b.config_ids(Some("race")).await.unwrap(), vec![c]);
        assert_eq!(b.config_ids(None).await.unwrap(), vec![a, c]);
        assert_eq!(b.find_config(&params(1)).await.unwrap(), Some(a));
        assert_eq!(b.find_config(&params(3)).await.unwrap(), None);

        b.set_config_hint(c, "").await.unwrap();
        assert!(b.config_ids(Some("race")).await.unwrap().is_empty());
    }
}
