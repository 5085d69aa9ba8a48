//! Candidate tracking: a configuration plus the runs it has accumulated.

use aac_backend::{BackendResult, ExecutionBackend};
use aac_types::{ConfigId, CostFunction, CostStatistic, InstanceSeed, JobId, JobResult, ParamConfig};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// Job counts by state, valid as of the last refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub not_started: usize,
    pub running: usize,
    pub finished: usize,
    pub successful: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.not_started + self.running + self.finished
    }
}

/// A configuration under evaluation.
#[derive(Debug, Clone)]
pub struct Candidate {
    id: ConfigId,
    config: ParamConfig,
    jobs: Vec<JobResult>,
    index: HashMap<JobId, usize>,
    counts: JobCounts,
    /// Set once the candidate has been the incumbent.
    pub incumbent_number: Option<u32>,
    /// Creation order within the run.
    pub number: Option<u32>,
    pub finished: bool,
    /// Tag given by the search strategy.
    pub search_name: Option<String>,
    /// Tag given by the racing strategy.
    pub racing_name: Option<String>,
}

impl Candidate {
    pub fn new(id: ConfigId, config: ParamConfig) -> Self {
        Self {
            id,
            config,
            jobs: Vec::new(),
            index: HashMap::new(),
            counts: JobCounts::default(),
            incumbent_number: None,
            number: None,
            finished: false,
            search_name: None,
            racing_name: None,
        }
    }

    pub fn id(&self) -> ConfigId {
        self.id
    }

    pub fn config(&self) -> &ParamConfig {
        &self.config
    }

    pub fn jobs(&self) -> &[JobResult] {
        &self.jobs
    }

    pub fn counts(&self) -> JobCounts {
        self.counts
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// No job is waiting or running.
    pub fn is_done(&self) -> bool {
        self.counts.not_started == 0 && self.counts.running == 0
    }

    pub fn name(&self) -> Option<String> {
        match (&self.search_name, &self.racing_name) {
            (Some(s), Some(r)) => Some(format!("{s} {r}")),
            (Some(s), None) => Some(s.clone()),
            (None, Some(r)) => Some(r.clone()),
            (None, None) => None,
        }
    }

    /// Add a run unless one with the same job id is already present.
    /// Returns whether it was added.
    pub fn put_job(&mut self, job: JobResult) -> bool {
        if self.index.contains_key(&job.id) {
            return false;
        }
        self.index.insert(job.id, self.jobs.len());
        self.jobs.push(job);
        self.recount();
        true
    }

    /// Reload every run from the backend. Returns the CPU time of runs that
    /// finished since the previous refresh.
    pub async fn refresh(&mut self, backend: &dyn ExecutionBackend) -> BackendResult<f64> {
        if self.jobs.is_empty() {
            return Ok(0.0);
        }
        let ids: Vec<JobId> = self.jobs.iter().map(|j| j.id).collect();
        let mut latest = backend.get_jobs(&ids).await?;
        let mut newly_finished = 0.0;
        for job in self.jobs.iter_mut() {
            if let Some(update) = latest.remove(&job.id) {
                if !job.is_finished() && update.is_finished() {
                    newly_finished += update.result_time;
                }
                *job = update;
            }
        }
        self.recount();
        Ok(newly_finished)
    }

    /// Force a run back to not started, e.g. after it was killed.
    pub fn reset_job(&mut self, id: JobId) {
        if let Some(&i) = self.index.get(&id) {
            self.jobs[i].reset();
            self.recount();
        }
    }

    fn recount(&mut self) {
        let mut counts = JobCounts::default();
        for job in &self.jobs {
            if job.is_not_started() {
                counts.not_started += 1;
            } else if job.is_running() {
                counts.running += 1;
            } else {
                counts.finished += 1;
                if job.is_successful() {
                    counts.successful += 1;
                }
            }
        }
        self.counts = counts;
    }

    pub fn finished_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs.iter().filter(|j| j.is_finished())
    }

    pub fn pairs(&self) -> HashSet<InstanceSeed> {
        self.jobs.iter().map(|j| j.pair).collect()
    }

    /// Cost over all finished runs.
    pub fn cost(&self, function: &CostFunction) -> f64 {
        function.cost(self.finished_jobs())
    }

    /// Finished runs of `self` and `other` on the pairs both have finished,
    /// aligned and ordered by pair.
    pub fn shared_runs<'a>(&'a self, other: &'a Candidate) -> (Vec<&'a JobResult>, Vec<&'a JobResult>) {
        let theirs: HashMap<InstanceSeed, &JobResult> =
            other.finished_jobs().map(|j| (j.pair, j)).collect();
        let mut shared: Vec<(&JobResult, &JobResult)> = self
            .finished_jobs()
            .filter_map(|j| theirs.get(&j.pair).map(|o| (j, *o)))
            .collect();
        shared.sort_by_key(|(j, _)| j.pair);
        shared.into_iter().unzip()
    }

    /// Paired comparison on shared finished runs: positive when `self` is
    /// better, negative when `other` is, zero on a tie.
    pub fn compare(&self, other: &Candidate, statistic: &CostStatistic) -> i32 {
        let (mine, theirs) = self.shared_runs(other);
        statistic.compare(
            statistic.function.cost(mine),
            statistic.function.cost(theirs),
        )
    }

    /// Up to `n` pairs `from` has finished that `self` has no run for, in
    /// random order.
    pub fn missing_pairs_from<R: Rng + ?Sized>(
        &self,
        from: &Candidate,
        n: usize,
        rng: &mut R,
    ) -> Vec<InstanceSeed> {
        let own = self.pairs();
        let mut missing: Vec<InstanceSeed> = from
            .finished_jobs()
            .map(|j| j.pair)
            .filter(|p| !own.contains(p))
            .collect();
        missing.sort();
        missing.dedup();
        missing.shuffle(rng);
        missing.truncate(n);
        missing
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aac_types::{InstanceId, JobStatus, ResultCode};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    pub(crate) fn finished(id: u64, config: u64, instance: u32, time: f64) -> JobResult {
        JobResult {
            id: JobId(id),
            config_id: ConfigId(config),
            pair: InstanceSeed::new(InstanceId(instance), 1),
            status: JobStatus::Finished(ResultCode::Success),
            result_time: time,
            time_limit: 100,
            priority: 0,
        }
    }

    pub(crate) fn candidate_with(config: u64, runs: &[(u32, f64)]) -> Candidate {
        let mut c = Candidate::new(ConfigId(config), ParamConfig::new());
        for (k, (instance, time)) in runs.iter().enumerate() {
            c.put_job(finished(config * 1000 + k as u64, config, *instance, *time));
        }
        c
    }

    fn statistic() -> CostStatistic {
        CostStatistic::new(CostFunction::Par { penalty_factor: 10.0 }, true)
    }

    #[test]
    fn test_put_job_is_idempotent() {
        let mut c = Candidate::new(ConfigId(1), ParamConfig::new());
        assert!(c.put_job(finished(5, 1, 0, 1.0)));
        assert!(!c.put_job(finished(5, 1, 0, 1.0)));
        assert_eq!(c.job_count(), 1);
        assert_eq!(c.counts().total(), 1);
    }

    #[test]
    fn test_counts_add_up() {
        let mut c = candidate_with(1, &[(0, 1.0), (1, 2.0)]);
        let mut running = finished(99, 1, 2, 0.0);
        running.status = JobStatus::Running;
        c.put_job(running);
        let mut waiting = finished(98, 1, 3, 0.0);
        waiting.status = JobStatus::NotStarted;
        c.put_job(waiting);
        let counts = c.counts();
        assert_eq!(counts.finished, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.not_started, 1);
        assert_eq!(counts.total(), c.job_count());
        assert!(!c.is_done());

        c.reset_job(JobId(1000));
        assert_eq!(c.counts().finished, 1);
        assert_eq!(c.counts().not_started, 2);
        assert_eq!(c.counts().total(), c.job_count());
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let a = candidate_with(1, &[(0, 1.0), (1, 2.0), (2, 3.0)]);
        let b = candidate_with(2, &[(0, 2.0), (1, 2.0)]);
        let stat = statistic();
        assert_eq!(a.compare(&b, &stat), 1);
        assert_eq!(b.compare(&a, &stat), -1);
        assert_eq!(a.compare(&a, &stat), 0);
    }

    #[test]
    fn test_compare_ignores_unshared_runs() {
        let stat = statistic();
        let mut a = candidate_with(1, &[(0, 1.0), (1, 2.0)]);
        let b = candidate_with(2, &[(0, 2.0), (1, 2.0)]);
        let before = a.compare(&b, &stat);
        // A terrible run on an instance b never saw changes nothing.
        a.put_job(finished(77, 1, 9, 1000.0));
        assert_eq!(a.compare(&b, &stat), before);
        assert_eq!(b.compare(&a, &stat), -before);
    }

    #[test]
    fn test_missing_pairs_excludes_own_runs() {
        let from = candidate_with(1, &[(0, 1.0), (1, 1.0), (2, 1.0), (3, 1.0)]);
        let to = candidate_with(2, &[(1, 1.0)]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let all = to.missing_pairs_from(&from, 10, &mut rng);
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|p| p.instance != InstanceId(1)));

        let two = to.missing_pairs_from(&from, 2, &mut rng);
        assert_eq!(two.len(), 2);
    }
}
