//! Identifiers and run records exchanged with an execution backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend-assigned identifier of a parameter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId(pub u64);

/// Backend-assigned identifier of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

/// Identifier of a benchmark instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of benchmark work: an instance solved with a fixed seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceSeed {
    pub instance: InstanceId,
    pub seed: u64,
}

impl InstanceSeed {
    pub fn new(instance: InstanceId, seed: u64) -> Self {
        Self { instance, seed }
    }
}

impl fmt::Display for InstanceSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.instance, self.seed)
    }
}

/// How a finished job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// The target program produced a correct answer.
    Success,
    /// The job hit its CPU time limit; its runtime is a lower bound.
    Timeout,
    /// The target program crashed or produced a wrong answer.
    Crashed,
    /// The job was killed externally.
    Killed,
}

impl ResultCode {
    pub fn is_correct(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    NotStarted,
    Running,
    Finished(ResultCode),
}

/// A job record as stored by the execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: JobId,
    pub config_id: ConfigId,
    pub pair: InstanceSeed,
    pub status: JobStatus,
    /// CPU seconds consumed; only meaningful once finished.
    pub result_time: f64,
    pub time_limit: u32,
    pub priority: i32,
}

impl JobResult {
    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Finished(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, JobStatus::Running)
    }

    pub fn is_not_started(&self) -> bool {
        matches!(self.status, JobStatus::NotStarted)
    }

    /// Finished with a correct answer.
    pub fn is_successful(&self) -> bool {
        matches!(self.status, JobStatus::Finished(code) if code.is_correct())
    }

    /// Finished without a correct answer, so the runtime is only a lower bound.
    pub fn is_censored(&self) -> bool {
        matches!(self.status, JobStatus::Finished(code) if !code.is_correct())
    }

    /// Forget any progress and mark the job as not started.
    pub fn reset(&mut self) {
        self.status = JobStatus::NotStarted;
        self.result_time = 0.0;
    }
}

/// A request for one job. Without an explicit pair the backend assigns the
/// next course entry the configuration has not been run on yet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub pair: Option<InstanceSeed>,
    pub time_limit: u32,
    pub priority: i32,
}

impl JobRequest {
    pub fn from_course(time_limit: u32, priority: i32) -> Self {
        Self {
            pair: None,
            time_limit,
            priority,
        }
    }

    pub fn for_pair(pair: InstanceSeed, time_limit: u32, priority: i32) -> Self {
        Self {
            pair: Some(pair),
            time_limit,
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> JobResult {
        JobResult {
            id: JobId(1),
            config_id: ConfigId(7),
            pair: InstanceSeed::new(InstanceId(3), 11),
            status,
            result_time: 4.5,
            time_limit: 10,
            priority: 0,
        }
    }

    #[test]
    fn test_status_predicates() {
        assert!(job(JobStatus::Finished(ResultCode::Success)).is_successful());
        assert!(job(JobStatus::Finished(ResultCode::Timeout)).is_censored());
        assert!(!job(JobStatus::Running).is_finished());
        assert!(job(JobStatus::NotStarted).is_not_started());
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut j = job(JobStatus::Running);
        j.reset();
        assert!(j.is_not_started());
        assert_eq!(j.result_time, 0.0);
    }
}
