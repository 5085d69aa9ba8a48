//! Tuning run configuration.

use aac_types::{CostFunction, CostStatistic};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::TunerResult;

/// Connection settings of a database-backed execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCredentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for BackendCredentials {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            database: "edacc".to_string(),
            user: "edacc".to_string(),
            password: String::new(),
        }
    }
}

/// Sub-parameters of the model-based search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelBasedConfig {
    /// Learn log10 of the cost instead of the cost itself.
    pub log_model: bool,
    /// Principal components kept from the instance features.
    pub num_pc: usize,
    /// Initial design size per parameter.
    pub initial_configs_factor: usize,
    /// Random configurations scored per acquisition round.
    pub num_random_theta: usize,
    pub max_local_search_steps: usize,
    pub ls_stddev: f64,
    /// Neighbours per parameter in each local search step.
    pub ls_samples: usize,
    pub n_trees: usize,
    /// Mean of the exponential distribution the exploration weights are drawn from.
    pub ocb_exp_mu: f64,
    /// Configurations selected per refill; also the queue's low-water mark.
    pub queue_size: usize,
    pub num_top_ls: usize,
    pub num_top_sel: usize,
    /// Worker threads for sampling, prediction and acquisition optimization.
    pub num_procs: usize,
    /// Add the instance index to the instance features.
    pub use_instance_index_feature: bool,
    /// Seed the initial design with neighbours of the default configuration.
    pub initial_design_from_default: bool,
}

impl Default for ModelBasedConfig {
    fn default() -> Self {
        Self {
            log_model: true,
            num_pc: 13,
            initial_configs_factor: 20,
            num_random_theta: 10_000,
            max_local_search_steps: 5,
            ls_stddev: 0.001,
            ls_samples: 10,
            n_trees: 10,
            ocb_exp_mu: 1.0,
            queue_size: 40,
            num_top_ls: 10,
            num_top_sel: 3,
            num_procs: 1,
            use_instance_index_feature: true,
            initial_design_from_default: true,
        }
    }
}

/// Search strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Registry name: "random" or "model_based".
    pub strategy: String,
    pub model_based: ModelBasedConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: "random".to_string(),
            model_based: ModelBasedConfig::default(),
        }
    }
}

/// Racing strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RacingConfig {
    /// Registry name: "capped" or "roar".
    pub strategy: String,
    pub max_capping_factor: f64,
}

impl Default for RacingConfig {
    fn default() -> Self {
        Self {
            strategy: "capped".to_string(),
            max_capping_factor: 2.0,
        }
    }
}

/// Fully resolved configuration of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub experiment_id: u32,
    pub backend: BackendCredentials,

    /// CPU time limit of a single job in seconds.
    pub job_cpu_time_limit: u32,
    /// Budget on cumulated job CPU time in seconds; zero or negative is unbounded.
    pub max_tuning_time: f64,

    pub min_cores: usize,
    /// Zero means no upper bound.
    pub max_cores: usize,

    /// Runs a new candidate starts with.
    pub min_runs: usize,
    /// The incumbent is evaluated on at most this many passes over the instances.
    pub max_parcours_expansion_factor: usize,
    /// Runs the first incumbent gets before racing starts.
    pub initial_default_parcours_length: usize,

    pub seed_search: u64,
    pub seed_racing: u64,

    pub cost_function: CostFunction,
    pub minimize: bool,

    /// Delete losing configurations from the backend.
    pub delete_losers: bool,
    /// Upper bound on the number of candidates created in this run.
    pub max_candidates: Option<usize>,
    /// Back-off when an iteration produced no new candidates.
    pub poll_interval_ms: u64,

    pub search: SearchConfig,
    pub racing: RacingConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            experiment_id: 1,
            backend: BackendCredentials::default(),
            job_cpu_time_limit: 10,
            max_tuning_time: -1.0,
            min_cores: 0,
            max_cores: 0,
            min_runs: 1,
            max_parcours_expansion_factor: 10,
            initial_default_parcours_length: 10,
            seed_search: 0,
            seed_racing: 0,
            cost_function: CostFunction::default(),
            minimize: true,
            delete_losers: false,
            max_candidates: None,
            poll_interval_ms: 2500,
            search: SearchConfig::default(),
            racing: RacingConfig::default(),
        }
    }
}

impl TunerConfig {
    pub fn new(experiment_id: u32) -> Self {
        Self {
            experiment_id,
            ..Self::default()
        }
    }

    pub fn with_job_cpu_time_limit(mut self, seconds: u32) -> Self {
        self.job_cpu_time_limit = seconds;
        self
    }

    pub fn with_max_tuning_time(mut self, seconds: f64) -> Self {
        self.max_tuning_time = seconds;
        self
    }

    pub fn with_cores(mut self, min: usize, max: usize) -> Self {
        self.min_cores = min;
        self.max_cores = max;
        self
    }

    pub fn with_min_runs(mut self, n: usize) -> Self {
        self.min_runs = n;
        self
    }

    pub fn with_parcours(mut self, expansion_factor: usize, initial_length: usize) -> Self {
        self.max_parcours_expansion_factor = expansion_factor;
        self.initial_default_parcours_length = initial_length;
        self
    }

    pub fn with_seeds(mut self, search: u64, racing: u64) -> Self {
        self.seed_search = search;
        self.seed_racing = racing;
        self
    }

    pub fn with_cost(mut self, function: CostFunction, minimize: bool) -> Self {
        self.cost_function = function;
        self.minimize = minimize;
        self
    }

    pub fn with_search(mut self, strategy: &str) -> Self {
        self.search.strategy = strategy.to_string();
        self
    }

    pub fn with_model_based(mut self, config: ModelBasedConfig) -> Self {
        self.search.model_based = config;
        self
    }

    pub fn with_racing(mut self, strategy: &str) -> Self {
        self.racing.strategy = strategy.to_string();
        self
    }

    pub fn with_max_candidates(mut self, n: usize) -> Self {
        self.max_candidates = Some(n);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_delete_losers(mut self, delete: bool) -> Self {
        self.delete_losers = delete;
        self
    }

    pub fn statistic(&self) -> CostStatistic {
        CostStatistic::new(self.cost_function, self.minimize)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether `cpu_time` has exhausted the tuning budget.
    pub fn budget_exhausted(&self, cpu_time: f64) -> bool {
        self.max_tuning_time > 0.0 && cpu_time > self.max_tuning_time
    }

    pub fn validate(&self) -> TunerResult<()> {
        if self.job_cpu_time_limit == 0 {
            return Err(config_error!("job_cpu_time_limit must be positive"));
        }
        if self.min_runs == 0 {
            return Err(config_error!("min_runs must be positive"));
        }
        if self.max_parcours_expansion_factor == 0 {
            return Err(config_error!("max_parcours_expansion_factor must be positive"));
        }
        if self.max_cores != 0 && self.min_cores > self.max_cores {
            return Err(config_error!(
                "min_cores ({}) exceeds max_cores ({})",
                self.min_cores,
                self.max_cores
            ));
        }
        if let CostFunction::Par { penalty_factor } = self.cost_function {
            if penalty_factor < 1.0 {
                return Err(config_error!(
                    "PAR penalty factor must be at least 1, got {penalty_factor}"
                ));
            }
        }
        if self.racing.max_capping_factor < 1.0 {
            return Err(config_error!(
                "max_capping_factor must be at least 1, got {}",
                self.racing.max_capping_factor
            ));
        }
        let mb = &self.search.model_based;
        if mb.num_procs == 0 || mb.n_trees == 0 || mb.queue_size == 0 || mb.num_top_sel == 0 {
            return Err(config_error!(
                "model-based num_procs, n_trees, queue_size and num_top_sel must be positive"
            ));
        }
        if mb.ocb_exp_mu <= 0.0 {
            return Err(config_error!("ocb_exp_mu must be positive"));
        }
        Ok(())
    }
}
