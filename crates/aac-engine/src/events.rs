//! Events emitted while tuning, for observers that want more than log lines.

use aac_types::ConfigId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TunerEvent {
    Started {
        experiment_id: u32,
        incumbent: ConfigId,
    },
    IncumbentChanged {
        previous: ConfigId,
        current: ConfigId,
        incumbent_number: u32,
    },
    CandidateCapped {
        config_id: ConfigId,
        failed_kills: usize,
    },
    CandidateLost {
        config_id: ConfigId,
        runs: usize,
    },
    Finished {
        best: ConfigId,
        cpu_time: f64,
    },
}
