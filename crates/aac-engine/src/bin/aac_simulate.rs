use aac_backend::{ExecutionBackend, RuntimeModel, SimulatedBackend, SimulatedBackendConfig};
use aac_engine::{Orchestrator, TunerConfig, TunerEvent};
use aac_types::ParameterSpace;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A tuning run against the simulated backend, read from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scenario {
    #[serde(default)]
    tuner: TunerConfig,
    space: ParameterSpace,
    #[serde(default = "default_instances")]
    instances: usize,
    #[serde(default)]
    backend: SimulatedBackendConfig,
    #[serde(default)]
    runtime: BowlModel,
    /// Register the space's default configuration as the first incumbent.
    #[serde(default = "default_true")]
    seed_default: bool,
}

fn default_instances() -> usize {
    20
}

fn default_true() -> bool {
    true
}

/// Runtime grows quadratically with the distance of a configuration to
/// `optimum` in the unit cube.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BowlModel {
    base: f64,
    scale: f64,
    /// Per-parameter optimum in unit coordinates; missing entries are 0.5.
    optimum: Vec<f64>,
    /// Extra runtime per instance class (instance id modulo 3).
    instance_spread: f64,
}

impl Default for BowlModel {
    fn default() -> Self {
        Self {
            base: 1.0,
            scale: 10.0,
            optimum: Vec::new(),
            instance_spread: 0.2,
        }
    }
}

impl BowlModel {
    fn into_runtime(self, space: &ParameterSpace) -> RuntimeModel {
        let space = space.clone();
        Arc::new(move |config, pair| {
            let distance: f64 = space
                .parameters
                .iter()
                .enumerate()
                .filter_map(|(i, def)| {
                    let u = def.kind.to_unit(config.get(&def.name)?)?;
                    let target = self.optimum.get(i).copied().unwrap_or(0.5);
                    Some((u - target).powi(2))
                })
                .sum();
            self.base + self.scale * distance + f64::from(pair.instance.0 % 3) * self.instance_spread
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: aac-simulate <scenario.json>");
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading scenario {path}"))?;
    let scenario: Scenario =
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {path}"))?;

    let model = scenario.runtime.clone().into_runtime(&scenario.space);
    let backend = Arc::new(SimulatedBackend::with_instance_count(
        SimulatedBackendConfig {
            experiment_id: scenario.tuner.experiment_id,
            ..scenario.backend.clone()
        },
        scenario.instances,
        model,
    ));

    if scenario.seed_default {
        let default = scenario.space.default_config();
        let id = backend
            .create_config(&default, "default")
            .await
            .context("registering default configuration")?;
        backend
            .set_config_hint(id, "default")
            .await
            .context("marking default configuration")?;
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let watcher = std::thread::spawn(move || {
        let mut incumbents = 0usize;
        for event in rx {
            if let TunerEvent::IncumbentChanged { .. } = event {
                incumbents += 1;
            }
        }
        incumbents
    });

    let orchestrator = Orchestrator::new(scenario.tuner, backend.clone(), scenario.space)
        .await
        .context("setting up tuner")?
        .with_events(tx);
    let outcome = orchestrator.start().await.context("tuning run failed")?;

    let incumbents = watcher.join().unwrap_or(0);
    info!(
        incumbent_changes = incumbents,
        virtual_time_s = backend.clock(),
        "Simulation finished"
    );

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
