//! Parameter space definitions: domains, sampling, neighbourhoods, canonical
//! naming and the numeric encoding used by surrogate models.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{SpaceError, SpaceResult};

/// Upper bound on rejected draws against forbidden combinations.
const MAX_REJECTIONS: usize = 1000;

/// Retries for a Gaussian step that leaves the unit interval before clamping.
const MAX_GAUSSIAN_RETRIES: usize = 10;

/// Describes the domain of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    Real { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    Integer { low: i64, high: i64 },
    /// Continuous range sampled in log-space.
    LogUniform { low: f64, high: f64 },
    /// Unordered choices.
    Categorical { values: Vec<String> },
    /// Ordered choices.
    Ordinal { values: Vec<String> },
    /// On/off switch.
    Flag,
    /// Union of several domains. Valid for sampling but not numerically encodable.
    Mixed { kinds: Vec<ParameterKind> },
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Flag(bool),
    Text(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Flag(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl ParameterValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl ParameterKind {
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (Self::Real { low, high }, v) | (Self::LogUniform { low, high }, v) => v
                .as_f64()
                .map(|x| x >= *low && x <= *high)
                .unwrap_or(false),
            (Self::Integer { low, high }, ParameterValue::Int(v)) => v >= low && v <= high,
            (Self::Categorical { values }, ParameterValue::Text(v))
            | (Self::Ordinal { values }, ParameterValue::Text(v)) => values.contains(v),
            (Self::Flag, ParameterValue::Flag(_)) => true,
            (Self::Mixed { kinds }, v) => kinds.iter().any(|k| k.contains(v)),
            _ => false,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Mixed { kinds } if !kinds.is_empty() => {
                kinds[rng.gen_range(0..kinds.len())].sample(rng)
            }
            _ => self.from_unit(rng.gen::<f64>()),
        }
    }

    /// Position of `value` in the unit interval, or `None` when this domain
    /// has no numeric encoding.
    pub fn to_unit(&self, value: &ParameterValue) -> Option<f64> {
        match (self, value) {
            (Self::Real { low, high }, v) => {
                let x = v.as_f64()?;
                Some(if high > low { (x - low) / (high - low) } else { 0.5 })
            }
            (Self::Integer { low, high }, ParameterValue::Int(v)) => Some(if high > low {
                (v - low) as f64 / (high - low) as f64
            } else {
                0.5
            }),
            (Self::LogUniform { low, high }, v) => {
                let x = v.as_f64()?;
                let (l, h) = (low.ln(), high.ln());
                Some(if h > l { (x.ln() - l) / (h - l) } else { 0.5 })
            }
            (Self::Categorical { values }, ParameterValue::Text(v))
            | (Self::Ordinal { values }, ParameterValue::Text(v)) => {
                let idx = values.iter().position(|x| x == v)?;
                Some((idx as f64 + 0.5) / values.len() as f64)
            }
            (Self::Flag, ParameterValue::Flag(v)) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Inverse of [`ParameterKind::to_unit`]; `u` is clamped into [0, 1].
    pub fn from_unit(&self, u: f64) -> ParameterValue {
        let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.5 };
        match self {
            Self::Real { low, high } => ParameterValue::Float(low + u * (high - low)),
            Self::Integer { low, high } => {
                let span = (high - low) as f64;
                ParameterValue::Int(low + (u * span).round() as i64)
            }
            Self::LogUniform { low, high } => {
                let (l, h) = (low.ln(), high.ln());
                ParameterValue::Float((l + u * (h - l)).exp().clamp(*low, *high))
            }
            Self::Categorical { values } | Self::Ordinal { values } => {
                if values.is_empty() {
                    return ParameterValue::Text(String::new());
                }
                let idx = ((u * values.len() as f64) as usize).min(values.len() - 1);
                ParameterValue::Text(values[idx].clone())
            }
            Self::Flag => ParameterValue::Flag(u >= 0.5),
            Self::Mixed { kinds } => match kinds.first() {
                Some(kind) => kind.from_unit(u),
                None => ParameterValue::Text(String::new()),
            },
        }
    }

    fn natural_default(&self) -> ParameterValue {
        match self {
            Self::Flag => ParameterValue::Flag(false),
            Self::Categorical { .. } | Self::Ordinal { .. } => self.from_unit(0.0),
            _ => self.from_unit(0.5),
        }
    }

    pub fn is_encodable(&self) -> bool {
        !matches!(self, Self::Mixed { .. })
    }
}

/// A single parameter dimension in the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<ParameterValue>,
}

/// A full assignment of values to parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamConfig(BTreeMap<String, ParameterValue>);

impl ParamConfig {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ParameterValue)> for ParamConfig {
    fn from_iter<T: IntoIterator<Item = (String, ParameterValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The parameter space of the target program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub parameters: Vec<ParameterDef>,
    /// Partial assignments no configuration may match.
    #[serde(default)]
    pub forbidden: Vec<ParamConfig>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    pub fn add_real(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::Real { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::Integer { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_categorical(self, name: impl Into<String>, values: &[&str]) -> Self {
        let values = values.iter().map(|v| v.to_string()).collect();
        self.push(name, ParameterKind::Categorical { values })
    }

    pub fn add_ordinal(self, name: impl Into<String>, values: &[&str]) -> Self {
        let values = values.iter().map(|v| v.to_string()).collect();
        self.push(name, ParameterKind::Ordinal { values })
    }

    pub fn add_flag(self, name: impl Into<String>) -> Self {
        self.push(name, ParameterKind::Flag)
    }

    pub fn add_mixed(self, name: impl Into<String>, kinds: Vec<ParameterKind>) -> Self {
        self.push(name, ParameterKind::Mixed { kinds })
    }

    /// Set the default value of an already added parameter.
    pub fn with_default(mut self, name: &str, value: ParameterValue) -> Self {
        if let Some(def) = self.parameters.iter_mut().find(|p| p.name == name) {
            def.default = Some(value);
        }
        self
    }

    /// Forbid every configuration matching all of the given assignments.
    pub fn forbid(mut self, clause: Vec<(&str, ParameterValue)>) -> Self {
        self.forbidden
            .push(clause.into_iter().map(|(n, v)| (n.to_string(), v)).collect());
        self
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Name of the first parameter that has no numeric encoding.
    pub fn first_unencodable(&self) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| !p.kind.is_encodable())
            .map(|p| p.name.as_str())
    }

    pub fn validate(&self, config: &ParamConfig) -> SpaceResult<()> {
        for (name, _) in config.iter() {
            if !self.parameters.iter().any(|p| &p.name == name) {
                return Err(SpaceError::UnknownParameter { name: name.clone() });
            }
        }
        for def in &self.parameters {
            let value = config.get(&def.name).ok_or_else(|| SpaceError::MissingValue {
                name: def.name.clone(),
            })?;
            if !def.kind.contains(value) {
                return Err(SpaceError::OutOfDomain {
                    name: def.name.clone(),
                    value: value.to_string(),
                });
            }
        }
        if let Some(clause) = self.forbidden.iter().find(|c| Self::matches(config, c)) {
            return Err(SpaceError::Forbidden {
                clause: self.canonical_name(clause),
            });
        }
        Ok(())
    }

    pub fn is_valid(&self, config: &ParamConfig) -> bool {
        self.validate(config).is_ok()
    }

    fn matches(config: &ParamConfig, clause: &ParamConfig) -> bool {
        !clause.is_empty() && clause.iter().all(|(n, v)| config.get(n) == Some(v))
    }

    fn is_forbidden(&self, config: &ParamConfig) -> bool {
        self.forbidden.iter().any(|c| Self::matches(config, c))
    }

    /// The configuration made of every parameter's default value.
    pub fn default_config(&self) -> ParamConfig {
        self.parameters
            .iter()
            .map(|p| {
                let value = p
                    .default
                    .clone()
                    .unwrap_or_else(|| p.kind.natural_default());
                (p.name.clone(), value)
            })
            .collect()
    }

    /// Uniformly random configuration. Draws matching a forbidden clause are
    /// rejected up to a fixed number of attempts.
    pub fn random_config<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamConfig {
        let mut config = self.sample_once(rng);
        for _ in 0..MAX_REJECTIONS {
            if !self.is_forbidden(&config) {
                break;
            }
            config = self.sample_once(rng);
        }
        config
    }

    fn sample_once<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamConfig {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.kind.sample(rng)))
            .collect()
    }

    /// One-exchange neighbourhood: for every parameter, up to `samples`
    /// configurations differing from `config` in that parameter only.
    /// Numeric parameters take a Gaussian step of `stddev` in unit space.
    pub fn gaussian_neighbourhood<R: Rng + ?Sized>(
        &self,
        config: &ParamConfig,
        rng: &mut R,
        stddev: f64,
        samples: usize,
    ) -> Vec<ParamConfig> {
        let mut neighbours = Vec::new();
        for def in &self.parameters {
            let Some(current) = config.get(&def.name) else {
                continue;
            };
            let draws = match def.kind {
                ParameterKind::Flag => 1,
                _ => samples,
            };
            for _ in 0..draws {
                let Some(value) = Self::step(&def.kind, current, rng, stddev) else {
                    continue;
                };
                if &value == current {
                    continue;
                }
                let mut neighbour = config.clone();
                neighbour.set(def.name.clone(), value);
                if self.is_valid(&neighbour) {
                    neighbours.push(neighbour);
                }
            }
        }
        neighbours
    }

    fn step<R: Rng + ?Sized>(
        kind: &ParameterKind,
        current: &ParameterValue,
        rng: &mut R,
        stddev: f64,
    ) -> Option<ParameterValue> {
        match kind {
            ParameterKind::Flag => match current {
                ParameterValue::Flag(v) => Some(ParameterValue::Flag(!v)),
                _ => None,
            },
            ParameterKind::Categorical { values } => {
                if values.len() < 2 {
                    return None;
                }
                Some(ParameterValue::Text(
                    values[rng.gen_range(0..values.len())].clone(),
                ))
            }
            ParameterKind::Mixed { .. } => Some(kind.sample(rng)),
            _ => {
                let u = kind.to_unit(current)?;
                let normal = Normal::new(u, stddev).ok()?;
                let mut next = normal.sample(rng);
                for _ in 0..MAX_GAUSSIAN_RETRIES {
                    if (0.0..=1.0).contains(&next) {
                        break;
                    }
                    next = normal.sample(rng);
                }
                Some(kind.from_unit(next))
            }
        }
    }

    /// Numeric encoding of `config`, one unit-interval coordinate per parameter.
    pub fn encode(&self, config: &ParamConfig) -> SpaceResult<Vec<f64>> {
        self.parameters
            .iter()
            .map(|p| {
                let value = config.get(&p.name).ok_or_else(|| SpaceError::MissingValue {
                    name: p.name.clone(),
                })?;
                if !p.kind.is_encodable() {
                    return Err(SpaceError::Unencodable {
                        name: p.name.clone(),
                    });
                }
                p.kind.to_unit(value).ok_or_else(|| SpaceError::OutOfDomain {
                    name: p.name.clone(),
                    value: value.to_string(),
                })
            })
            .collect()
    }

    /// Decode a point of the unit hypercube; missing coordinates default to 0.5.
    pub fn config_from_unit_point(&self, point: &[f64]) -> ParamConfig {
        self.parameters
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let u = point.get(i).copied().unwrap_or(0.5);
                (p.name.clone(), p.kind.from_unit(u))
            })
            .collect()
    }

    /// Stable textual identity of a configuration, in parameter order.
    pub fn canonical_name(&self, config: &ParamConfig) -> String {
        self.parameters
            .iter()
            .filter_map(|p| config.get(&p.name).map(|v| format!("-{} {}", p.name, v)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_space() -> ParameterSpace {
        ParameterSpace::new()
            .add_real("alpha", 0.0, 1.0)
            .add_int("restarts", 1, 100)
            .add_log_uniform("decay", 1e-4, 1.0)
            .add_categorical("heuristic", &["vsids", "berkmin", "random"])
            .add_flag("preprocess")
    }

    #[test]
    fn test_random_configs_are_valid() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let config = space.random_config(&mut rng);
            assert!(space.validate(&config).is_ok(), "{config:?}");
        }
    }

    #[test]
    fn test_validate_reports_problems() {
        let space = sample_space();
        let mut config = space.default_config();
        config.set("restarts", ParameterValue::Int(1000));
        assert!(matches!(
            space.validate(&config),
            Err(SpaceError::OutOfDomain { .. })
        ));

        let mut config = space.default_config();
        config.set("bogus", ParameterValue::Int(1));
        assert!(matches!(
            space.validate(&config),
            Err(SpaceError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_forbidden_clauses_are_rejected() {
        let space = ParameterSpace::new()
            .add_flag("a")
            .add_flag("b")
            .forbid(vec![
                ("a", ParameterValue::Flag(true)),
                ("b", ParameterValue::Flag(true)),
            ]);
        let mut config = space.default_config();
        config.set("a", ParameterValue::Flag(true));
        config.set("b", ParameterValue::Flag(true));
        assert!(matches!(
            space.validate(&config),
            Err(SpaceError::Forbidden { .. })
        ));

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..50 {
            assert!(space.is_valid(&space.random_config(&mut rng)));
        }
    }

    #[test]
    fn test_encode_decode_preserves_canonical_name() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let config = space.random_config(&mut rng);
            let point = space.encode(&config).unwrap();
            let decoded = space.config_from_unit_point(&point);
            let (a, b) = (space.canonical_name(&config), space.canonical_name(&decoded));
            // Continuous values may differ in the last ulp after the round trip.
            assert_eq!(
                decoded.get("heuristic"),
                config.get("heuristic"),
                "{a} vs {b}"
            );
            assert_eq!(decoded.get("restarts"), config.get("restarts"));
            assert_eq!(decoded.get("preprocess"), config.get("preprocess"));
        }
    }

    #[test]
    fn test_neighbourhood_changes_one_parameter() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let base = space.default_config();
        let neighbours = space.gaussian_neighbourhood(&base, &mut rng, 0.2, 4);
        assert!(!neighbours.is_empty());
        for n in &neighbours {
            let changed = base.iter().filter(|(k, v)| n.get(k) != Some(v)).count();
            assert_eq!(changed, 1);
            assert!(space.is_valid(n));
        }
    }

    #[test]
    fn test_mixed_domain_is_not_encodable() {
        let space = ParameterSpace::new().add_mixed(
            "threshold",
            vec![
                ParameterKind::Integer { low: 0, high: 5 },
                ParameterKind::Categorical {
                    values: vec!["auto".to_string()],
                },
            ],
        );
        assert_eq!(space.first_unencodable(), Some("threshold"));
        let config = space.default_config();
        assert!(matches!(
            space.encode(&config),
            Err(SpaceError::Unencodable { .. })
        ));
    }

    #[test]
    fn test_canonical_name_follows_parameter_order() {
        let space = ParameterSpace::new().add_int("b", 0, 9).add_int("a", 0, 9);
        let mut config = ParamConfig::new();
        config.set("a", ParameterValue::Int(1));
        config.set("b", ParameterValue::Int(2));
        assert_eq!(space.canonical_name(&config), "-b 2 -a 1");
    }

    #[test]
    fn test_config_survives_json() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let config = space.random_config(&mut rng);
        let json = serde_json::to_string(&config).unwrap();
        let back: ParamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(space.canonical_name(&config), space.canonical_name(&back));
    }
}
