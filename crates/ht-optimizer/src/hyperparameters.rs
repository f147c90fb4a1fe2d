//! Hyperparameter definitions and the search space.

use ht_types::{validation_error, HtError, HtResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Fully or partially resolved parameter values, ordered by name.
pub type Assignment = BTreeMap<String, ParameterValue>;

/// Describes the domain of a parameter and how it is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Integers in [min, max] on a `step` grid anchored at `min`.
    Int { min: i64, max: i64, step: i64 },
    /// Floats in [min, max], optionally on a `step` grid anchored at `min`.
    Float { min: f64, max: f64, step: Option<f64> },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { min: f64, max: f64 },
    /// Categorical choices; the first one is the default.
    Choice { values: Vec<ParameterValue> },
    /// A constant.
    Fixed { value: ParameterValue },
    Boolean { default: bool },
}

/// A single named dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParameter {
    pub name: String,
    pub kind: ParameterKind,
}

impl HyperParameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64, step: i64) -> Self {
        Self::new(name, ParameterKind::Int { min, max, step })
    }

    pub fn float(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self::new(
            name,
            ParameterKind::Float {
                min,
                max,
                step: None,
            },
        )
    }

    pub fn stepped_float(name: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        Self::new(
            name,
            ParameterKind::Float {
                min,
                max,
                step: Some(step),
            },
        )
    }

    pub fn log_uniform(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self::new(name, ParameterKind::LogUniform { min, max })
    }

    pub fn choice<V: Into<ParameterValue>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            name,
            ParameterKind::Choice {
                values: values.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn fixed(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self::new(
            name,
            ParameterKind::Fixed {
                value: value.into(),
            },
        )
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParameterKind::Boolean { default: false })
    }

    /// Check that the domain is well formed.
    pub fn validate(&self) -> HtResult<()> {
        let name = &self.name;
        if name.is_empty() {
            return Err(validation_error!("hyperparameter name must not be empty"));
        }
        match &self.kind {
            ParameterKind::Int { min, max, step } => {
                if min > max {
                    return Err(validation_error!("'{name}': min {min} > max {max}"));
                }
                if *step <= 0 {
                    return Err(validation_error!("'{name}': step must be positive"));
                }
            }
            ParameterKind::Float { min, max, step } => {
                if !(min.is_finite() && max.is_finite()) || min > max {
                    return Err(validation_error!("'{name}': invalid bounds [{min}, {max}]"));
                }
                if let Some(step) = step {
                    if !(step.is_finite() && *step > 0.0) {
                        return Err(validation_error!("'{name}': step must be positive"));
                    }
                }
            }
            ParameterKind::LogUniform { min, max } => {
                if !(min.is_finite() && max.is_finite()) || *min <= 0.0 || min > max {
                    return Err(validation_error!(
                        "'{name}': log bounds must satisfy 0 < min <= max, got [{min}, {max}]"
                    ));
                }
            }
            ParameterKind::Choice { values } => {
                if values.is_empty() {
                    return Err(validation_error!("'{name}': choices cannot be empty"));
                }
            }
            ParameterKind::Fixed { .. } | ParameterKind::Boolean { .. } => {}
        }
        Ok(())
    }

    /// Value used when nothing was sampled or overridden.
    pub fn default_value(&self) -> ParameterValue {
        match &self.kind {
            ParameterKind::Int { min, .. } => ParameterValue::Int(*min),
            ParameterKind::Float { min, .. } | ParameterKind::LogUniform { min, .. } => {
                ParameterValue::Float(*min)
            }
            ParameterKind::Choice { values } => values[0].clone(),
            ParameterKind::Fixed { value } => value.clone(),
            ParameterKind::Boolean { default } => ParameterValue::Bool(*default),
        }
    }

    /// Draw a value uniformly from the domain.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match &self.kind {
            ParameterKind::Int { min, max, step } => {
                let steps = (max - min) / step;
                ParameterValue::Int(min + rng.random_range(0..=steps) * step)
            }
            ParameterKind::Float {
                min,
                max,
                step: Some(step),
            } => {
                let steps = ((max - min) / step).floor() as i64;
                let k = rng.random_range(0..=steps);
                ParameterValue::Float((min + k as f64 * step).min(*max))
            }
            ParameterKind::Float {
                min,
                max,
                step: None,
            } => ParameterValue::Float(rng.random_range(*min..=*max)),
            ParameterKind::LogUniform { min, max } => {
                let log_val: f64 = rng.random_range(min.ln()..=max.ln());
                ParameterValue::Float(log_val.exp().clamp(*min, *max))
            }
            ParameterKind::Choice { values } => {
                values[rng.random_range(0..values.len())].clone()
            }
            ParameterKind::Fixed { value } => value.clone(),
            ParameterKind::Boolean { .. } => ParameterValue::Bool(rng.random_bool(0.5)),
        }
    }

    /// Whether `value` lies inside the domain.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (&self.kind, value) {
            (ParameterKind::Int { min, max, step }, ParameterValue::Int(v)) => {
                v >= min && v <= max && (v - min) % step == 0
            }
            (ParameterKind::Float { min, max, .. }, v)
            | (ParameterKind::LogUniform { min, max }, v) => {
                v.as_f64().is_some_and(|v| v >= *min && v <= *max)
            }
            (ParameterKind::Choice { values }, v) => values.contains(v),
            (ParameterKind::Fixed { value: fixed }, v) => fixed == v,
            (ParameterKind::Boolean { .. }, ParameterValue::Bool(_)) => true,
            _ => false,
        }
    }

    /// Number of distinct values, `None` for continuous domains.
    pub fn cardinality(&self) -> Option<usize> {
        match &self.kind {
            ParameterKind::Int { min, max, step } => usize::try_from((max - min) / step + 1).ok(),
            ParameterKind::Float {
                min,
                max,
                step: Some(step),
            } => Some(((max - min) / step).floor() as usize + 1),
            ParameterKind::Float { step: None, .. } | ParameterKind::LogUniform { .. } => None,
            ParameterKind::Choice { values } => Some(values.len()),
            ParameterKind::Fixed { .. } => Some(1),
            ParameterKind::Boolean { .. } => Some(2),
        }
    }

    /// Grid axis for exhaustive search. Continuous dimensions are split into
    /// `float_steps` points.
    pub fn grid_values(&self, float_steps: usize) -> Vec<ParameterValue> {
        match &self.kind {
            ParameterKind::Int { min, max, step } => (*min..=*max)
                .step_by(*step as usize)
                .map(ParameterValue::Int)
                .collect(),
            ParameterKind::Float {
                min,
                max,
                step: Some(step),
            } => {
                let steps = ((max - min) / step).floor() as usize;
                (0..=steps)
                    .map(|k| ParameterValue::Float((min + k as f64 * step).min(*max)))
                    .collect()
            }
            ParameterKind::Float {
                min,
                max,
                step: None,
            } => linspace(*min, *max, float_steps)
                .map(ParameterValue::Float)
                .collect(),
            ParameterKind::LogUniform { min, max } => linspace(min.ln(), max.ln(), float_steps)
                .map(|v| ParameterValue::Float(v.exp().clamp(*min, *max)))
                .collect(),
            ParameterKind::Choice { values } => values.clone(),
            ParameterKind::Fixed { value } => vec![value.clone()],
            ParameterKind::Boolean { .. } => {
                vec![ParameterValue::Bool(false), ParameterValue::Bool(true)]
            }
        }
    }
}

fn linspace(low: f64, high: f64, steps: usize) -> impl Iterator<Item = f64> {
    let steps = steps.max(2);
    (0..steps).map(move |i| {
        let t = i as f64 / (steps - 1) as f64;
        (low + t * (high - low)).clamp(low, high)
    })
}

/// The search space: an ordered list of uniquely named hyperparameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    parameters: Vec<HyperParameter>,
}

impl HyperParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style add; a name that is already present is ignored.
    /// Domains are validated when the space is handed to an oracle.
    pub fn add(mut self, param: HyperParameter) -> Self {
        if !self.contains(&param.name) {
            self.parameters.push(param);
        }
        self
    }

    pub fn add_int(self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.add(HyperParameter::int(name, min, max, 1))
    }

    pub fn add_float(self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.add(HyperParameter::float(name, min, max))
    }

    pub fn add_log_uniform(self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.add(HyperParameter::log_uniform(name, min, max))
    }

    pub fn add_choice<V: Into<ParameterValue>>(
        self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.add(HyperParameter::choice(name, values))
    }

    pub fn add_fixed(self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.add(HyperParameter::fixed(name, value))
    }

    pub fn add_boolean(self, name: impl Into<String>) -> Self {
        self.add(HyperParameter::boolean(name))
    }

    /// Add `param` unless its name is already tracked. Returns whether it
    /// was added; a duplicate name is not an error.
    pub fn register(&mut self, param: HyperParameter) -> HtResult<bool> {
        if self.contains(&param.name) {
            return Ok(false);
        }
        param.validate()?;
        self.parameters.push(param);
        Ok(true)
    }

    /// Register every parameter, keeping their order. Returns how many were new.
    pub fn merge(&mut self, params: impl IntoIterator<Item = HyperParameter>) -> HtResult<usize> {
        let mut added = 0;
        for param in params {
            if self.register(param)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<&HyperParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HyperParameter> {
        self.parameters.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Fail with `UnknownParameter` if any of `names` is not tracked.
    pub fn ensure_known<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> HtResult<()> {
        let mut unknown: Vec<String> = names
            .into_iter()
            .filter(|n| !self.contains(n))
            .map(str::to_string)
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        unknown.sort();
        unknown.dedup();
        Err(HtError::UnknownParameter { names: unknown })
    }

    /// Fail if the assignment references a name outside the space.
    pub fn validate(&self, assignment: &Assignment) -> HtResult<()> {
        self.ensure_known(assignment.keys().map(String::as_str))
    }

    /// Validate every domain; spaces built with [`Self::add`] skip this.
    pub fn validate_domains(&self) -> HtResult<()> {
        self.parameters.iter().try_for_each(HyperParameter::validate)
    }

    fn check_overrides(&self, overrides: &Assignment) -> HtResult<()> {
        self.validate_domains()?;
        self.validate(overrides)?;
        for (name, value) in overrides {
            let in_domain = self.get(name).is_some_and(|p| p.contains(value));
            if !in_domain {
                return Err(validation_error!(
                    "value {value} is outside the domain of '{name}'"
                ));
            }
        }
        Ok(())
    }

    /// Complete `overrides` with default values for every missing parameter.
    pub fn resolve(&self, overrides: &Assignment) -> HtResult<Assignment> {
        self.check_overrides(overrides)?;
        Ok(self
            .parameters
            .iter()
            .map(|p| {
                let value = overrides
                    .get(&p.name)
                    .cloned()
                    .unwrap_or_else(|| p.default_value());
                (p.name.clone(), value)
            })
            .collect())
    }

    /// Complete `overrides` by sampling every missing parameter.
    pub fn resolve_sampled<R: Rng + ?Sized>(
        &self,
        overrides: &Assignment,
        rng: &mut R,
    ) -> HtResult<Assignment> {
        self.check_overrides(overrides)?;
        let mut resolved = Assignment::new();
        for p in &self.parameters {
            let value = match overrides.get(&p.name) {
                Some(v) => v.clone(),
                None => p.sample(rng),
            };
            resolved.insert(p.name.clone(), value);
        }
        Ok(resolved)
    }

    /// Sample every parameter.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Assignment {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.sample(rng)))
            .collect()
    }

    pub fn defaults(&self) -> Assignment {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.default_value()))
            .collect()
    }

    /// Total number of distinct assignments (returns `None` if any parameter
    /// is continuous).
    pub fn cardinality(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            total = total.checked_mul(param.cardinality()?)?;
        }
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_space() -> HyperParameters {
        HyperParameters::new()
            .add(HyperParameter::int("units", 16, 32, 2))
            .add(HyperParameter::choice("activation", ["relu", "tanh"]))
            .add_boolean("optional_layer")
            .add_fixed("output_units", 1_i64)
            .add_log_uniform("lr", 1e-5, 1e-1)
    }

    #[test]
    fn duplicate_names_are_ignored() {
        let mut space = sample_space();
        assert_eq!(space.len(), 5);

        let added = space.register(HyperParameter::int("units", 0, 1, 1)).unwrap();
        assert!(!added);
        assert_eq!(space.len(), 5);
        assert_eq!(
            space.get("units").unwrap().kind,
            ParameterKind::Int {
                min: 16,
                max: 32,
                step: 2
            }
        );

        let merged = space
            .merge(vec![
                HyperParameter::float("dropout", 0.0, 0.5),
                HyperParameter::boolean("optional_layer"),
            ])
            .unwrap();
        assert_eq!(merged, 1);
        assert_eq!(
            space.names().collect::<Vec<_>>(),
            vec!["units", "activation", "optional_layer", "output_units", "lr", "dropout"]
        );
    }

    #[test]
    fn invalid_domains_are_rejected() {
        let mut space = HyperParameters::new();
        assert!(space.register(HyperParameter::int("a", 5, 1, 1)).is_err());
        assert!(space.register(HyperParameter::int("b", 1, 5, 0)).is_err());
        assert!(space
            .register(HyperParameter::log_uniform("c", 0.0, 1.0))
            .is_err());
        assert!(space
            .register(HyperParameter::choice::<i64>("d", []))
            .is_err());
        assert!(space.is_empty());
    }

    #[test]
    fn samples_stay_in_domain() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let assignment = space.sample(&mut rng);
            for param in space.iter() {
                let value = &assignment[&param.name];
                assert!(param.contains(value), "{} = {value}", param.name);
            }
            let units = assignment["units"].as_i64().unwrap();
            assert_eq!(units % 2, 0);
        }
    }

    #[test]
    fn stepped_float_samples_on_grid() {
        let param = HyperParameter::stepped_float("dropout", 0.0, 1.0, 0.25);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let v = param.sample(&mut rng).as_f64().unwrap();
            let k = (v / 0.25).round();
            assert!((v - k * 0.25).abs() < 1e-12);
            assert!((0.0..=1.0).contains(&v));
        }
        assert_eq!(param.cardinality(), Some(5));
    }

    #[test]
    fn unknown_names_fail_validation() {
        let space = sample_space();
        let mut assignment = Assignment::new();
        assignment.insert("units".into(), ParameterValue::Int(18));
        assignment.insert("depth".into(), ParameterValue::Int(3));

        match space.validate(&assignment) {
            Err(HtError::UnknownParameter { names }) => assert_eq!(names, vec!["depth"]),
            other => panic!("expected UnknownParameter, got {other:?}"),
        }
    }

    #[test]
    fn resolve_fills_defaults() {
        let space = sample_space();
        let mut overrides = Assignment::new();
        overrides.insert("activation".into(), "tanh".into());

        let resolved = space.resolve(&overrides).unwrap();
        assert_eq!(resolved.len(), 5);
        assert_eq!(resolved["activation"], ParameterValue::Text("tanh".into()));
        assert_eq!(resolved["units"], ParameterValue::Int(16));
        assert_eq!(resolved["optional_layer"], ParameterValue::Bool(false));
        assert_eq!(resolved["output_units"], ParameterValue::Int(1));
    }

    #[test]
    fn resolve_rejects_out_of_domain_override() {
        let space = sample_space();
        let mut overrides = Assignment::new();
        overrides.insert("units".into(), ParameterValue::Int(17));
        assert!(matches!(
            space.resolve(&overrides),
            Err(HtError::Validation(_))
        ));
    }

    #[test]
    fn resolve_sampled_keeps_overrides() {
        let space = sample_space();
        let mut overrides = Assignment::new();
        overrides.insert("units".into(), ParameterValue::Int(20));
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..20 {
            let resolved = space.resolve_sampled(&overrides, &mut rng).unwrap();
            assert_eq!(resolved["units"], ParameterValue::Int(20));
            assert_eq!(resolved.len(), 5);
        }
    }

    #[test]
    fn cardinality_of_discrete_space() {
        let space = HyperParameters::new()
            .add(HyperParameter::int("a", 1, 3, 1))
            .add_boolean("b")
            .add_choice("c", ["x", "y", "z"]);
        assert_eq!(space.cardinality(), Some(18));

        let continuous = space.add_float("d", 0.0, 1.0);
        assert_eq!(continuous.cardinality(), None);
    }

    #[test]
    fn grid_axes() {
        let int = HyperParameter::int("a", 0, 10, 5);
        assert_eq!(
            int.grid_values(5),
            vec![
                ParameterValue::Int(0),
                ParameterValue::Int(5),
                ParameterValue::Int(10)
            ]
        );
        assert_eq!(HyperParameter::float("b", 0.0, 1.0).grid_values(3).len(), 3);
        assert_eq!(HyperParameter::boolean("c").grid_values(3).len(), 2);
    }

    #[test]
    fn parameter_value_untagged_json() {
        let values: Vec<ParameterValue> =
            serde_json::from_str(r#"[true, 3, 0.5, "relu"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ParameterValue::Bool(true),
                ParameterValue::Int(3),
                ParameterValue::Float(0.5),
                ParameterValue::Text("relu".into())
            ]
        );
    }
}
