//! Named fit parameters and the ordered set that defines a model's parameter space.

use crate::errors::{FitError, FitResult};
use crate::prior::{Prior, MAX_DRAWS};
use crate::uncertain::UncertainValue;
use ndarray::Array2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single fit parameter: a unique name, a prior and inclusive bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredParameter")]
pub struct Parameter {
    name: String,
    prior: Box<dyn Prior>,
    #[serde(with = "lower_bound", default = "neg_infinity")]
    lower: f64,
    #[serde(with = "upper_bound", default = "infinity")]
    upper: f64,
}

#[derive(Deserialize)]
struct StoredParameter {
    name: String,
    prior: Box<dyn Prior>,
    #[serde(with = "lower_bound", default = "neg_infinity")]
    lower: f64,
    #[serde(with = "upper_bound", default = "infinity")]
    upper: f64,
}

impl TryFrom<StoredParameter> for Parameter {
    type Error = FitError;

    fn try_from(stored: StoredParameter) -> FitResult<Self> {
        Parameter::new(stored.name, stored.prior).with_bounds(stored.lower, stored.upper)
    }
}

fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

fn infinity() -> f64 {
    f64::INFINITY
}

impl Parameter {
    /// Create a parameter whose bounds are the support of its prior.
    pub fn new(name: impl Into<String>, prior: Box<dyn Prior>) -> Self {
        let (lower, upper) = prior.support();
        Self {
            name: name.into(),
            prior,
            lower,
            upper,
        }
    }

    /// Restrict the parameter to `[lower, upper]`.
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> FitResult<Self> {
        if lower.is_nan() || upper.is_nan() || lower >= upper {
            return Err(FitError::InvalidParameter(format!(
                "Parameter '{}' requires lower < upper, got [{}, {}]",
                self.name, lower, upper
            )));
        }
        self.lower = lower;
        self.upper = upper;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prior(&self) -> &dyn Prior {
        self.prior.as_ref()
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }

    pub fn ln_prior(&self, x: f64) -> f64 {
        if self.contains(x) {
            self.prior.ln_prob(x)
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Draw a value from the prior, redrawing anything outside the bounds.
    pub fn sample(&self, rng: &mut dyn RngCore) -> FitResult<f64> {
        for _ in 0..MAX_DRAWS {
            let x = self.prior.sample(rng);
            if self.contains(x) {
                return Ok(x);
            }
        }
        Err(FitError::InvalidParameter(format!(
            "Could not draw a value for '{}' inside [{}, {}] from prior {}",
            self.name, self.lower, self.upper, self.prior
        )))
    }

    /// Copy of this parameter with its prior refined from a posterior summary.
    pub fn refined(&self, summary: &UncertainValue, extra_uncertainty: f64) -> FitResult<Self> {
        let prior = self
            .prior
            .refine(summary, extra_uncertainty)
            .map_err(|e| e.for_parameter(&self.name))?;
        Ok(Self {
            name: self.name.clone(),
            prior,
            lower: self.lower,
            upper: self.upper,
        })
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.prior)
    }
}

/// Ordered collection of uniquely named parameters.
///
/// The order defines the column order of walker positions and chains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "StoredParameters")]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter whose bounds follow its prior.
    pub fn add(&mut self, name: impl Into<String>, prior: Box<dyn Prior>) -> FitResult<&mut Self> {
        self.push(Parameter::new(name, prior))
    }

    /// Add a fully specified parameter.
    ///
    /// Returns an error if a parameter with the same name already exists.
    pub fn push(&mut self, parameter: Parameter) -> FitResult<&mut Self> {
        if self.get(parameter.name()).is_some() {
            return Err(FitError::InvalidParameter(format!(
                "Parameter '{}' already exists",
                parameter.name()
            )));
        }
        self.parameters.push(parameter);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// Sum of the per-parameter log-priors; `-inf` if any value is outside its bounds.
    pub fn log_prior(&self, values: &[f64]) -> FitResult<f64> {
        if values.len() != self.len() {
            return Err(FitError::InvalidParameter(format!(
                "Expected {} parameter values, got {}",
                self.len(),
                values.len()
            )));
        }
        Ok(self
            .parameters
            .iter()
            .zip(values)
            .map(|(p, &x)| p.ln_prior(x))
            .sum())
    }

    /// Draw `n_walkers` positions, shape `(n_walkers, n_params)`.
    pub fn sample<R: RngCore>(&self, n_walkers: usize, rng: &mut R) -> FitResult<Array2<f64>> {
        let mut positions = Array2::zeros((n_walkers, self.len()));
        for mut row in positions.outer_iter_mut() {
            for (value, parameter) in row.iter_mut().zip(&self.parameters) {
                *value = parameter.sample(rng)?;
            }
        }
        Ok(positions)
    }

    /// Refine every prior from its posterior summary.
    ///
    /// `summaries` and `extra_uncertainty` (when given) are in parameter order.
    pub fn refined(
        &self,
        summaries: &[UncertainValue],
        extra_uncertainty: Option<&[f64]>,
    ) -> FitResult<ParameterSet> {
        if summaries.len() != self.len() {
            return Err(FitError::InvalidParameter(format!(
                "Expected {} summaries, got {}",
                self.len(),
                summaries.len()
            )));
        }
        if let Some(extra) = extra_uncertainty {
            if extra.len() != self.len() {
                return Err(FitError::InvalidParameter(format!(
                    "Expected {} extra uncertainties, got {}",
                    self.len(),
                    extra.len()
                )));
            }
        }

        let parameters = self
            .parameters
            .iter()
            .zip(summaries)
            .enumerate()
            .map(|(i, (parameter, summary))| {
                let extra = extra_uncertainty.map_or(0.0, |e| e[i]);
                parameter.refined(summary, extra)
            })
            .collect::<FitResult<Vec<_>>>()?;

        Ok(ParameterSet { parameters })
    }
}

/// Parameter list as stored on disk, before the unique-name check.
#[derive(Deserialize)]
struct StoredParameters {
    parameters: Vec<Parameter>,
}

impl TryFrom<StoredParameters> for ParameterSet {
    type Error = FitError;

    fn try_from(stored: StoredParameters) -> FitResult<Self> {
        let mut set = ParameterSet::new();
        for parameter in stored.parameters {
            set.push(parameter)?;
        }
        Ok(set)
    }
}

/// Serialize a lower bound, writing `-inf` as a missing value.
///
/// JSON has no representation for infinities.
pub mod lower_bound {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

/// Serialize an upper bound, writing `+inf` as a missing value.
pub mod upper_bound {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::{Gaussian, Uniform};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_parameters() -> ParameterSet {
        let mut params = ParameterSet::new();
        params
            .add("x", Box::new(Gaussian::new(0.0, 1.0).unwrap()))
            .unwrap()
            .add("n", Box::new(Uniform::new(1.0, 2.0).unwrap()))
            .unwrap();
        params
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut params = two_parameters();
        let result = params.add("x", Box::new(Gaussian::new(1.0, 1.0).unwrap()));
        assert!(result.is_err());
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_bounds_follow_prior_support() {
        let params = two_parameters();
        let n = params.get("n").unwrap();
        assert_eq!(n.lower_bound(), 1.0);
        assert_eq!(n.upper_bound(), 2.0);
        let x = params.get("x").unwrap();
        assert_eq!(x.lower_bound(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_sampling_respects_explicit_bounds() {
        let mut params = ParameterSet::new();
        params
            .push(
                Parameter::new("r", Box::new(Gaussian::new(0.0, 1.0).unwrap()))
                    .with_bounds(0.0, f64::INFINITY)
                    .unwrap(),
            )
            .unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let positions = params.sample(200, &mut rng).unwrap();
        assert_eq!(positions.dim(), (200, 1));
        assert!(positions.iter().all(|&r| r >= 0.0));
    }

    #[test]
    fn test_log_prior_outside_bounds() {
        let params = two_parameters();
        assert!(params.log_prior(&[0.0, 1.5]).unwrap().is_finite());
        assert_eq!(params.log_prior(&[0.0, 3.0]).unwrap(), f64::NEG_INFINITY);
        assert!(params.log_prior(&[0.0]).is_err());
    }

    #[test]
    fn test_refined_names_the_failing_parameter() {
        let params = two_parameters();
        let summaries = [
            UncertainValue::new(0.5, 0.1, 0.1),
            UncertainValue::new(1.5, 0.0, 0.0),
        ];
        let err = params.refined(&summaries, None).unwrap_err();
        match err {
            FitError::PriorRefinement { parameter, .. } => assert_eq!(parameter, "n"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_refined_keeps_order_and_bounds() {
        let params = two_parameters();
        let summaries = [
            UncertainValue::new(0.5, 0.1, 0.2),
            UncertainValue::new(1.5, 0.05, 0.01),
        ];
        let refined = params.refined(&summaries, Some(&[0.0, 0.1])).unwrap();
        assert_eq!(refined.names(), vec!["x", "n"]);
        assert_eq!(refined.get("x").unwrap().to_string(), "x: mu=0.5, sd=0.2");
        assert_eq!(
            refined.get("n").unwrap().to_string(),
            "n: mu=1.5, sd=0.1, lb=1, ub=2"
        );
    }

    #[test]
    fn test_duplicate_names_rejected_on_deserialize() {
        let json = serde_json::to_string(&two_parameters())
            .unwrap()
            .replace("\"n\"", "\"x\"");
        let err = serde_json::from_str::<ParameterSet>(&json).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{}", err);
    }

    #[test]
    fn test_inverted_bounds_rejected_on_deserialize() {
        let json = r#"{"parameters": [{
            "name": "r",
            "prior": {"family": "Gaussian", "mu": 0.0, "sd": 1.0},
            "lower": 2.0,
            "upper": 1.0
        }]}"#;
        assert!(serde_json::from_str::<ParameterSet>(json).is_err());
    }

    #[test]
    fn test_serde_round_trip_with_infinite_bounds() {
        let params = two_parameters();
        let json = serde_json::to_string(&params).unwrap();
        let restored: ParameterSet = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.names(), params.names());
        assert_eq!(restored.get("x").unwrap().upper_bound(), f64::INFINITY);
        assert_eq!(
            serde_json::to_value(&restored).unwrap(),
            serde_json::to_value(&params).unwrap()
        );
    }
}
