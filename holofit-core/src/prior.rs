//! Prior distributions over a single scalar fit parameter.
//!
//! Each prior knows how to draw samples, evaluate its log-density and build an
//! updated prior from a summarized posterior. Priors are immutable: refinement
//! always returns a new boxed prior rather than mutating the existing one.

use crate::errors::{FitError, FitResult};
use crate::uncertain::{format_significant, UncertainValue};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Upper limit on rejection-sampling attempts for truncated distributions.
pub const MAX_DRAWS: usize = 10_000;

/// A probability distribution over one fit parameter.
#[typetag::serde(tag = "family")]
pub trait Prior: fmt::Debug + fmt::Display + Send + Sync {
    /// Draw a single value from the distribution.
    fn sample(&self, rng: &mut dyn RngCore) -> f64;

    /// Log-density at `x`, up to a constant. `-inf` outside the support.
    fn ln_prob(&self, x: f64) -> f64;

    /// Inclusive support `(lower, upper)`.
    fn support(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Build the prior for the next stage from a summarized posterior.
    ///
    /// The width of the new prior is the wider of the two credible deviations,
    /// floored at `extra_uncertainty`.
    fn refine(&self, summary: &UncertainValue, extra_uncertainty: f64)
        -> FitResult<Box<dyn Prior>>;

    fn clone_box(&self) -> Box<dyn Prior>;
}

impl Clone for Box<dyn Prior> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Width and centre for a refined prior, rejecting degenerate posteriors.
fn refined_moments(summary: &UncertainValue, extra_uncertainty: f64) -> FitResult<(f64, f64)> {
    if !summary.value().is_finite() {
        return Err(FitError::prior_refinement(
            "",
            format!("best-fit value {} is not finite", summary.value()),
        ));
    }
    if !summary.plus().is_finite() || !summary.minus().is_finite() || !extra_uncertainty.is_finite()
    {
        return Err(FitError::prior_refinement(
            "",
            format!(
                "credible bounds +{} / -{} are not finite",
                summary.plus(), summary.minus()
            ),
        ));
    }
    let sd = summary.width().max(extra_uncertainty);
    if sd <= 0.0 {
        return Err(FitError::prior_refinement(
            "",
            format!(
                "posterior has zero width around {} (all retained samples collapsed)",
                summary.value()
            ),
        ));
    }
    Ok((summary.value(), sd))
}

fn ln_normal(x: f64, mu: f64, sd: f64) -> f64 {
    let z = (x - mu) / sd;
    -0.5 * z * z - sd.ln() - 0.5 * (2.0 * PI).ln()
}

/// Flat prior on `[lower, upper]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredUniform")]
pub struct Uniform {
    lower: f64,
    upper: f64,
}

#[derive(Deserialize)]
struct StoredUniform {
    lower: f64,
    upper: f64,
}

impl TryFrom<StoredUniform> for Uniform {
    type Error = FitError;

    fn try_from(stored: StoredUniform) -> FitResult<Self> {
        Uniform::new(stored.lower, stored.upper)
    }
}

impl Uniform {
    pub fn new(lower: f64, upper: f64) -> FitResult<Self> {
        if !lower.is_finite() || !upper.is_finite() || lower >= upper {
            return Err(FitError::InvalidParameter(format!(
                "Uniform prior requires finite lower < upper, got [{}, {}]",
                lower, upper
            )));
        }
        Ok(Self { lower, upper })
    }
}

#[typetag::serde]
impl Prior for Uniform {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        rng.gen_range(self.lower..self.upper)
    }

    fn ln_prob(&self, x: f64) -> f64 {
        if x >= self.lower && x <= self.upper {
            -(self.upper - self.lower).ln()
        } else {
            f64::NEG_INFINITY
        }
    }

    fn support(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    /// A flat prior carries no shape to keep, so the posterior is re-expressed as a
    /// Gaussian truncated to the original support.
    fn refine(
        &self,
        summary: &UncertainValue,
        extra_uncertainty: f64,
    ) -> FitResult<Box<dyn Prior>> {
        let (mu, sd) = refined_moments(summary, extra_uncertainty)?;
        Ok(Box::new(BoundedGaussian::new(mu, sd, self.lower, self.upper)?))
    }

    fn clone_box(&self) -> Box<dyn Prior> {
        Box::new(self.clone())
    }
}

impl fmt::Display for Uniform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uniform lb={}, ub={}",
            format_significant(self.lower, 3),
            format_significant(self.upper, 3)
        )
    }
}

/// Normal prior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredGaussian")]
pub struct Gaussian {
    mu: f64,
    sd: f64,
}

#[derive(Deserialize)]
struct StoredGaussian {
    mu: f64,
    sd: f64,
}

impl TryFrom<StoredGaussian> for Gaussian {
    type Error = FitError;

    fn try_from(stored: StoredGaussian) -> FitResult<Self> {
        Gaussian::new(stored.mu, stored.sd)
    }
}

impl Gaussian {
    pub fn new(mu: f64, sd: f64) -> FitResult<Self> {
        if !mu.is_finite() || !sd.is_finite() || sd <= 0.0 {
            return Err(FitError::InvalidParameter(format!(
                "Gaussian prior requires finite mu and sd > 0, got mu={}, sd={}",
                mu, sd
            )));
        }
        Ok(Self { mu, sd })
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    pub fn sd(&self) -> f64 {
        self.sd
    }
}

#[typetag::serde]
impl Prior for Gaussian {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        // sd was validated as finite and positive at construction
        match Normal::new(self.mu, self.sd) {
            Ok(normal) => normal.sample(rng),
            Err(_) => self.mu,
        }
    }

    fn ln_prob(&self, x: f64) -> f64 {
        ln_normal(x, self.mu, self.sd)
    }

    fn refine(
        &self,
        summary: &UncertainValue,
        extra_uncertainty: f64,
    ) -> FitResult<Box<dyn Prior>> {
        let (mu, sd) = refined_moments(summary, extra_uncertainty)?;
        Ok(Box::new(Gaussian::new(mu, sd)?))
    }

    fn clone_box(&self) -> Box<dyn Prior> {
        Box::new(self.clone())
    }
}

impl fmt::Display for Gaussian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mu={}, sd={}",
            format_significant(self.mu, 3),
            format_significant(self.sd, 3)
        )
    }
}

/// Normal prior truncated to `[lower, upper]`. Either bound may be infinite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredBoundedGaussian")]
pub struct BoundedGaussian {
    mu: f64,
    sd: f64,
    #[serde(with = "crate::parameter::lower_bound")]
    lower: f64,
    #[serde(with = "crate::parameter::upper_bound")]
    upper: f64,
}

#[derive(Deserialize)]
struct StoredBoundedGaussian {
    mu: f64,
    sd: f64,
    #[serde(with = "crate::parameter::lower_bound")]
    lower: f64,
    #[serde(with = "crate::parameter::upper_bound")]
    upper: f64,
}

impl TryFrom<StoredBoundedGaussian> for BoundedGaussian {
    type Error = FitError;

    fn try_from(stored: StoredBoundedGaussian) -> FitResult<Self> {
        BoundedGaussian::new(stored.mu, stored.sd, stored.lower, stored.upper)
    }
}

impl BoundedGaussian {
    pub fn new(mu: f64, sd: f64, lower: f64, upper: f64) -> FitResult<Self> {
        Gaussian::new(mu, sd)?;
        if lower.is_nan() || upper.is_nan() || lower >= upper {
            return Err(FitError::InvalidParameter(format!(
                "Bounded Gaussian prior requires lower < upper, got [{}, {}]",
                lower, upper
            )));
        }
        Ok(Self {
            mu,
            sd,
            lower,
            upper,
        })
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    pub fn sd(&self) -> f64 {
        self.sd
    }
}

#[typetag::serde]
impl Prior for BoundedGaussian {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        let normal = match Normal::new(self.mu, self.sd) {
            Ok(normal) => normal,
            Err(_) => return self.mu.clamp(self.lower, self.upper),
        };
        for _ in 0..MAX_DRAWS {
            let x = normal.sample(rng);
            if x >= self.lower && x <= self.upper {
                return x;
            }
        }
        // Almost no mass inside the bounds; fall back to the closest admissible point.
        self.mu.clamp(self.lower, self.upper)
    }

    fn ln_prob(&self, x: f64) -> f64 {
        if x >= self.lower && x <= self.upper {
            ln_normal(x, self.mu, self.sd)
        } else {
            f64::NEG_INFINITY
        }
    }

    fn support(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    fn refine(
        &self,
        summary: &UncertainValue,
        extra_uncertainty: f64,
    ) -> FitResult<Box<dyn Prior>> {
        let (mu, sd) = refined_moments(summary, extra_uncertainty)?;
        Ok(Box::new(BoundedGaussian::new(
            mu,
            sd,
            self.lower,
            self.upper,
        )?))
    }

    fn clone_box(&self) -> Box<dyn Prior> {
        Box::new(self.clone())
    }
}

impl fmt::Display for BoundedGaussian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mu={}, sd={}",
            format_significant(self.mu, 3),
            format_significant(self.sd, 3)
        )?;
        if self.lower != f64::NEG_INFINITY {
            write!(f, ", lb={}", format_significant(self.lower, 3))?;
        }
        if self.upper != f64::INFINITY {
            write!(f, ", ub={}", format_significant(self.upper, 3))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use is_close::is_close;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_validation() {
        assert!(Uniform::new(0.0, 1.0).is_ok());
        assert!(Uniform::new(1.0, 1.0).is_err());
        assert!(Uniform::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_uniform_samples_stay_in_support() {
        let prior = Uniform::new(-1.0, 2.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let x = prior.sample(&mut rng);
            assert!((-1.0..2.0).contains(&x));
        }
        assert_relative_eq!(prior.ln_prob(0.5), -(3.0f64).ln());
        assert_eq!(prior.ln_prob(2.5), f64::NEG_INFINITY);
    }

    #[test]
    fn test_gaussian_ln_prob_peak() {
        let prior = Gaussian::new(0.0, 1.0).unwrap();
        assert_relative_eq!(prior.ln_prob(0.0), -0.5 * (2.0 * PI).ln());
        assert!(prior.ln_prob(0.0) > prior.ln_prob(1.0));
        assert!(is_close!(prior.ln_prob(1.0) - prior.ln_prob(0.0), -0.5));
    }

    #[test]
    fn test_bounded_gaussian_respects_bounds() {
        let prior = BoundedGaussian::new(0.0, 5.0, -1.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let x = prior.sample(&mut rng);
            assert!((-1.0..=1.0).contains(&x));
        }
        assert_eq!(prior.ln_prob(1.5), f64::NEG_INFINITY);
    }

    #[test]
    fn test_gaussian_refines_to_gaussian() {
        let prior = Gaussian::new(0.0, 1.0).unwrap();
        let refined = prior
            .refine(&UncertainValue::new(3.0, 0.2, 0.1), 0.0)
            .unwrap();
        assert_eq!(refined.to_string(), "mu=3, sd=0.2");
        assert_eq!(refined.support(), (f64::NEG_INFINITY, f64::INFINITY));
    }

    #[test]
    fn test_uniform_refines_to_bounded_gaussian_with_same_support() {
        let prior = Uniform::new(0.0, 10.0).unwrap();
        let refined = prior
            .refine(&UncertainValue::new(4.0, 0.5, 0.25), 0.0)
            .unwrap();
        assert_eq!(refined.support(), (0.0, 10.0));
        assert_eq!(refined.to_string(), "mu=4, sd=0.5, lb=0, ub=10");
    }

    #[test]
    fn test_extra_uncertainty_is_a_floor() {
        let prior = Gaussian::new(0.0, 1.0).unwrap();
        let refined = prior
            .refine(&UncertainValue::new(1.0, 0.01, 0.02), 0.5)
            .unwrap();
        assert_eq!(refined.to_string(), "mu=1, sd=0.5");

        let refined = prior
            .refine(&UncertainValue::new(1.0, 0.8, 0.02), 0.5)
            .unwrap();
        assert_eq!(refined.to_string(), "mu=1, sd=0.8");
    }

    #[test]
    fn test_zero_width_refinement_fails() {
        let prior = Gaussian::new(0.0, 1.0).unwrap();
        let err = prior
            .refine(&UncertainValue::new(1.0, 0.0, 0.0), 0.0)
            .unwrap_err();
        assert!(matches!(err, FitError::PriorRefinement { .. }));
    }

    #[test]
    fn test_non_finite_refinement_fails() {
        let prior = BoundedGaussian::new(0.0, 1.0, 0.0, f64::INFINITY).unwrap();
        let err = prior
            .refine(&UncertainValue::new(f64::NAN, 0.1, 0.1), 0.0)
            .unwrap_err();
        assert!(matches!(err, FitError::PriorRefinement { .. }));
    }

    #[test]
    fn test_typetag_round_trip() {
        let prior: Box<dyn Prior> =
            Box::new(BoundedGaussian::new(1.0, 0.5, 0.0, f64::INFINITY).unwrap());
        let json = serde_json::to_string(&prior).unwrap();
        assert!(json.contains("\"family\":\"BoundedGaussian\""));

        let restored: Box<dyn Prior> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.support(), (0.0, f64::INFINITY));
        assert_eq!(restored.to_string(), prior.to_string());
    }

    #[test]
    fn test_degenerate_priors_fail_to_deserialize() {
        let cases = [
            r#"{"family":"Uniform","lower":1.0,"upper":1.0}"#,
            r#"{"family":"Gaussian","mu":0.0,"sd":-1.0}"#,
            r#"{"family":"BoundedGaussian","mu":0.0,"sd":1.0,"lower":2.0,"upper":1.0}"#,
        ];
        for json in cases {
            let err = serde_json::from_str::<Box<dyn Prior>>(json).unwrap_err();
            assert!(err.to_string().contains("requires"), "{}: {}", json, err);
        }
    }
}
