//! The interface between the samplers and a forward scattering model.

use crate::data::FitData;
use crate::errors::FitResult;
use crate::parameter::ParameterSet;

/// A forward model that can be fitted to image data.
///
/// Implementations evaluate how well a parameter vector (in the order of
/// [`ForwardModel::parameters`]) reproduces the observed data. Evaluations must
/// be free of side effects, as walkers are evaluated concurrently.
///
/// Return `-inf` for parameter vectors outside the model's support, never NaN.
/// A model that cannot evaluate a particular configuration at all (for example a
/// scatterer geometry its scattering theory does not handle) should return
/// [`crate::errors::FitError::IncompatibleModel`], which is passed through to the caller.
pub trait ForwardModel: Send + Sync {
    fn parameters(&self) -> &ParameterSet;

    fn log_likelihood(&self, values: &[f64], data: &FitData) -> FitResult<f64>;

    fn log_prior(&self, values: &[f64]) -> FitResult<f64> {
        self.parameters().log_prior(values)
    }

    /// `log_prior + log_likelihood`. The likelihood is skipped when the prior is `-inf`.
    fn log_posterior(&self, values: &[f64], data: &FitData) -> FitResult<f64> {
        let log_prior = self.log_prior(values)?;
        if !log_prior.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(log_prior + self.log_likelihood(values, data)?)
    }
}

impl<M: ForwardModel + ?Sized> ForwardModel for &M {
    fn parameters(&self) -> &ParameterSet {
        (**self).parameters()
    }

    fn log_likelihood(&self, values: &[f64], data: &FitData) -> FitResult<f64> {
        (**self).log_likelihood(values, data)
    }

    fn log_prior(&self, values: &[f64]) -> FitResult<f64> {
        (**self).log_prior(values)
    }
}

/// A model evaluated under a replacement set of priors.
///
/// The likelihood is delegated unchanged to the wrapped model. Used to carry the
/// refined priors of one frame forward as the priors of the next.
pub struct Repriored<M> {
    inner: M,
    parameters: ParameterSet,
}

impl<M: ForwardModel> Repriored<M> {
    /// Wrap `inner` with `parameters`, which must name the same parameters in the same order.
    pub fn new(inner: M, parameters: ParameterSet) -> FitResult<Self> {
        if inner.parameters().names() != parameters.names() {
            return Err(crate::errors::FitError::InvalidParameter(format!(
                "Replacement parameters {:?} do not match model parameters {:?}",
                parameters.names(),
                inner.parameters().names()
            )));
        }
        Ok(Self { inner, parameters })
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: ForwardModel> ForwardModel for Repriored<M> {
    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn log_likelihood(&self, values: &[f64], data: &FitData) -> FitResult<f64> {
        self.inner.log_likelihood(values, data)
    }
}
