//! Bayesian fitting of hologram models by staged subset-tempering MCMC.
//!
//! `holofit_core` holds priors, parameters, data and the [`ForwardModel`] trait;
//! `holofit_mcmc` holds the samplers, the posterior summary and the stage
//! scheduler. The commonly used items of both are re-exported here.

pub use holofit_core::config::TemperingOptions;
pub use holofit_core::data::{FitData, Image, RandomSubset, SubsetSelector};
pub use holofit_core::errors::{FitError, FitResult};
pub use holofit_core::model::{ForwardModel, Repriored};
pub use holofit_core::parameter::{Parameter, ParameterSet};
pub use holofit_core::prior::{BoundedGaussian, Gaussian, Prior, Uniform};
pub use holofit_core::uncertain::UncertainValue;
pub use holofit_mcmc::{
    fit_timeseries, subset_tempering, subset_tempering_with_observer, Chain, EnsembleDriver,
    EnsembleSampler, ParallelTempering, SampleTable, SamplingResult, Thin,
};
