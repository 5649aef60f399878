//! Ensemble MCMC for hologram fitting.
//!
//! # Module Organisation
//!
//! - `sampler`: the affine-invariant stretch-move sampler and the [`EnsembleDriver`] trait
//! - `tempering`: a parallel-tempered variant of the sampler
//! - `chain`: walker trajectories, thinning and autocorrelation
//! - `summary`: flattened sample tables and the credible-bound summary
//! - `result`: [`SamplingResult`] and its on-disk form
//! - `schedule`: subset tempering over growing pixel subsets

pub mod chain;
pub mod result;
pub mod sampler;
pub mod schedule;
pub mod summary;
pub mod tempering;

pub use chain::{Chain, Thin};
pub use result::SamplingResult;
pub use sampler::{EnsembleDriver, EnsembleSampler, StretchMove};
pub use schedule::{fit_timeseries, subset_tempering, subset_tempering_with_observer, Stage};
pub use summary::{summarize, SampleTable, CREDIBLE_DROP};
pub use tempering::{ParallelTempering, TemperedRun};
