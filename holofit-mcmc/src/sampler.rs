//! Split-ensemble stretch-move sampling and the driver seam used by the scheduler.
//!
//! Each walker moves along the line through a randomly chosen walker of the other
//! half of the ensemble (Goodman & Weare 2010, CAMCoS 5, 65-80).

use crate::chain::Chain;
use holofit_core::data::FitData;
use holofit_core::errors::{FitError, FitResult};
use holofit_core::model::ForwardModel;
use ndarray::{Array1, Array2, ArrayView1, Zip};
use rand::Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use tracing::debug;

/// Produces a chain from an initial walker ensemble.
///
/// The scheduler only talks to samplers through this trait, so alternative
/// drivers (such as [`crate::tempering::ParallelTempering`]) are drop-in replacements.
pub trait EnsembleDriver {
    /// Run `n_steps` steps starting from `initial`, shape `(n_walkers, n_params)`.
    ///
    /// The returned chain has exactly `n_steps` steps and `n_walkers` walkers.
    /// Errors from the model are returned unchanged.
    fn run<M, R>(
        &self,
        model: &M,
        data: &FitData,
        initial: Array2<f64>,
        n_steps: usize,
        rng: &mut R,
    ) -> FitResult<Chain>
    where
        M: ForwardModel,
        R: Rng;

    /// Worker-thread hint for log-posterior evaluation.
    fn with_threads(self, threads: Option<usize>) -> Self
    where
        Self: Sized;
}

/// Stretch proposal along the line through a partner walker.
///
/// The stretch factor `z` is drawn from `g(z) ∝ 1/√z` on `[1/scale, scale]`.
#[derive(Debug, Clone, Copy)]
pub struct StretchMove {
    scale: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { scale: 2.0 }
    }
}

impl StretchMove {
    /// `scale` must exceed 1, otherwise every proposal is the current position.
    pub fn new(scale: f64) -> FitResult<Self> {
        if !(scale > 1.0 && scale.is_finite()) {
            return Err(FitError::InvalidParameter(format!(
                "Stretch scale must be finite and > 1, got {}",
                scale
            )));
        }
        Ok(Self { scale })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Inverse-CDF draw of the stretch factor.
    pub fn draw_factor<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let root = 1.0 + (self.scale - 1.0) * rng.gen::<f64>();
        root * root / self.scale
    }

    /// Move `walker` by factor `z` along the line through `partner`.
    pub fn stretch(&self, walker: ArrayView1<f64>, partner: ArrayView1<f64>, z: f64) -> Array1<f64> {
        Zip::from(&walker)
            .and(&partner)
            .map_collect(|&x, &c| c + z * (x - c))
    }

    /// Log of the volume factor `z^(d-1)` the move contributes to the acceptance ratio.
    pub fn log_jacobian(z: f64, n_params: usize) -> f64 {
        (n_params as f64 - 1.0) * z.ln()
    }
}

/// A candidate position for one walker of the active half.
struct Proposal {
    walker: usize,
    position: Array1<f64>,
    log_jacobian: f64,
}

/// Log-density of a walker, split into an untempered and a tempered part.
///
/// At inverse temperature β the walker's log-probability is `untempered + β·tempered`.
/// The plain sampler puts the whole log-posterior in `untempered`; parallel
/// tempering splits prior and likelihood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Density {
    pub untempered: f64,
    pub tempered: f64,
}

impl Density {
    pub fn posterior(log_posterior: f64) -> Self {
        Self {
            untempered: log_posterior,
            tempered: 0.0,
        }
    }

    pub fn at(&self, beta: f64) -> f64 {
        if self.untempered == f64::NEG_INFINITY || self.tempered == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        self.untempered + beta * self.tempered
    }

    /// Log Metropolis ratio for moving from `self` to `proposed` at inverse temperature `beta`.
    ///
    /// An invalid proposal is never accepted; any valid proposal leaves an invalid position.
    pub fn log_acceptance(&self, proposed: &Density, beta: f64, log_jacobian: f64) -> f64 {
        let (current, next) = (self.at(beta), proposed.at(beta));
        if !next.is_finite() {
            f64::NEG_INFINITY
        } else if !current.is_finite() {
            f64::INFINITY
        } else {
            log_jacobian + next - current
        }
    }

    fn is_nan(&self) -> bool {
        self.untempered.is_nan() || self.tempered.is_nan()
    }
}

/// Evaluate `f` at every point, in parallel, inside `pool` when one is given.
///
/// A NaN density breaks the sampler's contract with the model and is reported as a failure.
pub(crate) fn evaluate_batch<F>(
    pool: Option<&ThreadPool>,
    points: &[Vec<f64>],
    f: F,
) -> FitResult<Vec<Density>>
where
    F: Fn(&[f64]) -> FitResult<Density> + Sync,
{
    let evaluate = || {
        points
            .par_iter()
            .map(|x| f(x.as_slice()))
            .collect::<FitResult<Vec<Density>>>()
    };
    let densities = match pool {
        Some(pool) => pool.install(evaluate),
        None => evaluate(),
    }?;

    if let Some(i) = densities.iter().position(Density::is_nan) {
        return Err(FitError::sampling(format!(
            "Log-posterior returned NaN at {:?}",
            points[i]
        )));
    }
    Ok(densities)
}

pub(crate) fn build_pool(threads: Option<usize>) -> FitResult<Option<ThreadPool>> {
    threads
        .map(|n| {
            ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| FitError::sampling(format!("Failed to build thread pool: {}", e)))
        })
        .transpose()
}

/// Check the initial ensemble against the parameter count.
pub(crate) fn validate_ensemble(initial: &Array2<f64>, n_params: usize) -> FitResult<()> {
    let (n_walkers, n_cols) = initial.dim();
    if n_cols != n_params {
        return Err(FitError::InvalidParameter(format!(
            "Initial positions have {} parameters, expected {}",
            n_cols, n_params
        )));
    }
    if n_walkers < 2 || n_walkers % 2 != 0 {
        return Err(FitError::sampling(format!(
            "Number of walkers must be even and at least 2, got {}",
            n_walkers
        )));
    }
    if n_walkers < 2 * n_params {
        return Err(FitError::sampling(format!(
            "Need at least {} walkers for {} parameters, got {}",
            2 * n_params,
            n_params,
            n_walkers
        )));
    }
    Ok(())
}

pub(crate) fn rows(positions: &Array2<f64>) -> Vec<Vec<f64>> {
    positions.outer_iter().map(|row| row.to_vec()).collect()
}

/// Positions, densities and acceptance counts of one ensemble at a fixed temperature.
#[derive(Debug, Clone)]
pub(crate) struct Walkers {
    pub positions: Array2<f64>,
    pub densities: Vec<Density>,
    pub beta: f64,
    pub n_accepted: Array1<usize>,
    pub n_proposed: Array1<usize>,
}

impl Walkers {
    pub fn new(positions: Array2<f64>, densities: Vec<Density>, beta: f64) -> FitResult<Self> {
        let n_walkers = positions.nrows();
        let walkers = Self {
            positions,
            densities,
            beta,
            n_accepted: Array1::zeros(n_walkers),
            n_proposed: Array1::zeros(n_walkers),
        };
        if walkers.log_probs().iter().all(|lp| !lp.is_finite()) {
            return Err(FitError::sampling(
                "Every initial walker position has a non-finite log-posterior",
            ));
        }
        Ok(walkers)
    }

    pub fn log_probs(&self) -> Array1<f64> {
        self.densities.iter().map(|d| d.at(self.beta)).collect()
    }

    pub fn acceptance_fraction(&self) -> Array1<f64> {
        self.n_accepted
            .iter()
            .zip(self.n_proposed.iter())
            .map(|(&a, &p)| if p > 0 { a as f64 / p as f64 } else { 0.0 })
            .collect()
    }

    /// Advance every walker by one stretch move, one half of the ensemble at a time.
    pub fn step<R, F>(&mut self, stretch: &StretchMove, rng: &mut R, evaluate: &F) -> FitResult<()>
    where
        R: Rng + ?Sized,
        F: Fn(&[Vec<f64>]) -> FitResult<Vec<Density>>,
    {
        let n_walkers = self.positions.nrows();
        let half = n_walkers / 2;

        // Update first half using second half as complementary ensemble
        self.update_group(stretch, 0..half, half..n_walkers, rng, evaluate)?;

        // Update second half using first half as complementary ensemble
        self.update_group(stretch, half..n_walkers, 0..half, rng, evaluate)
    }

    fn update_group<R, F>(
        &mut self,
        stretch: &StretchMove,
        active_range: Range<usize>,
        complementary_range: Range<usize>,
        rng: &mut R,
        evaluate: &F,
    ) -> FitResult<()>
    where
        R: Rng + ?Sized,
        F: Fn(&[Vec<f64>]) -> FitResult<Vec<Density>>,
    {
        let partners = self
            .positions
            .slice(ndarray::s![complementary_range, ..])
            .to_owned();
        let n_params = self.positions.ncols();

        let proposals: Vec<Proposal> = active_range
            .map(|walker| {
                let z = stretch.draw_factor(rng);
                let partner = partners.row(rng.gen_range(0..partners.nrows()));
                Proposal {
                    walker,
                    position: stretch.stretch(self.positions.row(walker), partner, z),
                    log_jacobian: StretchMove::log_jacobian(z, n_params),
                }
            })
            .collect();

        let points: Vec<Vec<f64>> = proposals.iter().map(|p| p.position.to_vec()).collect();
        let densities = evaluate(&points)?;

        for (proposal, density) in proposals.into_iter().zip(densities) {
            let i = proposal.walker;
            let log_ratio =
                self.densities[i].log_acceptance(&density, self.beta, proposal.log_jacobian);
            self.n_proposed[i] += 1;
            if rng.gen::<f64>().ln() < log_ratio {
                self.positions.row_mut(i).assign(&proposal.position);
                self.densities[i] = density;
                self.n_accepted[i] += 1;
            }
        }

        Ok(())
    }
}

/// Affine-invariant ensemble sampler for Bayesian parameter estimation.
///
/// Walkers are split into two halves; each half is updated with stretch moves
/// against the other, and all proposals of a half are evaluated in parallel via rayon.
///
/// # Example
///
/// ```ignore
/// let sampler = EnsembleSampler::default().with_threads(Some(8));
/// let initial = model.parameters().sample(50, &mut rng)?;
/// let chain = sampler.run(&model, &data, initial, 1000, &mut rng)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct EnsembleSampler {
    stretch: StretchMove,
    threads: Option<usize>,
}

impl EnsembleSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a stretch scale other than the default of 2.
    pub fn with_stretch_param(mut self, scale: f64) -> FitResult<Self> {
        self.stretch = StretchMove::new(scale)?;
        Ok(self)
    }
}

impl EnsembleDriver for EnsembleSampler {
    fn run<M, R>(
        &self,
        model: &M,
        data: &FitData,
        initial: Array2<f64>,
        n_steps: usize,
        rng: &mut R,
    ) -> FitResult<Chain>
    where
        M: ForwardModel,
        R: Rng,
    {
        validate_ensemble(&initial, model.parameters().len())?;
        let pool = build_pool(self.threads)?;
        let evaluate = |points: &[Vec<f64>]| {
            evaluate_batch(pool.as_ref(), points, |x| {
                Ok(Density::posterior(model.log_posterior(x, data)?))
            })
        };

        let densities = evaluate(&rows(&initial))?;
        let mut walkers = Walkers::new(initial, densities, 1.0)?;
        let mut chain = Chain::new(model.parameters().names());

        for _ in 0..n_steps {
            walkers.step(&self.stretch, rng, &evaluate)?;
            chain.push(walkers.positions.clone(), walkers.log_probs());
        }

        let acceptance = walkers.acceptance_fraction();
        debug!(
            walkers = walkers.positions.nrows(),
            steps = n_steps,
            acceptance = acceptance.mean().unwrap_or(0.0),
            "Ensemble run finished"
        );
        chain.set_acceptance(acceptance);
        Ok(chain)
    }

    fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }
}
