//! Parallel-tempered ensemble sampling.
//!
//! A ladder of stretch-move ensembles runs at inverse temperatures β_k = 2^(-k/2),
//! each targeting `log_prior + β·log_likelihood`. After every step, walkers of
//! adjacent rungs are paired at random and proposed for exchange, which lets the
//! hot rungs carry walkers across barriers the β = 1 rung cannot cross alone.

use crate::chain::Chain;
use crate::sampler::{
    build_pool, evaluate_batch, rows, validate_ensemble, Density, EnsembleDriver, StretchMove,
    Walkers,
};
use holofit_core::data::FitData;
use holofit_core::errors::{FitError, FitResult};
use holofit_core::model::ForwardModel;
use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Chains from every rung of a tempered run.
#[derive(Debug, Clone)]
pub struct TemperedRun {
    /// One chain per rung, coldest (β = 1) first
    pub chains: Vec<Chain>,
    pub betas: Vec<f64>,
    /// Fraction of accepted exchanges between rung k and k + 1
    pub swap_acceptance: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct ParallelTempering {
    n_temps: usize,
    stretch: StretchMove,
    threads: Option<usize>,
}

impl ParallelTempering {
    pub fn new(n_temps: usize) -> FitResult<Self> {
        if n_temps == 0 {
            return Err(FitError::InvalidParameter(
                "Parallel tempering needs at least one temperature".to_string(),
            ));
        }
        Ok(Self {
            n_temps,
            stretch: StretchMove::default(),
            threads: None,
        })
    }

    pub fn with_stretch_param(mut self, scale: f64) -> FitResult<Self> {
        self.stretch = StretchMove::new(scale)?;
        Ok(self)
    }

    pub fn n_temps(&self) -> usize {
        self.n_temps
    }

    /// Inverse temperatures of the ladder, T_k = √2^k.
    pub fn betas(&self) -> Vec<f64> {
        (0..self.n_temps)
            .map(|k| 2f64.powf(-(k as f64) / 2.0))
            .collect()
    }

    /// Run every rung for `n_steps` steps, all starting from `initial`.
    pub fn run_ladder<M, R>(
        &self,
        model: &M,
        data: &FitData,
        initial: Array2<f64>,
        n_steps: usize,
        rng: &mut R,
    ) -> FitResult<TemperedRun>
    where
        M: ForwardModel,
        R: Rng,
    {
        validate_ensemble(&initial, model.parameters().len())?;
        let pool = build_pool(self.threads)?;
        let evaluate = |points: &[Vec<f64>]| {
            evaluate_batch(pool.as_ref(), points, |x| {
                let log_prior = model.log_prior(x)?;
                if !log_prior.is_finite() {
                    return Ok(Density {
                        untempered: f64::NEG_INFINITY,
                        tempered: 0.0,
                    });
                }
                Ok(Density {
                    untempered: log_prior,
                    tempered: model.log_likelihood(x, data)?,
                })
            })
        };

        let betas = self.betas();
        let densities = evaluate(&rows(&initial))?;
        let mut rungs = betas
            .iter()
            .map(|&beta| Walkers::new(initial.clone(), densities.clone(), beta))
            .collect::<FitResult<Vec<_>>>()?;

        let names = model.parameters().names();
        let mut chains: Vec<Chain> = betas.iter().map(|_| Chain::new(names.clone())).collect();
        let mut swaps_accepted = Array1::<f64>::zeros(self.n_temps - 1);
        let mut swaps_proposed = Array1::<f64>::zeros(self.n_temps - 1);

        for _ in 0..n_steps {
            for rung in rungs.iter_mut() {
                rung.step(&self.stretch, rng, &evaluate)?;
            }

            for k in (0..self.n_temps - 1).rev() {
                let (cold, hot) = rungs.split_at_mut(k + 1);
                let accepted = exchange(&mut cold[k], &mut hot[0], rng);
                swaps_accepted[k] += accepted as f64;
                swaps_proposed[k] += cold[k].positions.nrows() as f64;
            }

            for (chain, rung) in chains.iter_mut().zip(&rungs) {
                chain.push(rung.positions.clone(), rung.log_probs());
            }
        }

        for (chain, rung) in chains.iter_mut().zip(&rungs) {
            chain.set_acceptance(rung.acceptance_fraction());
        }

        let swap_acceptance = Array1::from_shape_fn(self.n_temps - 1, |k| {
            if swaps_proposed[k] > 0.0 {
                swaps_accepted[k] / swaps_proposed[k]
            } else {
                0.0
            }
        });
        debug!(
            temps = self.n_temps,
            steps = n_steps,
            swap_acceptance = ?swap_acceptance.to_vec(),
            "Tempered run finished"
        );

        Ok(TemperedRun {
            chains,
            betas,
            swap_acceptance,
        })
    }
}

/// Propose exchanging each walker of `cold` with a randomly paired walker of `hot`.
///
/// Returns the number of accepted exchanges.
fn exchange<R: Rng + ?Sized>(cold: &mut Walkers, hot: &mut Walkers, rng: &mut R) -> usize {
    let mut partners: Vec<usize> = (0..hot.positions.nrows()).collect();
    partners.shuffle(rng);

    let delta_beta = cold.beta - hot.beta;
    let mut accepted = 0;
    for (i, &j) in partners.iter().enumerate() {
        let log_alpha =
            delta_beta * (hot.densities[j].tempered - cold.densities[i].tempered);
        // NaN (both likelihoods infinite) compares false and is rejected
        if rng.gen::<f64>().ln() < log_alpha {
            let cold_row = cold.positions.row(i).to_owned();
            cold.positions.row_mut(i).assign(&hot.positions.row(j));
            hot.positions.row_mut(j).assign(&cold_row);
            std::mem::swap(&mut cold.densities[i], &mut hot.densities[j]);
            accepted += 1;
        }
    }
    accepted
}

impl EnsembleDriver for ParallelTempering {
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
        self.run_ladder(model, data, initial, n_steps, rng)?
            .chains
            .into_iter()
            .next()
            .ok_or_else(|| FitError::sampling("Temperature ladder produced no chains"))
    }

    fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }
}
