//! Storage for the walker trajectories produced by one sampler run.

use crate::summary::SampleTable;
use holofit_core::errors::{FitError, FitResult};
use indexmap::IndexMap;
use ndarray::{s, Array1, Array2, Array3, ArrayView1};

/// How to thin a chain before flattening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Thin {
    /// Keep every step
    None,
    /// Keep every k-th step
    Every(usize),
    /// Stride by the longest integrated autocorrelation time across parameters
    #[default]
    Auto,
}

/// Samples from every walker at every step of a run.
///
/// Positions are recorded per step; [`Chain::positions`] exposes them as a
/// `(walker, step, parameter)` array and [`Chain::log_probs`] as `(walker, step)`.
#[derive(Debug, Clone)]
pub struct Chain {
    /// One `(n_walkers, n_params)` array per step
    samples: Vec<Array2<f64>>,

    /// One `(n_walkers,)` array per step
    log_probs: Vec<Array1<f64>>,

    /// Parameter names in order
    param_names: Vec<String>,

    /// Fraction of accepted proposals per walker
    acceptance: Option<Array1<f64>>,
}

impl Chain {
    pub fn new(param_names: Vec<String>) -> Self {
        Self {
            samples: Vec::new(),
            log_probs: Vec::new(),
            param_names,
            acceptance: None,
        }
    }

    /// Record one step.
    ///
    /// # Arguments
    ///
    /// * `positions` - Walker positions, shape (n_walkers, n_params)
    /// * `log_probs` - Log probabilities, shape (n_walkers,)
    pub fn push(&mut self, positions: Array2<f64>, log_probs: Array1<f64>) {
        self.samples.push(positions);
        self.log_probs.push(log_probs);
    }

    /// Number of recorded steps.
    pub fn n_steps(&self) -> usize {
        self.samples.len()
    }

    pub fn n_walkers(&self) -> usize {
        self.samples.first().map_or(0, |s| s.nrows())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub(crate) fn set_acceptance(&mut self, acceptance: Array1<f64>) {
        self.acceptance = Some(acceptance);
    }

    /// Acceptance fraction of each walker, if the sampler recorded it.
    pub fn acceptance_fraction(&self) -> Option<&Array1<f64>> {
        self.acceptance.as_ref()
    }

    /// Positions as a `(walker, step, parameter)` array.
    pub fn positions(&self) -> Array3<f64> {
        Array3::from_shape_fn(
            (self.n_walkers(), self.n_steps(), self.param_names.len()),
            |(w, s, p)| self.samples[s][[w, p]],
        )
    }

    /// Log probabilities as a `(walker, step)` array.
    pub fn log_probs(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.n_walkers(), self.n_steps()), |(w, s)| {
            self.log_probs[s][w]
        })
    }

    /// Positions of every walker at the last step.
    pub fn last_positions(&self) -> Option<&Array2<f64>> {
        self.samples.last()
    }

    /// Resolve a thinning request to a concrete stride.
    pub fn stride(&self, burn_in: usize, thin: Thin) -> FitResult<usize> {
        match thin {
            Thin::None => Ok(1),
            Thin::Every(0) => Err(FitError::InvalidParameter(
                "Thinning stride must be at least 1".to_string(),
            )),
            Thin::Every(k) => Ok(k),
            Thin::Auto => Ok(self
                .autocorr_time(burn_in)
                .values()
                .copied()
                .fold(1.0, f64::max)
                .floor() as usize),
        }
    }

    /// Flatten into a table after discarding `burn_in` steps and thinning.
    ///
    /// Rows are ordered walker-major: every retained step of walker 0, then walker 1, and so on.
    pub fn flatten(&self, burn_in: usize, thin: Thin) -> FitResult<SampleTable> {
        let stride = self.stride(burn_in, thin)?;
        let steps: Vec<usize> = (burn_in..self.n_steps()).step_by(stride).collect();
        if steps.is_empty() || self.n_walkers() == 0 {
            return Err(FitError::ThinningUnderflow {
                burn_in,
                stride,
                n_steps: self.n_steps(),
            });
        }

        let n_walkers = self.n_walkers();
        let n_params = self.param_names.len();
        let n_rows = n_walkers * steps.len();
        let mut samples = Array2::zeros((n_rows, n_params));
        let mut log_probs = Array1::zeros(n_rows);

        for w in 0..n_walkers {
            for (j, &s) in steps.iter().enumerate() {
                let row = w * steps.len() + j;
                samples.row_mut(row).assign(&self.samples[s].row(w));
                log_probs[row] = self.log_probs[s][w];
            }
        }

        SampleTable::new(self.param_names.clone(), samples, log_probs)
    }

    /// Integrated autocorrelation time per parameter, `τ = 1 + 2 Σ ρ(k)`.
    ///
    /// `ρ` is averaged over walkers and summed up to the first non-positive lag,
    /// looking at most `min(n / 2, 100)` lags ahead. The map is empty when fewer
    /// than 10 steps remain after `discard`.
    pub fn autocorr_time(&self, discard: usize) -> IndexMap<String, f64> {
        let n_keep = self.n_steps().saturating_sub(discard);
        if n_keep < MIN_AUTOCORR_STEPS || self.n_walkers() == 0 {
            return IndexMap::new();
        }

        let max_lag = (n_keep / 2).min(MAX_AUTOCORR_LAG);
        let positions = self.positions();
        self.param_names
            .iter()
            .enumerate()
            .map(|(p, name)| {
                let mut rho = Array1::<f64>::zeros(max_lag);
                for trace in positions.slice(s![.., discard.., p]).outer_iter() {
                    rho += &autocorrelation(trace, max_lag);
                }
                rho /= self.n_walkers() as f64;
                let tau = 1.0 + 2.0 * rho.iter().take_while(|&&r| r > 0.0).sum::<f64>();
                (name.clone(), tau)
            })
            .collect()
    }
}

const MIN_AUTOCORR_STEPS: usize = 10;
const MAX_AUTOCORR_LAG: usize = 100;

/// Normalized autocorrelation of one walker's trace at lags `1..=max_lag`.
///
/// A constant trace has zero autocorrelation at every lag.
fn autocorrelation(trace: ArrayView1<f64>, max_lag: usize) -> Array1<f64> {
    let n = trace.len();
    let centred = &trace - trace.mean().unwrap_or(0.0);
    let variance = centred.dot(&centred) / n as f64;
    if variance == 0.0 {
        return Array1::zeros(max_lag);
    }

    Array1::from_shape_fn(max_lag, |k| {
        let lag = k + 1;
        if lag >= n {
            return 0.0;
        }
        let head = centred.slice(s![..n - lag]);
        let tail = centred.slice(s![lag..]);
        head.dot(&tail) / ((n - lag) as f64 * variance)
    })
}
