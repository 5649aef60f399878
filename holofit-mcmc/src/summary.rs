//! Flattened sample tables and the credible-bound posterior summary.

use holofit_core::errors::{FitError, FitResult};
use holofit_core::uncertain::UncertainValue;
use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Drop in log-probability below the maximum that bounds the credible region.
///
/// For a Gaussian posterior a 0.5 nat drop corresponds to one standard deviation.
pub const CREDIBLE_DROP: f64 = 0.5;

/// One row per retained `(walker, step)` pair: parameter values plus log-probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTable {
    names: Vec<String>,
    /// Shape (n_rows, n_params)
    samples: Array2<f64>,
    /// Shape (n_rows,)
    log_probs: Array1<f64>,
}

impl SampleTable {
    pub fn new(names: Vec<String>, samples: Array2<f64>, log_probs: Array1<f64>) -> FitResult<Self> {
        if samples.ncols() != names.len() || samples.nrows() != log_probs.len() {
            return Err(FitError::InvalidParameter(format!(
                "Sample table of shape {:?} does not match {} names and {} log-probabilities",
                samples.dim(),
                names.len(),
                log_probs.len()
            )));
        }
        Ok(Self {
            names,
            samples,
            log_probs,
        })
    }

    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }

    pub fn log_probs(&self) -> &Array1<f64> {
        &self.log_probs
    }

    /// Values of one parameter across all rows.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.samples.column(idx))
    }

    /// Row indices with a finite log-probability, highest first.
    ///
    /// Ties keep their table order.
    pub fn ranked_rows(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len())
            .filter(|&i| self.log_probs[i].is_finite())
            .collect();
        order.sort_by(|&a, &b| self.log_probs[b].total_cmp(&self.log_probs[a]));
        order
    }

    /// Parameter values of the highest-probability row.
    pub fn most_probable(&self) -> Option<ArrayView1<'_, f64>> {
        self.ranked_rows().first().map(|&i| self.samples.row(i))
    }

    /// Best-fit value and credible deviations for every parameter, in column order.
    pub fn summarize(&self) -> FitResult<IndexMap<String, UncertainValue>> {
        summarize(self)
    }
}

/// Summarize a sample table into one [`UncertainValue`] per parameter.
///
/// The value is the maximum-a-posteriori row. The credible region is the set of
/// rows within [`CREDIBLE_DROP`] of the maximum log-probability; each bound is
/// the first value beyond the MAP found when scanning the rows just below that
/// region in order of decreasing probability. Each parameter and direction is
/// scanned independently. Rows with a non-finite log-probability are ignored.
pub fn summarize(table: &SampleTable) -> FitResult<IndexMap<String, UncertainValue>> {
    let order = table.ranked_rows();
    let Some(&top) = order.first() else {
        return Err(FitError::sampling(
            "No samples with a finite log-probability to summarize",
        ));
    };

    let log_probs = table.log_probs();
    let threshold = log_probs[top] - CREDIBLE_DROP;
    let mp = table.samples().row(top);

    let cutoff = order
        .iter()
        .position(|&i| log_probs[i] <= threshold)
        .unwrap_or(order.len());
    let tail = order.get(cutoff + 1..).unwrap_or(&[]);

    let summary = table
        .names()
        .iter()
        .enumerate()
        .map(|(p, name)| {
            let column = |i: &usize| table.samples()[[*i, p]];
            let upper = scan_bound(tail.iter().map(column), mp[p], f64::max);
            let lower = scan_bound(tail.iter().map(column), mp[p], f64::min);
            (
                name.clone(),
                UncertainValue::new(mp[p], upper - mp[p], mp[p] - lower),
            )
        })
        .collect();

    Ok(summary)
}

/// Fold `values` into `start` until the running bound first moves away from `start`.
fn scan_bound<I>(values: I, start: f64, fold: fn(f64, f64) -> f64) -> f64
where
    I: Iterator<Item = f64>,
{
    let mut bound = start;
    for value in values {
        if bound != start {
            break;
        }
        bound = fold(bound, value);
    }
    bound
}
