//! The outcome of a sampling run and its on-disk form.

use crate::chain::{Chain, Thin};
use crate::summary::{self, SampleTable};
use holofit_core::errors::{FitError, FitResult};
use holofit_core::parameter::ParameterSet;
use holofit_core::uncertain::UncertainValue;
use indexmap::IndexMap;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone)]
enum Source {
    Chain(Chain),
    Table(SampleTable),
}

/// Samples from a run together with the parameter definitions that interpret them.
///
/// A result produced by a sampler keeps the full [`Chain`]. A result read back
/// with [`SamplingResult::load`] only has the thinned table that was saved, so
/// operations that need the raw chain return [`FitError::ChainUnavailable`].
#[derive(Debug, Clone)]
pub struct SamplingResult {
    source: Source,
    parameters: ParameterSet,
}

/// Serialized form: the flattened samples plus string attributes.
///
/// `attrs["model"]` holds the JSON of the parameter definitions.
#[derive(Serialize, Deserialize)]
struct Artifact {
    samples: SampleTable,
    attrs: BTreeMap<String, String>,
}

impl SamplingResult {
    pub fn from_chain(chain: Chain, parameters: ParameterSet) -> Self {
        Self {
            source: Source::Chain(chain),
            parameters,
        }
    }

    pub fn from_table(table: SampleTable, parameters: ParameterSet) -> Self {
        Self {
            source: Source::Table(table),
            parameters,
        }
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn chain(&self) -> Option<&Chain> {
        match &self.source {
            Source::Chain(chain) => Some(chain),
            Source::Table(_) => None,
        }
    }

    fn require_chain(&self, operation: &str) -> FitResult<&Chain> {
        self.chain().ok_or_else(|| {
            FitError::ChainUnavailable(format!(
                "{} needs the raw chain, but this result only holds saved samples",
                operation
            ))
        })
    }

    /// Every sample, unthinned.
    fn full_table(&self) -> FitResult<Cow<'_, SampleTable>> {
        match &self.source {
            Source::Chain(chain) => Ok(Cow::Owned(chain.flatten(0, Thin::None)?)),
            Source::Table(table) => Ok(Cow::Borrowed(table)),
        }
    }

    /// Best-fit value and credible deviations of every parameter, from all samples.
    pub fn summarize(&self) -> FitResult<IndexMap<String, UncertainValue>> {
        summary::summarize(&*self.full_table()?)
    }

    /// Flatten after discarding `burn_in` steps and thinning.
    ///
    /// A loaded result is already flattened and only supports `(0, Thin::None)`.
    pub fn thin(&self, burn_in: usize, thin: Thin) -> FitResult<SampleTable> {
        match &self.source {
            Source::Chain(chain) => chain.flatten(burn_in, thin),
            Source::Table(table) if burn_in == 0 && thin == Thin::None => Ok(table.clone()),
            Source::Table(_) => Err(FitError::ChainUnavailable(format!(
                "cannot apply burn_in={} and {:?} to saved samples",
                burn_in, thin
            ))),
        }
    }

    /// Priors narrowed to this result's posterior, for seeding a follow-up run.
    pub fn updated_priors(&self, extra_uncertainty: Option<&[f64]>) -> FitResult<ParameterSet> {
        let summaries: Vec<UncertainValue> = self.summarize()?.into_values().collect();
        self.parameters.refined(&summaries, extra_uncertainty)
    }

    /// Parameter values of the sample with the highest log-probability.
    pub fn most_probable_values(&self) -> FitResult<Array1<f64>> {
        let table = self.full_table()?;
        let order = table.ranked_rows();
        let Some(&top) = order.first() else {
            return Err(FitError::sampling(
                "No samples with a finite log-probability",
            ));
        };

        let best = table.samples().row(top);
        let max_lp = table.log_probs()[top];
        let tied_elsewhere = order
            .iter()
            .skip(1)
            .take_while(|&&i| table.log_probs()[i] == max_lp)
            .any(|&i| table.samples().row(i) != best);
        if tied_elsewhere {
            warn!(
                log_prob = max_lp,
                "Several distinct positions share the maximum log-probability; using the first"
            );
        }
        Ok(best.to_owned())
    }

    /// Steps per walker, when the chain is available.
    pub fn n_steps(&self) -> Option<usize> {
        self.chain().map(Chain::n_steps)
    }

    pub fn n_walkers(&self) -> Option<usize> {
        self.chain().map(Chain::n_walkers)
    }

    /// Steps per walker divided by the longest autocorrelation time.
    pub fn approx_independent_steps(&self) -> FitResult<usize> {
        let chain = self.require_chain("approx_independent_steps")?;
        let tau = chain
            .autocorr_time(0)
            .values()
            .copied()
            .fold(1.0, f64::max);
        Ok((chain.n_steps() as f64 / tau).floor() as usize)
    }

    /// Mean acceptance fraction across walkers.
    pub fn acceptance_fraction(&self) -> Option<f64> {
        self.chain()
            .and_then(Chain::acceptance_fraction)
            .and_then(|a| a.mean())
    }

    /// Save with automatic thinning.
    ///
    /// A loaded result is written back unchanged.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> FitResult<()> {
        let table = match &self.source {
            Source::Chain(chain) => chain.flatten(0, Thin::Auto)?,
            Source::Table(table) => table.clone(),
        };
        self.write(path, table)
    }

    pub fn save_thinned<P: AsRef<Path>>(&self, path: P, burn_in: usize, thin: Thin) -> FitResult<()> {
        let table = self.thin(burn_in, thin)?;
        self.write(path, table)
    }

    fn write<P: AsRef<Path>>(&self, path: P, samples: SampleTable) -> FitResult<()> {
        let model = serde_json::to_string(&self.parameters)
            .map_err(|e| FitError::Serialization(format!("Failed to serialize model: {}", e)))?;
        let mut attrs = BTreeMap::new();
        attrs.insert("model".to_string(), model);
        let artifact = Artifact { samples, attrs };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &artifact)
            .map_err(|e| FitError::Serialization(format!("Failed to serialize samples: {}", e)))?;
        writer.flush()?;

        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> FitResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let artifact: Artifact = bincode::deserialize_from(&mut reader)
            .map_err(|e| FitError::Serialization(format!("Failed to deserialize samples: {}", e)))?;

        let model = artifact.attrs.get("model").ok_or_else(|| {
            FitError::Serialization("Saved samples have no model definition".to_string())
        })?;
        let parameters: ParameterSet = serde_json::from_str(model)
            .map_err(|e| FitError::Serialization(format!("Failed to parse model: {}", e)))?;
        if parameters.names() != artifact.samples.names() {
            return Err(FitError::Serialization(format!(
                "Saved columns {:?} do not match model parameters {:?}",
                artifact.samples.names(),
                parameters.names()
            )));
        }

        Ok(Self::from_table(artifact.samples, parameters))
    }
}

impl fmt::Display for SamplingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SamplingResult")?;
        match self.summarize() {
            Ok(summary) => {
                for (name, value) in &summary {
                    writeln!(f, "  {}: {}", name, value)?;
                }
            }
            Err(e) => writeln!(f, "  (no summary: {})", e)?,
        }
        match (self.n_walkers(), self.n_steps()) {
            (Some(walkers), Some(steps)) => {
                write!(f, "  {} walkers, {} steps", walkers, steps)?;
                if let Ok(independent) = self.approx_independent_steps() {
                    write!(f, " (~{} of which are independent)", independent)?;
                }
            }
            _ => write!(f, "  {} saved samples", self.full_table().map_or(0, |t| t.len()))?,
        }
        if let Some(acceptance) = self.acceptance_fraction() {
            write!(f, ", acceptance {:.3}", acceptance)?;
        }
        Ok(())
    }
}
