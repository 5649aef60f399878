//! Options for a staged subset-tempering run.

use crate::errors::{FitError, FitResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Schedule and sampler settings for subset tempering.
///
/// All fields have defaults, so a TOML file only needs the values it overrides:
///
/// ```
/// # use holofit_core::config::TemperingOptions;
/// let options = TemperingOptions::from_toml_str("n_walkers = 50\nstages = 2").unwrap();
/// assert_eq!(options.n_walkers, 50);
/// assert_eq!(options.final_len, 600);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemperingOptions {
    /// Number of steps in the final stage
    pub final_len: usize,
    /// Walkers per stage
    pub n_walkers: usize,
    /// Pixels used in the first stage
    pub min_pixels: usize,
    /// Pixels used in the final stage
    pub max_pixels: usize,
    /// Number of preliminary stages
    pub stages: usize,
    /// Steps in each preliminary stage
    pub stage_len: usize,
    /// Worker threads for log-posterior evaluation; `None` uses the global rayon pool
    pub threads: Option<usize>,
    /// Seed for walker initialization, subset selection and proposals
    pub seed: Option<u64>,
    /// Per-parameter floor on refined prior widths, in parameter order
    pub extra_uncertainty: Option<Vec<f64>>,
}

impl Default for TemperingOptions {
    fn default() -> Self {
        Self {
            final_len: 600,
            n_walkers: 500,
            min_pixels: 10,
            max_pixels: 1000,
            stages: 3,
            stage_len: 30,
            threads: None,
            seed: None,
            extra_uncertainty: None,
        }
    }
}

impl TemperingOptions {
    pub fn from_toml_str(s: &str) -> FitResult<Self> {
        let options: Self = toml::from_str(s).map_err(|e| FitError::Serialization(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> FitResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let options = Self::from_toml_str(&contents)?;
        debug!(path = %path.display(), ?options, "Loaded tempering options");
        Ok(options)
    }

    pub fn to_toml_string(&self) -> FitResult<String> {
        toml::to_string(self).map_err(|e| FitError::Serialization(e.to_string()))
    }

    /// Checks that the options describe a runnable schedule.
    ///
    /// Pixel counts are checked against the data later, once the frame size is known.
    pub fn validate(&self) -> FitResult<()> {
        if self.n_walkers < 2 || self.n_walkers % 2 != 0 {
            return Err(FitError::InvalidSchedule(format!(
                "n_walkers must be an even number of at least 2, got {}",
                self.n_walkers
            )));
        }
        if self.min_pixels == 0 {
            return Err(FitError::InvalidSchedule(
                "min_pixels must be at least 1".to_string(),
            ));
        }
        if self.min_pixels > self.max_pixels {
            return Err(FitError::InvalidSchedule(format!(
                "min_pixels ({}) exceeds max_pixels ({})",
                self.min_pixels, self.max_pixels
            )));
        }
        if self.final_len == 0 || (self.stages > 0 && self.stage_len == 0) {
            return Err(FitError::InvalidSchedule(
                "stage_len and final_len must be at least 1".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(FitError::InvalidSchedule(
                "threads must be at least 1 when given".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = TemperingOptions::default();
        assert_eq!(options.final_len, 600);
        assert_eq!(options.n_walkers, 500);
        assert_eq!((options.min_pixels, options.max_pixels), (10, 1000));
        assert_eq!((options.stages, options.stage_len), (3, 30));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let options = TemperingOptions::from_toml_str(
            r#"
            n_walkers = 50
            seed = 42
            extra_uncertainty = [0.1, 0.0]
            "#,
        )
        .unwrap();
        assert_eq!(options.n_walkers, 50);
        assert_eq!(options.seed, Some(42));
        assert_eq!(options.extra_uncertainty, Some(vec![0.1, 0.0]));
        assert_eq!(options.stage_len, 30);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(TemperingOptions::from_toml_str("walkers = 50").is_err());
    }

    #[test]
    fn test_invalid_options() {
        assert!(TemperingOptions::from_toml_str("n_walkers = 51").is_err());
        assert!(TemperingOptions::from_toml_str("min_pixels = 0").is_err());
        assert!(TemperingOptions::from_toml_str("min_pixels = 2000").is_err());
        assert!(TemperingOptions::from_toml_str("threads = 0").is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let options = TemperingOptions {
            seed: Some(7),
            threads: Some(4),
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(options.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = TemperingOptions::from_path(file.path()).unwrap();
        assert_eq!(loaded, options);
    }
}
