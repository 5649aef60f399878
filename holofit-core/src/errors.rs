use thiserror::Error;

/// Error type for fitting operations.
///
/// Variants that can be raised while a staged run is in progress carry an
/// optional stage index, filled in by the scheduler via [`FitError::at_stage`].
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Cannot refine prior for parameter '{parameter}'{}: {reason}", stage_suffix(.stage))]
    PriorRefinement {
        stage: Option<usize>,
        parameter: String,
        reason: String,
    },
    #[error("Sampling failed{}: {reason}", stage_suffix(.stage))]
    Sampling { stage: Option<usize>, reason: String },
    #[error("Incompatible model: {0}")]
    IncompatibleModel(String),
    #[error("Thinning with burn_in={burn_in} and stride={stride} leaves no samples from a chain of {n_steps} steps")]
    ThinningUnderflow {
        burn_in: usize,
        stride: usize,
        n_steps: usize,
    },
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Raw chain is not available: {0}")]
    ChainUnavailable(String),
    #[error("Schedule cancelled after stage {stage}")]
    Cancelled { stage: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn stage_suffix(stage: &Option<usize>) -> String {
    match stage {
        Some(stage) => format!(" at stage {}", stage),
        None => String::new(),
    }
}

impl FitError {
    pub fn sampling(reason: impl Into<String>) -> Self {
        FitError::Sampling {
            stage: None,
            reason: reason.into(),
        }
    }

    pub fn prior_refinement(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        FitError::PriorRefinement {
            stage: None,
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Attach a stage index to stage-aware variants.
    ///
    /// Other variants, including errors raised by the forward model, are returned unchanged.
    pub fn at_stage(self, index: usize) -> Self {
        match self {
            FitError::PriorRefinement {
                parameter, reason, ..
            } => FitError::PriorRefinement {
                stage: Some(index),
                parameter,
                reason,
            },
            FitError::Sampling { reason, .. } => FitError::Sampling {
                stage: Some(index),
                reason,
            },
            other => other,
        }
    }

    /// Name the parameter a refinement error belongs to.
    pub fn for_parameter(self, name: &str) -> Self {
        match self {
            FitError::PriorRefinement { stage, reason, .. } => FitError::PriorRefinement {
                stage,
                parameter: name.to_string(),
                reason,
            },
            other => other,
        }
    }

    /// Stage index recorded on the error, if any.
    pub fn stage(&self) -> Option<usize> {
        match self {
            FitError::PriorRefinement { stage, .. } | FitError::Sampling { stage, .. } => *stage,
            FitError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }
}

/// Convenience type for `Result<T, FitError>`.
pub type FitResult<T> = Result<T, FitError>;
