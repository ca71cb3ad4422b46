use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds that callers need to tell apart.
///
/// Everything else travels as a plain `anyhow::Error` with context; these
/// variants are wrapped in `anyhow` too and can be recovered with
/// `err.downcast_ref::<PipelineError>()`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("remote call failed after {attempts} attempts: {last_error:#}")]
    ExhaustedRetries {
        attempts: u32,
        last_error: anyhow::Error,
    },

    #[error("critical quality checks failed: {}", failed.join(", "))]
    CriticalQualityFailure { failed: Vec<String> },

    #[error("state file {} is unusable: {reason}", path.display())]
    StateCorruption { path: PathBuf, reason: String },

    #[error("storage failure during {step}: {cause:#}")]
    Storage {
        step: String,
        cause: anyhow::Error,
    },

    #[error("step `{step}` failed: {cause:#}")]
    Step {
        step: &'static str,
        cause: anyhow::Error,
    },
}

impl PipelineError {
    pub fn storage(step: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Storage {
            step: step.into(),
            cause,
        }
    }

    /// Name of the orchestrator step this error was raised in, if known.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            Self::Storage { step, .. } => Some(step.as_str()),
            _ => None,
        }
    }
}
