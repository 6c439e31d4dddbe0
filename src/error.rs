// Errors surfaced to callers of the acquisition pipeline.

use std::fmt;

use thiserror::Error;

/// One candidate source that failed, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub url: String,
    pub reason: String,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

/// Terminal outcomes of artifact acquisition and session loading.
///
/// Store and cache-tier failures never appear here; they are absorbed at the
/// tier boundary. `Clone` lets one settled acquisition be handed to every
/// caller that joined it.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("all {} sources failed, first error: {}", failures.len(), first_failure(failures))]
    AllSourcesFailed { failures: Vec<SourceFailure> },

    #[error("engine rejected model {locator}: {reason}")]
    EngineConstructionFailed { locator: String, reason: String },

    /// The acquisition task was cancelled before it settled (runtime shutdown).
    #[error("acquisition of {key} was aborted")]
    Aborted { key: String },
}

fn first_failure(failures: &[SourceFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none recorded".to_string())
}

impl LoadError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Per-source failures, if this is an aggregate source error.
    pub fn failures(&self) -> &[SourceFailure] {
        match self {
            Self::AllSourcesFailed { failures } => failures,
            _ => &[],
        }
    }
}
