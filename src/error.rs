use thiserror::Error;

/// Errors that abort a single sweep.
///
/// Chain drivers do not recover from any of these; they stop the chain and
/// hand back the draws collected so far (see [`crate::ChainFailure`]).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SmcError {
    #[error("variable `{variable}` has irreconcilable representations: {reason}")]
    InconsistentRepresentation { variable: String, reason: String },
    #[error("row assignment does not cover every row exactly once: {0}")]
    IncompleteAssignment(String),
    #[error("weights can not be normalized: {0}")]
    InvalidWeights(String),
    #[error("{context}: expected {expected} rows but found {found}")]
    RowCountMismatch {
        context: String,
        expected: usize,
        found: usize,
    },
    #[error("retained trajectory can not be reconstructed: {0}")]
    InvalidLineage(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("model function failed at step {step}")]
    Model {
        step: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("compression of the final ensemble failed")]
    Compression(#[source] anyhow::Error),
    #[error("sampling was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SmcError>;
