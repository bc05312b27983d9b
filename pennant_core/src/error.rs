use std::sync::Arc;

/// Result type used throughout the Pennant crates.
///
/// The error variant is the kinded [`Error`] enum; transport layers map the
/// kinds to status codes and the SDK boundary maps every error to a defaulted
/// evaluation result.
pub type Result<T> = std::result::Result<T, Error>;

/// Kinded errors for the core pipeline.
///
/// Deep layers return these; they are never stringly matched. The variants
/// mirror the platform's error taxonomy: validation failures are never
/// retried, upstream failures are retried by the layer that owns the call,
/// and internal errors fail closed.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Authoring input contradicts a model invariant. Surfaced as 4xx.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing entity by id or key.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Duplicate key/slug or a publish transition that is already applied.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Token invalid, expired, or revoked.
    #[error("unauthorized")]
    Unauthorized,

    /// Token valid but scoped to a different environment or missing the
    /// required scope.
    #[error("forbidden")]
    Forbidden,

    /// Store, cache, or sink unavailable.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// Error evaluating a flag.
    #[error(transparent)]
    Evaluation(EvaluationError),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Invariant broken in a code path. Logged with high severity; callers
    /// serve the default.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<EvaluationError> for Error {
    fn from(value: EvaluationError) -> Self {
        Self::Evaluation(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

/// Conditions the bucketer can report.
///
/// None of these cross the SDK boundary as errors: evaluation "always
/// answers" and the caller-supplied default is served instead.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The requested flag is not part of the snapshot.
    #[error("flag not found")]
    FlagNotFound,

    /// The flag is in the snapshot but failed to parse (newer server
    /// format). The rest of the snapshot is still served.
    #[error("flag configuration failed to parse")]
    FlagParseFailed,

    /// `user_key` was empty; no bucketing identity exists.
    #[error("user_key is required and cannot be empty")]
    MissingUserKey,

    /// The snapshot is internally inconsistent (e.g., a dangling variation
    /// reference). The compiler rejects these; seeing one at evaluation time
    /// means the snapshot bypassed compilation.
    #[error("snapshot is internally inconsistent")]
    InconsistentSnapshot,
}
