/// Errors returned by an [`crate::Evaluator`].
///
/// # Examples
///
/// ```rust
/// use oxalert_state::error::EvalError;
///
/// let err = EvalError::Timeout(30);
/// assert!(err.to_string().contains("30s"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The query backend could not be reached.
    #[error("Eval: backend unavailable: {0}")]
    Unavailable(String),

    /// The query did not complete in time.
    #[error("Eval: query timed out after {0}s")]
    Timeout(u64),

    /// The condition or query model is malformed.
    #[error("Eval: invalid condition: {0}")]
    InvalidCondition(String),

    /// The backend answered with something that is not a result set.
    #[error("Eval: unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Convenience `Result` alias for evaluation.
pub type Result<T> = std::result::Result<T, EvalError>;
