use oxalert_common::types::OrgId;

/// Errors raised by the notification subsystem.
///
/// # Examples
///
/// ```rust
/// use oxalert_notify::error::NotifyError;
///
/// let err = NotifyError::NotReady(3);
/// assert!(err.to_string().contains("org 3"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// No notification backend exists for the tenant.
    #[error("Notify: no alertmanager for org {0}")]
    NotFound(OrgId),

    /// The tenant's backend exists but has no applied configuration.
    #[error("Notify: alertmanager for org {0} is not ready")]
    NotReady(OrgId),

    /// Neither a local backend nor an external sender accepts the tenant's alerts.
    #[error("Notify: no destination for alerts of org {0}")]
    NoDestination(OrgId),

    /// Rule notification settings reference something the config lacks.
    #[error("Notify: invalid notification settings: {0}")]
    InvalidSettings(String),

    /// The backend configuration is malformed.
    #[error("Notify: invalid configuration: {0}")]
    InvalidConfig(String),

    /// The integration type is not registered in the plugin registry.
    #[error("Notify: unknown channel type '{0}'")]
    UnknownChannelType(String),

    #[error("Notify: HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Notify: JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The remote endpoint returned a non-success response.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    ApiError {
        service: String,
        status: u16,
        body: String,
    },

    /// A cluster peer could not be reached or answered nonsense.
    #[error("Notify: cluster peer {peer}: {reason}")]
    Cluster { peer: String, reason: String },

    #[error("Notify: storage error: {0}")]
    Storage(#[from] oxalert_storage::StorageError),

    #[error("Notify: {0}")]
    Other(String),
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
