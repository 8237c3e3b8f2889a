//! Shared error reporting
//!
//! Every module error implements [`ContextualError`] so fatal failures at the
//! process boundary can be logged uniformly: configuration mistakes the
//! operator can fix are shown verbatim, infrastructure failures get a generic
//! line with details at debug level.

/// Errors that know whether the operator can act on them
///
/// When `is_user_actionable()` is `true`, `user_message()` must return
/// `Some(message)`; otherwise it returns `None`.
pub trait ContextualError: std::error::Error {
    /// True for errors with a specific, fixable cause (bad config values,
    /// unsupported backend selection)
    fn is_user_actionable(&self) -> bool;

    /// The message to show when the error is user-actionable
    fn user_message(&self) -> Option<&str>;
}

/// Log a fatal error with detail appropriate to its kind
///
/// # Examples
/// ```rust,no_run
/// use clusterq::core::error_handling::log_error_with_context;
/// use clusterq::core::config::ConfigError;
///
/// let err = ConfigError::Validation { message: "queue.partitions must be > 0".into() };
/// log_error_with_context(&err, "Loading node configuration");
/// // Logs: "FATAL: queue.partitions must be > 0"
/// ```
pub fn log_error_with_context<E: ContextualError + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    match error.user_message().filter(|_| error.is_user_actionable()) {
        Some(user_msg) => log::error!("FATAL: {}", user_msg),
        None => log::error!("FATAL: {}", operation_context),
    }
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
