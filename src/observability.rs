//! Logging infrastructure for stratum.
//!
//! stratum uses `tracing` for structured logging. All events use target
//! "stratum" and include `component` and `event` fields for filtering.
//!
//! ## Library Integration
//!
//! stratum never initializes a global subscriber. Applications configure
//! tracing via `tracing_subscriber` or similar.
//!
//! ## Conventions
//!
//! - `event`: snake_case event name (required)
//! - `component`: subsystem (e.g., "fiber", "sort", "repo")
//! - Use `%` for Display, `?` for Debug formatting

/// Target for all stratum log events.
pub(crate) const STRATUM_TARGET: &str = "stratum";

/// Macro for info-level log events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "sort",
///     event = "generation_flushed",
///     file = %id,
///     entries = count,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::STRATUM_TARGET, $($field)*)
    };
}

/// Macro for debug-level log events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::STRATUM_TARGET, $($field)*)
    };
}

/// Macro for warn-level log events.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::STRATUM_TARGET, $($field)*)
    };
}

/// Macro for error-level log events.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::STRATUM_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
