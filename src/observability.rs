//! Structured log events.
//!
//! Every event is emitted on the `"tsmerge"` target with a `component`
//! (`engine`, `partition`, `merge`, `cleaner`, `version`, `alert`) and a
//! snake_case `event` name. Row data never goes into an event; ranges, counts
//! and paths do. Installing a subscriber is left to the application.

pub(crate) const TSMERGE_TARGET: &str = "tsmerge";

macro_rules! log_event {
    ($level:expr, $($field:tt)*) => {
        ::tracing::event!(target: $crate::observability::TSMERGE_TARGET, $level, $($field)*)
    };
}

/// Info level: table lifecycle and published commits.
macro_rules! log_info {
    ($($field:tt)*) => {
        $crate::observability::log_event!(::tracing::Level::INFO, $($field)*)
    };
}

/// Debug level: per-partition plans and per-column results.
macro_rules! log_debug {
    ($($field:tt)*) => {
        $crate::observability::log_event!(::tracing::Level::DEBUG, $($field)*)
    };
}

/// Warn level: rejected commits and rollbacks.
macro_rules! log_warn {
    ($($field:tt)*) => {
        $crate::observability::log_event!(::tracing::Level::WARN, $($field)*)
    };
}

/// Error level: alerts and lost cleaner messages.
macro_rules! log_error {
    ($($field:tt)*) => {
        $crate::observability::log_event!(::tracing::Level::ERROR, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_event;
pub(crate) use log_info;
pub(crate) use log_warn;
