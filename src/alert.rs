//! Reporting of fatal merge failures.

use std::fmt;

use crate::{merge::FailureClass, observability::log_error};

/// A failed commit, as reported to an [`AlertSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeAlert {
    /// Transaction the commit would have published.
    pub txn: u64,
    /// Partition whose merge failed, when the failure is partition-local.
    pub partition: Option<String>,
    /// Column whose task failed, when known.
    pub column: Option<String>,
    /// Failure class.
    pub class: FailureClass,
    /// Rendered error.
    pub message: String,
}

impl fmt::Display for MergeAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn {} {:?}", self.txn, self.class)?;
        if let Some(partition) = &self.partition {
            write!(f, " partition {partition}")?;
        }
        if let Some(column) = &self.column {
            write!(f, " column {column}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Receives fatal merge failures. Cancellations are not reported.
pub trait AlertSink: Send + Sync + 'static {
    /// Called once per failed commit.
    fn report(&self, alert: &MergeAlert);
}

/// Sink that logs alerts at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn report(&self, alert: &MergeAlert) {
        log_error!(
            component = "alert",
            event = "merge_failed",
            txn = alert.txn,
            partition = alert.partition.as_deref().unwrap_or("-"),
            column = alert.column.as_deref().unwrap_or("-"),
            class = ?alert.class,
            message = %alert.message,
        );
    }
}
