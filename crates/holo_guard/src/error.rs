//! Error markers that callers branch on, plus cancellation-aware waits.
//!
//! Everything else in the crate reports failures as plain `anyhow::Error`
//! with context; these types exist so a caller can `downcast_ref` and tell a
//! shutdown apart from a real failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Returned by any wait that observed the shared cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// A database still accepted writes after quarantine asked it not to.
#[derive(Debug, Clone)]
pub struct ReadonlyVerificationFailed {
    pub database: String,
}

impl fmt::Display for ReadonlyVerificationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "database '{}' did not report default_transaction_read_only=on after quarantine",
            self.database
        )
    }
}

impl std::error::Error for ReadonlyVerificationFailed {}

/// The bounded backup retry loop ran out of attempts.
#[derive(Debug, Clone)]
pub struct BackupRetriesExhausted {
    pub attempts: u32,
    pub last_error: String,
}

impl fmt::Display for BackupRetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "full backup failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for BackupRetriesExhausted {}

/// Returns `true` when `err` (or anything in its chain) is [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> anyhow::Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled.into()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drives `fut` to completion unless `cancel` fires first.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled.into()),
        res = fut => res,
    }
}
