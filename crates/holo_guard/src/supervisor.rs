//! Structured fan-out of the monitors with shared cancellation.

use std::future::Future;

use anyhow::{anyhow, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::is_cancelled;

/// Named tasks that live and die together.
///
/// The first task to finish, for any reason, cancels the rest; `join` waits
/// for every task and reports the first real failure.
pub struct TaskGroup {
    tasks: JoinSet<(&'static str, Result<()>)>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Token observed by every task in the group.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn join(mut self) -> Result<()> {
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = self.tasks.join_next().await {
            self.cancel.cancel();
            match joined {
                Ok((name, Ok(()))) => tracing::debug!(task = name, "task exited"),
                Ok((_, Err(err))) if is_cancelled(&err) => {}
                Ok((name, Err(err))) => {
                    tracing::error!(task = name, error = ?err, "task failed; stopping group");
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("task {name} failed")));
                    }
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "task panicked or was aborted");
                    if first_error.is_none() {
                        first_error = Some(anyhow!("supervised task aborted: {join_err}"));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
