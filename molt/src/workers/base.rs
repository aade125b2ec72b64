use std::future::Future;

use tokio::task::JoinHandle;
use tracing::error;

use crate::error::{ErrorKind, MoltError, MoltResult};

/// Handle for a spawned migration worker.
///
/// Wraps the task's join handle; waiting maps panics and cancellation onto
/// the engine's error taxonomy. The handle remains valid after the worker
/// completes.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    handle: Option<JoinHandle<MoltResult<()>>>,
}

impl WorkerHandle {
    /// Spawns the worker's future onto the runtime.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = MoltResult<()>> + Send + 'static,
    {
        WorkerHandle {
            name,
            handle: Some(tokio::spawn(future)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Waits for the worker to complete and returns its result.
    pub async fn wait(mut self) -> MoltResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match handle.await {
            Ok(result) => {
                if let Err(err) = &result {
                    error!(worker = self.name, error = %err, "worker failed");
                }
                result
            }
            Err(join_err) => Err(MoltError::with_source(
                ErrorKind::WorkerPanicked {
                    worker: self.name.to_string(),
                },
                join_err,
            )),
        }
    }

    /// Forcefully aborts the worker task. Used only during teardown after
    /// the graceful shutdown window passed.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
