//! Scoped ownership of server-side cellsets
//!
//! A [`CellsetHandle`] owns one server-side cellset. It must be released
//! with [`CellsetHandle::release`] once every read of it has finished.
//! Dropping an unreleased handle schedules the delete in the background
//! and logs a warning, so the server resource is still reclaimed.

use tracing::{debug, warn};

use crate::error::Result;
use crate::executor::CellsetExecutor;

pub struct CellsetHandle {
    id: String,
    executor: Option<CellsetExecutor>,
}

impl CellsetHandle {
    pub(crate) fn new(id: String, executor: CellsetExecutor) -> Self {
        Self {
            id,
            executor: Some(executor),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Delete the cellset on the server.
    pub async fn release(mut self) -> Result<()> {
        match self.executor.take() {
            Some(executor) => {
                debug!(cellset = %self.id, "releasing cellset");
                executor.delete(&self.id).await
            }
            None => Ok(()),
        }
    }

    /// Release, then hand back `outcome`.
    ///
    /// An error in `outcome` wins over a release error, which is logged.
    pub async fn release_after<T>(self, outcome: Result<T>) -> Result<T> {
        let id = self.id.clone();
        let released = self.release().await;
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!(cellset = %id, error = %release_error, "release failed after earlier error");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for CellsetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellsetHandle")
            .field("id", &self.id)
            .field("released", &self.executor.is_none())
            .finish()
    }
}

impl Drop for CellsetHandle {
    fn drop(&mut self) {
        let Some(executor) = self.executor.take() else {
            return;
        };
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(cellset = %id, "cellset handle dropped without release, deleting in background");
                runtime.spawn(async move {
                    if let Err(e) = executor.delete(&id).await {
                        warn!(cellset = %id, error = %e, "background cellset release failed");
                    }
                });
            }
            Err(_) => {
                warn!(cellset = %id, "cellset handle dropped outside a runtime, server resource leaked");
            }
        }
    }
}
