//! Application state shared across handlers

use crate::http::ApiResult;
use crate::vhost::Vhosts;
use packstore_archive::{ArchiveStore, PathLocks, StoreResult};
use packstore_common::Error;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState {
    pub vhosts: Vhosts,
    pub store: Arc<ArchiveStore>,
    /// Largest accepted upload
    pub max_body_size: u64,
}

impl AppState {
    #[must_use]
    pub fn new(vhosts: Vhosts, store: Arc<ArchiveStore>, max_body_size: u64) -> Self {
        Self {
            vhosts,
            store,
            max_body_size,
        }
    }

    /// Path locks shared by standalone files and archives
    #[must_use]
    pub fn locks(&self) -> &PathLocks {
        self.store.locks()
    }

    /// Run a blocking archive operation off the async runtime
    pub async fn blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ArchiveStore) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::internal(format!("archive task failed: {e}")))?;
        Ok(result?)
    }
}
