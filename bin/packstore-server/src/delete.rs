//! DELETE handler.

use crate::http::{ApiError, ApiResult, FROM_ARCHIVE_HEADER, header_flag, respond};
use crate::state::AppState;
use crate::target::Target;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use packstore_archive::RemoveOutcome;
use packstore_common::{Error, VhostConfig};
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, info};

pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    remove(&state, &path, &headers)
        .await
        .map_err(ApiError::for_delete)
}

async fn remove(state: &AppState, path: &str, headers: &HeaderMap) -> ApiResult {
    let vhost = state.vhosts.resolve(headers)?;
    if !vhost.delete {
        return Err(Error::forbidden(format!("deletes are disabled for {}", vhost.name)).into());
    }

    let target = Target::resolve(&vhost.root, path)?;
    let name = target.name()?.to_string();
    if target.is_reserved() {
        return Err(Error::forbidden(format!("'{name}' is a reserved name")).into());
    }

    if !header_flag(headers, FROM_ARCHIVE_HEADER) {
        let file = target.file()?;
        let guard = state.locks().acquire_async(&file.to_string_lossy()).await?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {
                drop(guard);
                info!("DELETE {}", file.display());
                prune_dir(&vhost, &target).await;
                return Ok(respond(StatusCode::OK, HeaderMap::new(), Body::empty()));
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let archive = target.archive()?;
    let key = name.clone();
    let outcome = state
        .blocking(move |store| store.delete(&archive, &key))
        .await?;
    info!("DELETE {} from archive in {}", name, target.dir.display());

    if outcome == RemoveOutcome::ArchiveRemoved {
        prune_dir(&vhost, &target).await;
    }
    Ok(respond(StatusCode::OK, HeaderMap::new(), Body::empty()))
}

/// Remove the target's directory when pruning is on and it is left empty.
/// The vhost root is never removed.
async fn prune_dir(vhost: &VhostConfig, target: &Target) {
    if !vhost.prune_dirs || target.dir == vhost.root {
        return;
    }
    match tokio::fs::remove_dir(&target.dir).await {
        Ok(()) => info!("Pruned empty directory {}", target.dir.display()),
        Err(e) => debug!("Kept directory {}: {}", target.dir.display(), e),
    }
}
