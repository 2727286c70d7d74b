//! PUT handler.
//!
//! Small uploads flagged `Archive: 1` are packed into the directory archive.
//! Everything else is written to a temporary file next to the target and
//! renamed into place once its length (and checksum, with integrity on) has
//! been confirmed. Directories created for an upload that fails are removed
//! again.

use crate::http::{ARCHIVE_HEADER, ApiResult, chunk_size, header_flag, header_str, respond};
use crate::state::AppState;
use crate::target::{Target, UPLOAD_PREFIX};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
};
use futures::StreamExt;
use packstore_common::{Checksum, Error, Result, VhostConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{error, info, warn};
use uuid::Uuid;

pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult {
    let vhost = state.vhosts.resolve(&headers)?;
    if !vhost.upload {
        return Err(Error::forbidden(format!("uploads are disabled for {}", vhost.name)).into());
    }

    let target = Target::resolve(&vhost.root, &path)?;
    let name = target.name()?.to_string();
    if target.is_reserved() {
        return Err(Error::forbidden(format!("'{name}' is a reserved name")).into());
    }

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str());
    if !vhost.accepts_content_type(content_type) {
        return Err(Error::invalid_request(format!(
            "content type {} is not accepted",
            content_type.unwrap_or("(none)")
        ))
        .into());
    }

    let declared = declared_length(&headers, state.max_body_size)?;

    if header_flag(&headers, ARCHIVE_HEADER)
        && vhost.archive
        && declared <= vhost.archive_max_size
    {
        put_archived(&state, &vhost, &target, name, declared, body).await?;
    } else {
        put_file(&state, &vhost, &target, &name, declared, body).await?;
    }
    Ok(respond(StatusCode::OK, HeaderMap::new(), Body::empty()))
}

/// Mandatory, non-zero `Content-Length` within the body limit
fn declared_length(headers: &HeaderMap, max_body_size: u64) -> Result<u64> {
    let value = header_str(headers, header::CONTENT_LENGTH.as_str())
        .ok_or_else(|| Error::invalid_request("missing Content-Length"))?;
    let declared: u64 = value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_request(format!("invalid Content-Length '{value}'")))?;
    if declared == 0 {
        return Err(Error::invalid_request("empty upload"));
    }
    if declared > max_body_size {
        return Err(Error::invalid_request(format!(
            "upload of {declared} bytes exceeds the {max_body_size} byte limit"
        )));
    }
    Ok(declared)
}

async fn put_archived(
    state: &AppState,
    vhost: &VhostConfig,
    target: &Target,
    name: String,
    declared: u64,
    body: Body,
) -> ApiResult<()> {
    if vhost.unique_keys && tokio::fs::try_exists(target.file()?).await? {
        return Err(Error::Conflict(format!("'{name}' already exists as a file")).into());
    }

    let payload = read_body(body, declared).await?;
    let dirs = ensure_dir(&target.dir, vhost.dir_mode).await?;

    let archive = target.archive()?;
    let file_mode = vhost.file_mode;
    let integrity = vhost.integrity;
    let key = name.clone();
    let outcome = state
        .blocking(move |store| store.put(&archive, &key, &payload, file_mode, integrity))
        .await?;
    dirs.keep();

    info!(
        "PUT {} ({} bytes) into {} bucket {}{}",
        name,
        declared,
        target.dir.display(),
        outcome.bucket,
        if outcome.overwritten { " (overwrite)" } else { "" }
    );
    Ok(())
}

/// Collect exactly `declared` bytes of `body`
async fn read_body(body: Body, declared: u64) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(usize::try_from(declared).unwrap_or_default());
    let mut received = 0u64;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| Error::invalid_request(format!("failed to read body: {e}")))?;
        received += chunk.len() as u64;
        if received > declared {
            return Err(Error::LengthMismatch { declared, received });
        }
        payload.extend_from_slice(&chunk);
    }
    if received != declared {
        return Err(Error::LengthMismatch { declared, received });
    }
    Ok(payload)
}

async fn put_file(
    state: &AppState,
    vhost: &VhostConfig,
    target: &Target,
    name: &str,
    declared: u64,
    body: Body,
) -> ApiResult<()> {
    if vhost.unique_keys {
        let archive = target.archive()?;
        let key = name.to_string();
        if state.blocking(move |store| store.contains(&archive, &key)).await? {
            return Err(Error::Conflict(format!("'{name}' already exists in the archive")).into());
        }
    }

    let path = target.file()?;
    let dirs = ensure_dir(&target.dir, vhost.dir_mode).await?;
    let _guard = state.locks().acquire_async(&path.to_string_lossy()).await?;

    let upload = TempUpload::new(target.dir.join(format!("{UPLOAD_PREFIX}{}", Uuid::new_v4())));
    let file = match create_new(upload.path()).await {
        // a failed upload next door may have pruned the fresh directory
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            ensure_dir(&target.dir, vhost.dir_mode).await?.keep();
            create_new(upload.path()).await?
        }
        other => other?,
    };
    let crc = write_body(file, body, declared).await?;

    tokio::fs::set_permissions(upload.path(), std::fs::Permissions::from_mode(vhost.file_mode))
        .await?;
    if vhost.integrity {
        let actual = file_checksum(upload.path()).await?;
        if actual != crc {
            error!(
                "Upload of {} failed verification: expected {:08x}, got {:08x}",
                path.display(),
                crc,
                actual
            );
            return Err(Error::ChecksumMismatch {
                expected: crc,
                actual,
            }
            .into());
        }
    }

    tokio::fs::rename(upload.path(), &path).await?;
    upload.persist();
    dirs.keep();
    info!("PUT {} ({} bytes)", path.display(), declared);
    Ok(())
}

async fn create_new(path: &FsPath) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

/// Stream `body` into `file`, returning the payload checksum
async fn write_body(file: File, body: Body, declared: u64) -> Result<u32> {
    let mut writer = BufWriter::with_capacity(chunk_size(declared), file);
    let mut checksum = Checksum::new();
    let mut received = 0u64;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| Error::invalid_request(format!("failed to read body: {e}")))?;
        received += chunk.len() as u64;
        if received > declared {
            return Err(Error::LengthMismatch { declared, received });
        }
        checksum.update(&chunk);
        writer.write_all(&chunk).await?;
    }
    if received != declared {
        return Err(Error::LengthMismatch { declared, received });
    }

    writer.flush().await?;
    let file = writer.into_inner();
    file.sync_all().await?;

    let written = file.metadata().await?.len();
    if written != declared {
        return Err(Error::internal(format!(
            "wrote {written} of {declared} upload bytes"
        )));
    }
    Ok(checksum.finalize())
}

/// Checksum of a file's contents, read back from disk
async fn file_checksum(path: &FsPath) -> Result<u32> {
    let mut file = File::open(path).await?;
    let mut checksum = Checksum::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(checksum.finalize());
        }
        checksum.update(&buf[..n]);
    }
}

/// Create `dir` and any missing parents with `mode`
async fn ensure_dir(dir: &FsPath, mode: u32) -> Result<NewDirs> {
    let mut created = Vec::new();
    let mut missing = Some(dir);
    while let Some(candidate) = missing {
        if tokio::fs::try_exists(candidate).await? {
            break;
        }
        created.push(candidate.to_path_buf());
        missing = candidate.parent();
    }
    DirBuilder::new().recursive(true).mode(mode).create(dir).await?;
    Ok(NewDirs {
        created,
        keep: false,
    })
}

/// Directories an upload created, deepest first. Removed on drop while
/// still empty unless the upload landed.
struct NewDirs {
    created: Vec<PathBuf>,
    keep: bool,
}

impl NewDirs {
    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for NewDirs {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for dir in &self.created {
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }
}

/// Temporary upload file, removed on drop unless persisted
struct TempUpload {
    path: PathBuf,
    keep: bool,
}

impl TempUpload {
    const fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &FsPath {
        &self.path
    }

    fn persist(mut self) {
        self.keep = true;
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}
