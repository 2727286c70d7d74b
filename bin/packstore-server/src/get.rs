//! GET, HEAD and OPTIONS handlers.
//!
//! A name resolves to the standalone file first and to the directory archive
//! second; `FromArchive: 1` skips the file. Listing headers turn the request
//! into a directory listing.

use crate::http::{
    ApiResult, ByteRange, FROM_ARCHIVE_HEADER, ObjectInfo, RangeRequest, SNIFF_LEN, chunk_size,
    content_type_for, etag, extension_content_type, header_flag, not_modified, object_headers,
    resolve_range, respond, set_header,
};
use crate::listing::{self, ListingRequest};
use crate::state::AppState;
use crate::target::Target;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
};
use bytes::Bytes;
use futures::stream::{self, Stream};
use packstore_archive::{ReadPlan, StoreError};
use packstore_common::{Error, VhostConfig};
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

pub async fn get_root(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> ApiResult {
    serve(&state, &method, "/", &headers).await
}

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    serve(&state, &method, &path, &headers).await
}

async fn serve(state: &AppState, method: &Method, path: &str, headers: &HeaderMap) -> ApiResult {
    let vhost = state.vhosts.resolve(headers)?;
    let target = Target::resolve(&vhost.root, path)?;

    if let Some(request) = ListingRequest::from_headers(headers)? {
        return listing::respond(state, &target, request).await;
    }

    let Some(name) = target.name.clone() else {
        return Err(Error::not_found(format!("/{path}")).into());
    };
    if target.is_reserved() {
        return Err(Error::not_found(format!("/{path}")).into());
    }

    if !header_flag(headers, FROM_ARCHIVE_HEADER) {
        let file = target.file()?;
        match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => {
                return serve_file(&vhost, method, headers, file, &name, &meta).await;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    serve_archived(state, &vhost, method, headers, &target, name).await
}

/// Status and headers of an object response, and the bytes it carries
struct ResponsePlan {
    status: StatusCode,
    headers: HeaderMap,
    range: Option<ByteRange>,
    send_body: bool,
}

fn plan_response(
    vhost: &VhostConfig,
    method: &Method,
    request: &HeaderMap,
    info: ObjectInfo,
    content_type: &str,
) -> ApiResult<ResponsePlan> {
    let mut headers = object_headers(info, content_type, vhost.cache_max_age);
    if *method == Method::OPTIONS {
        set_header(&mut headers, header::ALLOW, &allowed_methods(vhost));
    }

    if not_modified(request, &etag(info.mtime, info.size), info.mtime) {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_TYPE);
        return Ok(ResponsePlan {
            status: StatusCode::NOT_MODIFIED,
            headers,
            range: None,
            send_body: false,
        });
    }

    let (status, range) = match resolve_range(request, info.size) {
        RangeRequest::Full => (StatusCode::OK, None),
        RangeRequest::Partial(range) => {
            set_header(
                &mut headers,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", range.start, range.end, info.size),
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
            (StatusCode::PARTIAL_CONTENT, Some(range))
        }
        RangeRequest::Unsatisfiable => {
            return Err(Error::RangeNotSatisfiable { size: info.size }.into());
        }
    };

    Ok(ResponsePlan {
        status,
        headers,
        range,
        send_body: *method == Method::GET,
    })
}

fn allowed_methods(vhost: &VhostConfig) -> String {
    let mut methods = vec!["GET", "HEAD", "OPTIONS"];
    if vhost.upload {
        methods.push("PUT");
    }
    if vhost.delete {
        methods.push("DELETE");
    }
    methods.join(", ")
}

async fn serve_file(
    vhost: &VhostConfig,
    method: &Method,
    request: &HeaderMap,
    path: PathBuf,
    name: &str,
    meta: &std::fs::Metadata,
) -> ApiResult {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    let info = ObjectInfo {
        size: meta.len(),
        mtime,
    };

    let content_type = match extension_content_type(name) {
        Some(content_type) => content_type,
        None => content_type_for(name, &read_head(&path).await?),
    };

    let plan = plan_response(vhost, method, request, info, content_type)?;
    if !plan.send_body {
        return Ok(respond(plan.status, plan.headers, Body::empty()));
    }

    let range = plan.range.unwrap_or(ByteRange {
        start: 0,
        end: info.size.saturating_sub(1),
    });
    let length = if info.size == 0 { 0 } else { range.len() };

    let mut file = File::open(&path).await?;
    if range.start > 0 {
        file.seek(SeekFrom::Start(range.start)).await?;
    }
    debug!("Serving {} ({} bytes) from file", path.display(), length);

    Ok(respond(
        plan.status,
        plan.headers,
        Body::from_stream(file_stream(file, length)),
    ))
}

/// First bytes of a file, for content sniffing
async fn read_head(path: &std::path::Path) -> io::Result<Vec<u8>> {
    let file = File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

/// Stream `length` bytes of `file` in tiered chunks
fn file_stream(file: File, length: u64) -> impl Stream<Item = io::Result<Bytes>> + Send {
    stream::try_unfold((file, length), |(mut file, remaining)| async move {
        if remaining == 0 {
            return Ok(None);
        }
        let want = chunk_size(remaining).min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let mut buf = vec![0u8; want];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while streaming",
            ));
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), (file, remaining - n as u64))))
    })
}

async fn serve_archived(
    state: &AppState,
    vhost: &Arc<VhostConfig>,
    method: &Method,
    request: &HeaderMap,
    target: &Target,
    name: String,
) -> ApiResult {
    let archive = target.archive()?;
    let verify = vhost.integrity;
    let header_only = *method != Method::GET;
    let conditions = request.clone();

    let key = name.clone();
    let read = state
        .blocking(move |store| {
            store.read(&archive, &key, verify, |header| {
                let size = header.size;
                let mtime = u64::from(header.date);
                if header_only || not_modified(&conditions, &etag(mtime, size), mtime) {
                    return Ok(ReadPlan::HeaderOnly);
                }
                match resolve_range(&conditions, size) {
                    RangeRequest::Full => Ok(ReadPlan::Full),
                    RangeRequest::Partial(range) => Ok(ReadPlan::Range {
                        start: range.start,
                        end: range.end,
                    }),
                    RangeRequest::Unsatisfiable => Err(StoreError::RangeNotSatisfiable { size }),
                }
            })
        })
        .await?;

    let info = ObjectInfo {
        size: read.header.size,
        mtime: u64::from(read.header.date),
    };
    // only a full read starts at the payload head
    let head: &[u8] = if read.plan == ReadPlan::Full {
        &read.body
    } else {
        &[]
    };
    let content_type = content_type_for(&name, head);
    let plan = plan_response(vhost, method, request, info, content_type)?;
    debug!(
        "Serving {} ({:?}) from archive {}",
        name,
        read.plan,
        target.dir.display()
    );

    let body = if plan.send_body {
        Body::from(read.body)
    } else {
        Body::empty()
    };
    Ok(respond(plan.status, plan.headers, body))
}
