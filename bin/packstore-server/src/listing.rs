//! Directory listing and counting.

use crate::http::{ApiResult, KEYS_COUNT_HEADER, KEYS_HEADER, UNIQUE_HEADER, header_flag, header_str};
use crate::state::AppState;
use crate::target::{Target, UPLOAD_PREFIX};
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use packstore_archive::{archive_path_for, is_archive_name};
use packstore_common::{Error, Result};
use serde_json::json;
use std::path::Path;

/// Which storage forms a listing covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Files,
    Archive,
}

impl Scope {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "files" => Ok(Self::Files),
            "archive" => Ok(Self::Archive),
            other => Err(Error::invalid_request(format!(
                "listing scope must be all, files or archive, got '{other}'"
            ))),
        }
    }

    const fn includes_files(self) -> bool {
        matches!(self, Self::All | Self::Files)
    }

    const fn includes_archive(self) -> bool {
        matches!(self, Self::All | Self::Archive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingRequest {
    pub scope: Scope,
    pub count_only: bool,
    pub unique: bool,
}

impl ListingRequest {
    /// Listing requested by `Keys` or `KeysCount`; `Keys` wins when both are set
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Result<Option<Self>> {
        let (value, count_only) = match (
            header_str(headers, KEYS_HEADER),
            header_str(headers, KEYS_COUNT_HEADER),
        ) {
            (Some(value), _) => (value, false),
            (None, Some(value)) => (value, true),
            (None, None) => return Ok(None),
        };
        Ok(Some(Self {
            scope: Scope::parse(value)?,
            count_only,
            unique: header_flag(headers, UNIQUE_HEADER),
        }))
    }
}

/// Answer a listing request for the directory named by `target`
pub async fn respond(state: &AppState, target: &Target, request: ListingRequest) -> ApiResult {
    let dir = target.as_directory();
    if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
        return Err(Error::not_found(dir.display().to_string()).into());
    }

    let mut names = Vec::new();
    if request.scope.includes_files() {
        names.extend(list_files(&dir).await?);
    }
    if request.scope.includes_archive() {
        if let Some(archive) = archive_path_for(&dir) {
            names.extend(state.blocking(move |store| store.keys(&archive)).await?);
        }
    }

    names.sort_unstable();
    if request.unique {
        names.dedup();
    }

    let response: Response = if request.count_only {
        Json(json!({ "count": names.len() })).into_response()
    } else {
        Json(names).into_response()
    };
    Ok(response)
}

/// Regular files of `dir`, without archives and in-flight uploads
async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_archive_name(&name) || name.starts_with(UPLOAD_PREFIX) {
            continue;
        }
        names.push(name);
    }
    Ok(names)
}
