//! Mapping request paths onto the virtual host root.

use packstore_archive::{archive_path_for, is_archive_name};
use packstore_common::{Error, Result};
use std::path::{Path, PathBuf};

/// Prefix of in-flight upload files; never listed or served
pub const UPLOAD_PREFIX: &str = ".upload-";

/// Filesystem location addressed by a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Directory holding the object and its archive
    pub dir: PathBuf,
    /// Object name inside `dir`; `None` when the path ends with `/`
    pub name: Option<String>,
}

impl Target {
    /// Resolve `uri_path` below `root`. Empty, `.` and `..` segments are
    /// rejected so a request never leaves the root.
    pub fn resolve(root: &Path, uri_path: &str) -> Result<Self> {
        let trimmed = uri_path.trim_start_matches('/');
        let is_dir = trimmed.is_empty() || trimmed.ends_with('/');
        let trimmed = trimmed.trim_end_matches('/');

        let mut segments = Vec::new();
        if !trimmed.is_empty() {
            for segment in trimmed.split('/') {
                if segment.is_empty() || segment == "." || segment == ".." {
                    return Err(Error::invalid_request(format!("invalid path '{uri_path}'")));
                }
                if segment.contains('\0') || segment.contains('\\') {
                    return Err(Error::invalid_request(format!("invalid path '{uri_path}'")));
                }
                segments.push(segment);
            }
        }

        let name = if is_dir { None } else { segments.pop() };
        let mut dir = root.to_path_buf();
        dir.extend(segments);

        Ok(Self {
            dir,
            name: name.map(str::to_string),
        })
    }

    /// Object name, required for object operations
    pub fn name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::invalid_request("path names a directory"))
    }

    /// Standalone file path
    pub fn file(&self) -> Result<PathBuf> {
        Ok(self.dir.join(self.name()?))
    }

    /// Archive of the target's directory
    pub fn archive(&self) -> Result<PathBuf> {
        archive_path_for(&self.dir)
            .ok_or_else(|| Error::invalid_request("directory cannot hold an archive"))
    }

    /// The whole path viewed as a directory
    #[must_use]
    pub fn as_directory(&self) -> PathBuf {
        match &self.name {
            Some(name) => self.dir.join(name),
            None => self.dir.clone(),
        }
    }

    /// Names reserved for archives and in-flight uploads
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|name| is_archive_name(name) || name.starts_with(UPLOAD_PREFIX))
    }
}
