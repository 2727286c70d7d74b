//! Redb table definitions and archive naming.
//!
//! An archive is one redb file per directory, `<dir>/<basename(dir)>.bolt`.
//! Tables play the role of buckets:
//! - `index`: object key -> name of the data table holding it
//! - `count`: `counter` -> highest allocated data table ordinal
//! - `wzd<N>`: object key -> encoded record

use redb::TableDefinition;
use std::path::{Path, PathBuf};

pub const INDEX: TableDefinition<&str, &str> = TableDefinition::new("index");
pub const COUNT: TableDefinition<&str, u64> = TableDefinition::new("count");

/// Single key inside [`COUNT`]
pub const COUNTER_KEY: &str = "counter";

/// Data table name prefix
pub const BUCKET_PREFIX: &str = "wzd";

/// Archive file extension
pub const ARCHIVE_EXTENSION: &str = "bolt";

/// Data table name for an ordinal (`wzd1`, `wzd2`, ...)
#[must_use]
pub fn bucket_name(ordinal: u64) -> String {
    format!("{BUCKET_PREFIX}{ordinal}")
}

/// Ordinal of a data table name, `None` for other tables
#[must_use]
pub fn bucket_ordinal(name: &str) -> Option<u64> {
    name.strip_prefix(BUCKET_PREFIX)?
        .parse()
        .ok()
        .filter(|n| *n >= 1)
}

/// Definition of a data table by name
#[must_use]
pub fn bucket_table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Archive file holding the objects of `dir`
#[must_use]
pub fn archive_path_for(dir: &Path) -> Option<PathBuf> {
    let base = dir.file_name()?.to_str()?;
    Some(dir.join(format!("{base}.{ARCHIVE_EXTENSION}")))
}

/// Whether a file name is reserved for archives
#[must_use]
pub fn is_archive_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}
