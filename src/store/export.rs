//! Flat-file export of a reading store.

#![allow(missing_docs)]

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::core::errors::{Result, TwinError};
use crate::store::sqlite::ReadingStore;

/// Header line of every export.
pub const CSV_HEADER: &str = "sensor_id,timestamp,value";

/// What an export wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub topics: usize,
    pub rows: usize,
}

/// Write every row of `store` to `destination` as CSV, grouped by topic in
/// order of first appearance, oldest row first within a topic.
///
/// The file is assembled next to `destination` and renamed into place, so a
/// reader never sees a half-written export.
pub fn export_all_to_flat_file(store: &ReadingStore, destination: &Path) -> Result<ExportSummary> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| TwinError::io(parent, source))?;
    }
    let tmp = destination.with_extension("csv.tmp");
    let summary = write_csv(store, &tmp).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })?;
    fs::rename(&tmp, destination).map_err(|source| TwinError::io(destination, source))?;
    Ok(summary)
}

fn write_csv(store: &ReadingStore, path: &Path) -> Result<ExportSummary> {
    let file = File::create(path).map_err(|source| TwinError::io(path, source))?;
    let mut out = BufWriter::new(file);
    let io_err = |source| TwinError::io(path, source);

    writeln!(out, "{CSV_HEADER}").map_err(io_err)?;
    let mut summary = ExportSummary::default();
    for topic in store.distinct_topics()? {
        let rows = store.read_by_topic(&topic)?;
        let field = csv_field(&topic);
        for row in &rows {
            writeln!(out, "{field},{},{}", csv_field(&row.timestamp), row.value).map_err(io_err)?;
        }
        summary.topics += 1;
        summary.rows += rows.len();
    }
    out.flush().map_err(io_err)?;
    out.get_ref().sync_all().map_err(io_err)?;
    Ok(summary)
}

/// Quote a field when it contains a separator, quote or line break.
fn csv_field(raw: &str) -> std::borrow::Cow<'_, str> {
    if raw.contains([',', '"', '\n', '\r']) {
        std::borrow::Cow::Owned(format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(raw)
    }
}
