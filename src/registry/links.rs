//! Topic → building entity links exported from the BIM tool.
//!
//! The export is a `;`-separated text table with a header row. Only the
//! `FullTopic` and `IFC Device GUID` columns are used; rows without a GUID or
//! with too few fields are skipped. Files that are not valid UTF-8 are read as
//! Latin-1, which is what the spreadsheet export produces on Windows.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::errors::{Result, TwinError};

/// Column holding the MQTT topic.
pub const TOPIC_COLUMN: &str = "FullTopic";
/// Column holding the building entity id.
pub const GUID_COLUMN: &str = "IFC Device GUID";

const SEPARATOR: char = ';';

/// Load a link table from `path`.
pub fn load_csv(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let bytes = fs::read(path).map_err(|source| TwinError::io(path, source))?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&b| char::from(b)).collect(),
    };
    parse(&text).map_err(|details| TwinError::LinkParse {
        path: path.to_path_buf(),
        details,
    })
}

/// Parse link table text. A topic listed on several rows collects every GUID.
pub fn parse(text: &str) -> std::result::Result<BTreeMap<String, Vec<String>>, String> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or_else(|| "empty link table".to_string())?;
    let columns: Vec<String> = split_row(header.trim_start_matches('\u{feff}'));

    let topic_idx = column_index(&columns, TOPIC_COLUMN)?;
    let guid_idx = column_index(&columns, GUID_COLUMN)?;

    let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in lines {
        let fields = split_row(line);
        let (Some(topic), Some(guid)) = (fields.get(topic_idx), fields.get(guid_idx)) else {
            continue;
        };
        if topic.is_empty() || guid.is_empty() {
            continue;
        }
        let ids = links.entry(topic.clone()).or_default();
        if !ids.contains(guid) {
            ids.push(guid.clone());
        }
    }
    Ok(links)
}

fn column_index(columns: &[String], name: &str) -> std::result::Result<usize, String> {
    columns
        .iter()
        .position(|col| col == name)
        .ok_or_else(|| format!("missing column {name:?}"))
}

fn split_row(line: &str) -> Vec<String> {
    line.split(SEPARATOR)
        .map(|field| {
            let field = field.trim();
            field
                .strip_prefix('"')
                .and_then(|f| f.strip_suffix('"'))
                .unwrap_or(field)
                .trim()
                .to_string()
        })
        .collect()
}
