//! File-based selection channel between the operator and visualizers.
//!
//! The shared file holds one JSON object: `{"visual_topics": [...]}` in multi
//! mode or `{"visual_topic": "..."}` in single mode. Writers replace it
//! atomically (temp file in the same directory, then `rename`), so readers
//! see either the old or the new selection, never a torn one. One writer per
//! file is assumed; concurrent writers race and the last rename wins.

#![allow(missing_docs)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::config::SelectionMode;
use crate::core::errors::{Result, TwinError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// On-disk shape of the selection file. Either key may be absent.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visual_topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visual_topic: Option<String>,
}

/// Owned handle on one selection file plus the last selection known to it.
pub struct SelectionChannel {
    path: PathBuf,
    mode: SelectionMode,
    known: RwLock<Vec<String>>,
    last_error: Mutex<Option<String>>,
    logger: ActivityLoggerHandle,
}

impl SelectionChannel {
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        mode: SelectionMode,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            path: path.into(),
            mode,
            known: RwLock::new(Vec::new()),
            last_error: Mutex::new(None),
            logger,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Last selection published or successfully read through this handle.
    #[must_use]
    pub fn current(&self) -> Vec<String> {
        self.known.read().clone()
    }

    /// Replace the shared selection.
    ///
    /// Single mode carries exactly one topic; any other count is rejected.
    pub fn publish_selection(&self, topics: &[String]) -> Result<()> {
        let body = match self.mode {
            SelectionMode::Multi => SelectionFile {
                visual_topics: Some(topics.to_vec()),
                visual_topic: None,
            },
            SelectionMode::Single => match topics {
                [topic] => SelectionFile {
                    visual_topics: None,
                    visual_topic: Some(topic.clone()),
                },
                _ => {
                    return Err(TwinError::Serialization {
                        context: "selection",
                        details: format!(
                            "single mode publishes exactly one topic, got {}",
                            topics.len()
                        ),
                    });
                }
            },
        };
        let json = serde_json::to_string(&body)?;
        write_atomic(&self.path, json.as_bytes())?;

        *self.known.write() = topics.to_vec();
        self.logger.send(ActivityEvent::SelectionPublished {
            path: self.path.display().to_string(),
            topics: topics.to_vec(),
        });
        Ok(())
    }

    /// Current shared selection.
    ///
    /// When the file is missing or cannot be parsed the last known selection
    /// is returned (initially empty). A file that parses but lacks this
    /// mode's key is an empty selection.
    pub fn read_selection(&self) -> Vec<String> {
        match self.try_read_selection() {
            Ok(Some(topics)) => {
                *self.last_error.lock() = None;
                (*self.known.write()).clone_from(&topics);
                topics
            }
            Ok(None) => {
                self.note_unreadable("file not found");
                self.current()
            }
            Err(err) => {
                self.note_unreadable(&err.to_string());
                self.current()
            }
        }
    }

    /// Read the file without falling back. `Ok(None)` when it does not exist.
    pub fn try_read_selection(&self) -> Result<Option<Vec<String>>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(TwinError::io(&self.path, source)),
        };
        let file: SelectionFile = serde_json::from_str(&raw)?;
        let topics = match self.mode {
            SelectionMode::Multi => file.visual_topics.unwrap_or_default(),
            SelectionMode::Single => file.visual_topic.into_iter().collect(),
        };
        Ok(Some(topics))
    }

    /// Log an unreadable file once per distinct failure, not on every poll.
    fn note_unreadable(&self, message: &str) {
        let mut last = self.last_error.lock();
        if last.as_deref() == Some(message) {
            return;
        }
        eprintln!(
            "[SLT-SELECT] selection file {} unreadable, keeping previous selection: {message}",
            self.path.display()
        );
        self.logger.send(ActivityEvent::SelectionUnreadable {
            path: self.path.display().to_string(),
            message: message.to_string(),
        });
        *last = Some(message.to_string());
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| TwinError::io(parent, source))?;

    let file_name = path
        .file_name()
        .map_or_else(|| "selection".into(), |n| n.to_string_lossy().into_owned());
    let tmp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

    let written = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(TwinError::io(path, source));
    }
    Ok(())
}
