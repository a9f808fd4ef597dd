//! Durable store for messages that could not be delivered.
//!
//! The buffer is an ordered list written out in full on every change and
//! read back once when the publisher starts.

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::reading::PublishRecord;

#[derive(Debug, Error)]
pub enum OfflineBufferError {
    #[error("offline buffer I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("offline buffer is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

/// Ordered list of undelivered records, optionally backed by a file.
#[derive(Debug, Default)]
pub struct OfflineBuffer {
    path: Option<PathBuf>,
    entries: Vec<PublishRecord>,
}

impl OfflineBuffer {
    /// A buffer that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the buffer at `path`, loading existing entries if the file exists.
    ///
    /// A corrupt file is moved aside to `<name>.corrupt-<timestamp>` and the
    /// buffer starts empty. An unreadable file is logged and left in place.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::load(&path) {
            Ok(Some(entries)) => {
                info!(
                    path = %path.display(),
                    count = entries.len(),
                    "Loaded offline buffer"
                );
                entries
            }
            Ok(None) => Vec::new(),
            Err(OfflineBufferError::Format(e)) => {
                match Self::quarantine(&path) {
                    Ok(moved_to) => warn!(
                        path = %path.display(),
                        moved_to = %moved_to.display(),
                        error = %e,
                        "Offline buffer is corrupt, moved it aside"
                    ),
                    Err(io) => warn!(
                        path = %path.display(),
                        error = %e,
                        rename_error = %io,
                        "Offline buffer is corrupt and could not be moved aside"
                    ),
                }
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load offline buffer");
                Vec::new()
            }
        };

        Self {
            path: Some(path),
            entries,
        }
    }

    fn load(path: &Path) -> Result<Option<Vec<PublishRecord>>, OfflineBufferError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(path).map_err(|source| OfflineBufferError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "offline_buffer".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let target = path.with_file_name(format!("{}.corrupt-{}", name, stamp));
        std::fs::rename(path, &target)?;
        Ok(target)
    }

    /// Append records and persist the whole buffer.
    ///
    /// The records stay buffered in memory even if persisting fails.
    pub fn append(
        &mut self,
        records: impl IntoIterator<Item = PublishRecord>,
    ) -> Result<(), OfflineBufferError> {
        self.entries.extend(records);
        self.persist()
    }

    /// Remove and return up to `max` of the oldest entries without persisting.
    pub(crate) fn take_front(&mut self, max: usize) -> Vec<PublishRecord> {
        let count = max.min(self.entries.len());
        self.entries.drain(..count).collect()
    }

    /// Put entries back at the front, preserving their order.
    pub(crate) fn restore_front(&mut self, records: Vec<PublishRecord>) {
        self.entries.splice(0..0, records);
    }

    /// Write the full buffer to its backing file, if any.
    pub fn persist(&self) -> Result<(), OfflineBufferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_vec(&self.entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|source| OfflineBufferError::Io {
                path: path.clone(),
                source,
            })
    }

    pub fn entries(&self) -> &[PublishRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
