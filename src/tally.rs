//! Theme suggestion tally with JSON persistence.
//!
//! Critical section: the in-memory map and the write of the entries file are
//! both guarded by the same mutex, so two batches can never interleave their
//! increments or their flushes.

use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type Entries = HashMap<String, u64>;

/// Errors that can occur while persisting the tally
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    /// The batch was counted in memory but could not be written to disk
    #[error("tallied {accepted} submissions but failed to persist {path}: {source}")]
    Persist {
        accepted: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tallied {accepted} submissions but failed to serialize entries: {source}")]
    Serialize {
        accepted: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl TallyError {
    /// Submissions counted in memory before the failure
    pub fn accepted(&self) -> usize {
        match self {
            TallyError::Persist { accepted, .. } | TallyError::Serialize { accepted, .. } => {
                *accepted
            }
        }
    }

    fn with_accepted(mut self, count: usize) -> Self {
        match &mut self {
            TallyError::Persist { accepted, .. } | TallyError::Serialize { accepted, .. } => {
                *accepted = count
            }
        }
        self
    }
}

/// One row of the results table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyRow {
    pub text: String,
    pub count: u64,
}

/// Normalize a submission for counting (trim whitespace, lowercase)
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

#[derive(Clone)]
pub struct EntryTally {
    entries: Arc<Mutex<Entries>>,
    path: PathBuf,
}

impl EntryTally {
    /// Create an empty tally that persists to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            path: path.into(),
        }
    }

    /// Load the tally from `path`.
    ///
    /// A missing file yields an empty tally. A malformed file also yields an
    /// empty tally; it is renamed to `<path>.corrupt` first so the next flush
    /// does not overwrite whatever was in it.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Entries>(&bytes) {
                Ok(entries) => {
                    tracing::info!(path = %path.display(), count = entries.len(), "Loaded entries");
                    sanitize(entries)
                }
                Err(e) => {
                    let aside = sibling(&path, ".corrupt");
                    tracing::warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        "Entries file is malformed, starting empty: {}",
                        e
                    );
                    if let Err(e) = tokio::fs::rename(&path, &aside).await {
                        tracing::error!("Failed to move malformed entries file aside: {}", e);
                    }
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No entries file found, starting empty");
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read entries file, starting empty: {}", e);
                HashMap::new()
            }
        };

        Self {
            entries: Arc::new(Mutex::new(entries)),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tally a single submission. Returns whether it was counted.
    pub async fn record(&self, raw: &str) -> Result<bool, TallyError> {
        self.record_batch(std::slice::from_ref(&raw))
            .await
            .map(|accepted| accepted == 1)
    }

    /// Tally a batch of submissions and flush once.
    ///
    /// Empty submissions (after normalization) are skipped. Returns how many
    /// were counted. On a failed flush the in-memory counts are kept and the
    /// error carries the accepted count.
    pub async fn record_batch<S: AsRef<str>>(&self, raws: &[S]) -> Result<usize, TallyError> {
        let mut entries = self.entries.lock().await;

        let mut accepted = 0;
        for raw in raws {
            let key = normalize(raw.as_ref());
            if key.is_empty() {
                continue;
            }
            *entries.entry(key).or_insert(0) += 1;
            accepted += 1;
        }

        if accepted == 0 {
            return Ok(0);
        }

        write_atomic(&self.path, &entries)
            .await
            .map_err(|e| e.with_accepted(accepted))?;

        tracing::debug!(accepted, distinct = entries.len(), "Recorded submissions");
        Ok(accepted)
    }

    /// Write the current tally to disk
    pub async fn flush(&self) -> Result<(), TallyError> {
        let entries = self.entries.lock().await;
        write_atomic(&self.path, &entries).await
    }

    pub async fn count(&self, text: &str) -> u64 {
        self.entries
            .lock()
            .await
            .get(&normalize(text))
            .copied()
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> Entries {
        self.entries.lock().await.clone()
    }

    /// All entries, most popular first, ties broken alphabetically
    pub async fn sorted(&self) -> Vec<TallyRow> {
        let mut rows: Vec<TallyRow> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(text, count)| TallyRow {
                text: text.clone(),
                count: *count,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.text.cmp(&b.text)));
        rows
    }
}

/// Drop keys that would be rejected by `record`, merging hand-edited ones
fn sanitize(raw: Entries) -> Entries {
    let mut entries = HashMap::with_capacity(raw.len());
    for (text, count) in raw {
        let key = normalize(&text);
        if key.is_empty() {
            continue;
        }
        *entries.entry(key).or_insert(0) += count;
    }
    entries
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Write to a temp file next to `path`, then rename over it
async fn write_atomic(path: &Path, entries: &Entries) -> Result<(), TallyError> {
    let json = serde_json::to_vec(entries)
        .map_err(|source| TallyError::Serialize { accepted: 0, source })?;
    let tmp = sibling(path, ".tmp");

    let persist_err = |source| TallyError::Persist {
        accepted: 0,
        path: path.to_path_buf(),
        source,
    };

    tokio::fs::write(&tmp, json).await.map_err(persist_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(persist_err)?;
    Ok(())
}
