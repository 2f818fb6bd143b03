//! Event settings loaded from the settings JSON file.
//!
//! The file is edited by hand by whoever runs the event. The running process
//! only ever reads it, except on first start when defaults are written out.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_ADDRESS: &str = ":8080";
pub const DEFAULT_TITLE: &str = "Game Jam";
pub const DEFAULT_ENTRIES: usize = 4;

/// Errors that can occur while loading or saving settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings file {0} not found")]
    NotFound(PathBuf),

    #[error("settings file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Event configuration. Field names match the on-disk JSON keys.
///
/// Only the dates are required; a hand-edited file may leave out the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub text: String,
    /// Number of submission input slots shown on the form
    #[serde(default = "default_entries")]
    pub entries: usize,
    #[serde(default = "default_use_captcha")]
    pub use_captcha: bool,
    #[serde(default)]
    pub use_header: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_title() -> String {
    DEFAULT_TITLE.to_string()
}

fn default_entries() -> usize {
    DEFAULT_ENTRIES
}

fn default_use_captcha() -> bool {
    true
}

/// Where the event currently stands relative to its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    NotStarted,
    Open,
    Ended,
}

impl EventPhase {
    pub fn is_started(self) -> bool {
        self != EventPhase::NotStarted
    }

    pub fn is_ended(self) -> bool {
        self == EventPhase::Ended
    }

    pub fn is_open(self) -> bool {
        self == EventPhase::Open
    }
}

impl Settings {
    /// Settings for a fresh install: opens a week from `now`, runs three weeks.
    pub fn defaults(now: DateTime<Utc>) -> Self {
        let start_date = now + Duration::weeks(1);
        Self {
            address: default_address(),
            title: default_title(),
            text: String::new(),
            entries: default_entries(),
            use_captcha: default_use_captcha(),
            use_header: false,
            start_date,
            end_date: start_date + Duration::weeks(3),
        }
    }

    /// Phase of the event at `now`. The window is `[start_date, end_date)`.
    pub fn phase(&self, now: DateTime<Utc>) -> EventPhase {
        if now >= self.end_date {
            EventPhase::Ended
        } else if now >= self.start_date {
            EventPhase::Open
        } else {
            EventPhase::NotStarted
        }
    }

    /// Address suitable for `TcpListener::bind`.
    ///
    /// A bare `:port` binds on all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        }
    }

    pub async fn load(path: &Path) -> Result<Self, SettingsError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SettingsError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| SettingsError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Load settings, writing defaults out when the file does not exist yet.
    ///
    /// A corrupt file is an error and is left untouched on disk.
    pub async fn load_or_init(path: &Path, now: DateTime<Utc>) -> Result<Self, SettingsError> {
        match Self::load(path).await {
            Ok(settings) => {
                if settings.start_date > settings.end_date {
                    tracing::warn!(
                        start = %settings.start_date,
                        end = %settings.end_date,
                        "Event start is after its end; submissions will never open"
                    );
                }
                Ok(settings)
            }
            Err(SettingsError::NotFound(_)) => {
                let settings = Self::defaults(now);
                tracing::info!(path = %path.display(), "No settings file found, writing defaults");
                if let Err(e) = settings.save(path).await {
                    tracing::error!("Failed to persist default settings: {}", e);
                }
                Ok(settings)
            }
            Err(e) => Err(e),
        }
    }
}
