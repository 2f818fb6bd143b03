//! Errors that stop the service from starting or serving

use crate::settings::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to load settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}
