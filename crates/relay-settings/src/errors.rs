//! Settings error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The settings file is not JSON.
    #[error("settings file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The merged document does not deserialize into [`crate::RelaySettings`],
    /// e.g. `"port": "eighty"`.
    #[error("settings have the wrong shape: {0}")]
    Shape(#[from] serde_json::Error),
}

impl SettingsError {
    /// The file the error came from, when there was one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            Self::Shape(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
