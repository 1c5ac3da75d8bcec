pub mod config;
pub mod pair;

pub use pair::UrlPair;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("File not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Permission denied: {0:?}")]
    AccessDenied(PathBuf, #[source] std::io::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("CSV error")]
    Csv(#[from] csv::Error),
    #[error("Malformed row on line {line}: {content:?}")]
    MalformedRow { line: u64, content: String },
    #[error("Invalid configuration in {0:?}")]
    Config(PathBuf, #[source] toml::de::Error),
}

impl Error {
    /// Classify an I/O failure on a named file.
    pub fn from_io<P: AsRef<Path>>(path: P, error: std::io::Error) -> Self {
        match error.kind() {
            ErrorKind::NotFound => Self::NotFound(path.as_ref().to_path_buf()),
            ErrorKind::PermissionDenied => Self::AccessDenied(path.as_ref().to_path_buf(), error),
            _ => Self::Io(error),
        }
    }
}
