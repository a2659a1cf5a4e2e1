use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid entry name '{name}'")]
    InvalidName { name: String },

    #[error("invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("'{name}' not found")]
    NotFound { name: String },

    #[error("'{name}' is not a directory")]
    NotADirectory { name: String },

    #[error("'{name}' is not a file")]
    NotAFile { name: String },

    #[error("directory '{name}' is not empty")]
    NotEmpty { name: String },

    #[error("refusing to delete '{target}': it resolves to protected location '{protected}'")]
    RootDeletionGuard { target: String, protected: String },

    #[error("I/O error on '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_guard(&self) -> bool {
        matches!(self, Error::RootDeletionGuard { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn from_io(path: &Path, err: io::Error) -> Error {
    let name = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound { name },
        io::ErrorKind::NotADirectory => Error::NotADirectory { name },
        io::ErrorKind::IsADirectory => Error::NotAFile { name },
        io::ErrorKind::DirectoryNotEmpty => Error::NotEmpty { name },
        _ => Error::Io {
            path: path.to_path_buf(),
            source: err,
        },
    }
}
