//! Filesystem error types

use thiserror::Error;

/// Errors that can occur during filesystem operations
#[derive(Debug, Error)]
pub enum FilesystemError {
    /// Path traversal attempt detected
    #[error("Path traversal detected: attempted to access path outside root")]
    PathTraversal,

    /// File or directory not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FilesystemError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FilesystemError::NotFound(_))
    }
}

/// Result type for filesystem operations
pub type FilesystemResult<T> = Result<T, FilesystemError>;
