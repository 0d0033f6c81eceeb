//! Custom error types and result handling for Seihon operations.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`.
//!
//! Only file system and archive-structure failures travel through this type as
//! hard errors. Malformed fragments, mismatched JSON value types, unparseable
//! numeric fields and missing metadata entries are absorbed where they occur
//! (skipped unit, skipped candidate, omitted field, empty metadata).
use std::path::PathBuf;

/// Type alias for Results with Seihon errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all Seihon operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O errors from the standard library
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Regular expression parsing errors
    #[error(transparent)]
    Regex(#[from] regex::Error),
    /// Image probing or placeholder rendering errors
    #[error(transparent)]
    Image(#[from] image::ImageError),
    /// ZIP file operation errors
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// XML reader errors
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    /// JSON sidecar or resolver table errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Blocking task join errors
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    SeihonBuilder(#[from] crate::seihon::SeihonConfigBuilderError),
    /// A text or HTML fragment that could not be parsed
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    /// Zero or several eligible media files where exactly one was required
    #[error("Expected exactly one eligible media file in '{0:?}', found {1}")]
    MissingSourceMedia(PathBuf, usize),
    /// Error for invalid file or directory paths
    #[error("The given path '{0:?}' is invalid: {1}")]
    InvalidPath(PathBuf, String),
    /// Error for failed blocking tasks
    #[error("Asynchronous task failed: {0}")]
    AsyncTaskError(String),
    /// Error for unsupported operations or formats
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Error for resources that couldn't be found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Other errors that don't fit into specific categories
    #[error("Other error: {0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Other(error)
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Error::Other(error.to_string())
    }
}
