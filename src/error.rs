//! Error handling for mcsupervisor.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors that can occur while supervising a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid server configuration detected before anything was spawned.
    #[error("Invalid server configuration: {0}")]
    Config(String),

    /// Error resolving or downloading the server artifact.
    #[error("Failed to fetch server artifact: {0}")]
    Download(#[from] DownloadError),

    /// The operation requires a live server process.
    #[error("Server '{0}' is not running")]
    NotRunning(String),

    /// The server is already starting, running, or stopping.
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    /// The forced kill issued after the shutdown timeout failed.
    #[error("Failed to force kill server process {pid}: {source}")]
    Shutdown {
        /// PID of the process that could not be killed.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: nix::errno::Errno,
    },

    /// An enum-constrained setter was given a value outside its accepted set.
    #[error("invalid {field} '{value}'. Valid options: {}", accepted.join(", "))]
    Validation {
        /// Name of the setting that was rejected.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Values accepted for this setting.
        accepted: &'static [&'static str],
    },

    /// Pipe or file failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backup or restore failure.
    #[error("Backup error: {0}")]
    Archive(#[from] ArchiveError),

    /// Installing or removing OS signal handlers failed.
    #[error("Signal handler error: {0}")]
    Signal(nix::errno::Errno),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ServerError`.
impl<T> From<std::sync::PoisonError<T>> for ServerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ServerError::MutexPoisonError(err.to_string())
    }
}

/// Error type for artifact resolution.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The HTTP request itself failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("GET {url} returned status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code returned.
        status: u16,
    },

    /// Writing the downloaded file failed.
    #[error("Failed to write download: {0}")]
    Io(#[from] std::io::Error),

    /// A manifest or metadata document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The downloaded content does not match its published hash.
    #[error("SHA-1 mismatch for {url}: got {actual}, expected {expected}")]
    Integrity {
        /// URL the content came from.
        url: String,
        /// Published hash.
        expected: String,
        /// Hash of the bytes actually received.
        actual: String,
    },

    /// The requested version is not listed in the manifest.
    #[error("Version '{0}' not found in manifest")]
    UnknownVersion(String),
}

/// Error type for backup and restore operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Reading the source tree or writing the archive failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// An archive entry would escape the restore directory.
    #[error("Refusing to restore unsafe path '{}'", .0.display())]
    UnsafePath(PathBuf),

    /// The archive does not match its checksum sidecar.
    #[error("Checksum mismatch for '{}': got {actual}, expected {expected}", path.display())]
    ChecksumMismatch {
        /// Archive that failed verification.
        path: PathBuf,
        /// Hash recorded in the sidecar.
        expected: String,
        /// Hash of the archive on disk.
        actual: String,
    },

    /// No archive exists at the requested location.
    #[error("No backup found at '{}'", .0.display())]
    NotFound(PathBuf),
}
