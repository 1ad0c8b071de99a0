//! Error types for the Fileson library
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`FilesonError`]. Structural problems (unreadable catalogs, wrong keys)
//! abort the operation, while per-file problems during scans, backups and
//! restores are collected into the operation's report instead of surfacing here.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Fileson library
pub type Result<T> = std::result::Result<T, FilesonError>;

/// Main error type for all Fileson operations
#[derive(Debug, Error)]
pub enum FilesonError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A durable log does not parse as a record sequence
    #[error("Format error in {path:?} at line {line}: {message}")]
    Format {
        /// File being read
        path: PathBuf,
        /// 1-based line number of the offending record
        line: usize,
        /// What was wrong with it
        message: String,
    },

    /// A slice marker never occurs in the log
    #[error("Marker not found in log: {0}")]
    MarkerNotFound(String),

    /// `name~N` asked for more history than the catalog has
    #[error("Cannot go back {requested} scans, catalog only has {available}")]
    VersionNotAvailable {
        /// Number of scans requested back
        requested: u64,
        /// Scans recorded in the catalog
        available: u64,
    },

    /// The catalog was not scanned with the checksum an operation needs
    #[error("Catalog checksum is {found:?}, operation requires {expected}")]
    ChecksumRequired {
        /// Algorithm the operation needs
        expected: String,
        /// Algorithm recorded in the catalog
        found: Option<String>,
    },

    /// Seek pattern not supported by the crypto stream
    #[error("Unsupported seek: {0}")]
    UnsupportedSeek(String),

    /// Malformed key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Supplied key does not hash to the value recorded in the backup log
    #[error("Key hash mismatch - recorded: {recorded}, provided: {provided}")]
    KeyMismatch {
        /// Key hash stored in the backup log
        recorded: String,
        /// Hash of the key supplied for this run
        provided: String,
    },

    /// The backup log was written with a key but none was supplied
    #[error("Backup was encrypted, a key is required")]
    KeyRequired,

    /// No stored blob for a cataloged file
    #[error("No backup blob for {0}")]
    MissingBlob(String),

    /// A backup run stopped before every pending file was stored
    #[error("Transfer interrupted after {completed} files, {remaining} remaining: {reason}")]
    TransferInterrupted {
        /// Files durably recorded during this run
        completed: usize,
        /// Files still pending
        remaining: usize,
        /// Underlying cause
        reason: String,
    },

    /// Operation cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,

    /// Destination transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Object not present at the destination
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Unparseable or unavailable destination
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid skip pattern: {0}")]
    InvalidPattern(String),

    /// Timestamp parsing error
    #[error("Invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// Hex decoding error
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Config file parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FilesonError {
    /// Create a format error for a line of a durable log
    pub fn format(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        FilesonError::Format {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create a transport error with a custom message
    pub fn transport(msg: impl Into<String>) -> Self {
        FilesonError::Transport(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        FilesonError::Internal(msg.into())
    }

    /// Check if this error leaves durable state consistent and the operation restartable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FilesonError::Cancelled
                | FilesonError::TransferInterrupted { .. }
                | FilesonError::MissingBlob(_)
                | FilesonError::Transport(_)
        )
    }

    /// Check if this error must abort the whole operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FilesonError::Format { .. }
                | FilesonError::KeyMismatch { .. }
                | FilesonError::KeyRequired
                | FilesonError::ChecksumRequired { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            FilesonError::KeyMismatch { .. } => {
                "The key does not match the one this backup was made with. No files were touched."
                    .to_string()
            }
            FilesonError::KeyRequired => {
                "This backup is encrypted. Pass the key with --key (hex string or key file).".to_string()
            }
            FilesonError::ChecksumRequired { expected, .. } => {
                format!("Rescan the catalog with '-c {}' before running this command.", expected)
            }
            FilesonError::TransferInterrupted { remaining, .. } => {
                format!(
                    "Backup stopped with {} files pending. Completed files are recorded; run the backup again to resume.",
                    remaining
                )
            }
            FilesonError::Cancelled => "Cancelled. Restart later to continue where you left off.".to_string(),
            _ => self.to_string(),
        }
    }
}
