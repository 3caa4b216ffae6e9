// src/error.rs

use thiserror::Error;

/// Core error types for pkgsync
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error with context about what was being done
    #[error("I/O error: {0}")]
    IoError(String),

    /// A catalog entry that lacks a required field or has an unparseable date
    #[error("Malformed catalog entry: {0}")]
    MalformedEntry(String),

    /// Every mirror attempt failed
    #[error("Catalog unavailable after {attempts} attempt(s): {last_error}")]
    CatalogUnavailable { attempts: u32, last_error: String },

    /// Cache file exists but cannot be used
    #[error("Catalog cache corrupt: {0}")]
    CacheCorrupt(String),

    /// Network transfer failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Document or timestamp could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Settings file could not be read or written
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Another command holds the command gate
    #[error("Another command is already executing")]
    Busy,

    /// Component could not be constructed
    #[error("Initialization error: {0}")]
    InitError(String),
}

/// Result type alias using pkgsync's Error type
pub type Result<T> = std::result::Result<T, Error>;
