//! Error types for the rbydfs storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum/parity mismatch or a block the device refused to write.
    #[error("Data corruption: {0}")]
    Corrupt(String),

    /// No room left in the current block; drives compaction and splits.
    #[error("No space left in block")]
    Range,

    #[error("Not found")]
    NotFound,

    #[error("No space left on device: {0}")]
    NoSpace(String),

    #[error("Entry already exists")]
    Exists,

    #[error("Not a directory")]
    NotDir,

    #[error("Is a directory")]
    IsDir,

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Name too long")]
    NameTooLong,

    #[error("File too large")]
    FileTooLarge,

    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FsError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        FsError::Corrupt(msg.into())
    }

    /// Errors an upper layer recovers from by picking another block.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, FsError::Corrupt(_))
    }

    pub fn is_range(&self) -> bool {
        matches!(self, FsError::Range)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound)
    }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::Serialization(err.to_string())
    }
}
