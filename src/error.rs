//! Crate-wide error type.
//!
//! Errors fall into four kinds (see [`ErrorKind`]):
//!   - configuration errors are detected before any dataset is created;
//!   - I/O errors abort the whole export, nothing is repaired or resumed;
//!   - defects are programming errors (out-of-bounds reads, buffer length
//!     mismatches, array metadata the store rejects) and are never retried;
//!   - cancellation is reported when the caller's token was triggered.

use std::io;
use thiserror::Error;

use zarrs::array::{ArrayCreateError, ArrayError};
use zarrs::storage::StorageError;

use crate::codec::CodecError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Coarse classification of an [`ExportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Io,
    Defect,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unsupported pixel type: {0}")]
    UnsupportedPixelType(String),

    #[error("The {layout} layout does not support {compression} compression")]
    UnsupportedCompression {
        layout:      &'static str,
        compression: &'static str,
    },

    #[error("Source read out of bounds: min {min:?} size {size:?} exceeds dimensions {dimensions:?}")]
    OutOfBounds {
        min:        Vec<u64>,
        size:       Vec<u64>,
        dimensions: Vec<u64>,
    },

    #[error("Defect: {0}")]
    Defect(String),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Array error: {0}")]
    Array(#[from] ArrayError),

    #[error("Array metadata rejected: {0}")]
    ArrayCreate(#[from] ArrayCreateError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ExportError {
    pub fn config(message: impl Into<String>) -> Self {
        ExportError::Config(message.into())
    }

    pub fn defect(message: impl Into<String>) -> Self {
        ExportError::Defect(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Config(_)
            | ExportError::UnsupportedPixelType(_)
            | ExportError::UnsupportedCompression { .. } => ErrorKind::Configuration,
            ExportError::OutOfBounds { .. }
            | ExportError::Defect(_)
            | ExportError::ArrayCreate(_) => ErrorKind::Defect,
            ExportError::Cancelled => ErrorKind::Cancelled,
            ExportError::WorkerPool(_)
            | ExportError::Codec(_)
            | ExportError::Metadata(_)
            | ExportError::Storage(_)
            | ExportError::Array(_)
            | ExportError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_classified() {
        assert_eq!(ExportError::config("no levels").kind(), ErrorKind::Configuration);
        assert_eq!(
            ExportError::UnsupportedCompression { layout: "ome-zarr", compression: "xz" }.kind(),
            ErrorKind::Configuration,
        );
        assert_eq!(ExportError::defect("bad buffer").kind(), ErrorKind::Defect);
        assert_eq!(ExportError::Cancelled.kind(), ErrorKind::Cancelled);
        let io = ExportError::from(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(!io.is_config());
    }

    #[test]
    fn out_of_bounds_message_lists_geometry() {
        let e = ExportError::OutOfBounds {
            min:        vec![0, 0, 60],
            size:       vec![8, 8, 8],
            dimensions: vec![64, 64, 64],
        };
        let msg = e.to_string();
        assert!(msg.contains("[0, 0, 60]"));
        assert!(msg.contains("[64, 64, 64]"));
    }
}
