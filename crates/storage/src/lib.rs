//! Storage Layer
//!
//! Scoped temporary files holding uploaded videos for the lifetime of one
//! analysis session.

mod temp;

pub use temp::{TempStore, TempStoreConfig, TempVideo};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload is empty")]
    EmptyUpload,
    #[error("Failed to create temp file: {0}")]
    Create(String),
    #[error("Failed to write temp file: {0}")]
    Write(String),
    #[error("Failed to remove temp file: {0}")]
    Release(String),
}
