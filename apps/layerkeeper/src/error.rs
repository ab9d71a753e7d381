//! # Application Errors
//!
//! The binary's error type: every core [`StoreError`] plus the failures
//! only the outer surfaces can produce.

use layerkeeper_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Input(String),
}
