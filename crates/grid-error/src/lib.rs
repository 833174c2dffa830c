#![forbid(unsafe_code)]
//! Error types for the grid repair stack.
//!
//! Defines `GridError` and a `Result<T>` alias used throughout the
//! workspace.

use grid_types::ParseError;
use thiserror::Error;

/// Unified error type for all grid operations.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt block at address {address}: {detail}")]
    Corruption { address: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Parse(#[from] ParseError),

    #[error("block not found: {0}")]
    NotFound(u64),

    #[error("no space left in grid")]
    NoSpace,

    #[error("out of memory reserving initial capacity")]
    OutOfMemory,
}

/// Result alias using `GridError`.
pub type Result<T> = std::result::Result<T, GridError>;
