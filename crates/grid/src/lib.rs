#![forbid(unsafe_code)]
//! Public API facade for the grid repair stack.
//!
//! Re-exports the block format, free-set, and repair-queue crates through a
//! single external interface. This is the crate downstream consumers (the
//! replica, harnesses, tools) depend on.

pub use grid_block::*;
pub use grid_error::*;
pub use grid_freeset::*;
pub use grid_repair::*;
pub use grid_types::*;
