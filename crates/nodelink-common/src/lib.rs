//! Nodelink Common Library
//!
//! Shared error handling and logging for the nodelink workspace.
//!
//! # Overview
//!
//! This crate provides functionality used across all nodelink workspace
//! members:
//!
//! - **Error Handling**: the pipeline-wide error taxonomy and result type
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//!
//! # Example
//!
//! ```no_run
//! use nodelink_common::{Result, EtlError};
//!
//! fn check_batch_size(size: usize) -> Result<()> {
//!     if size == 0 {
//!         return Err(EtlError::Config("batch size must be non-zero".into()));
//!     }
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EtlError, Result};
