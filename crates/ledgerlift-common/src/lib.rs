//! Ledgerlift Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the ledgerlift workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LiftError`] and the [`Result`] alias used for
//!   configuration loading and report persistence
//! - **Logging**: tracing subscriber setup shared by the CLI and test harnesses
//!
//! # Example
//!
//! ```no_run
//! use ledgerlift_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     info!("migration starting");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{LiftError, Result};
