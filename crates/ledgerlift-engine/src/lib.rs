//! Ledgerlift migration engine
//!
//! Moves business records (customers, orders, line items, invoices) from a
//! document store into a relational store with enforced foreign keys.
//!
//! # Components
//!
//! - [`normalize`]: canonical timestamps, decimals and enums
//! - [`identity`]: multi-strategy resolution of cross-store identities
//! - [`writer`]: bounded, constraint-aware batch inserts with retry
//! - [`report`]: per-table counters and the persisted run report
//! - [`cleanup`]: cascading, order-aware rollback
//! - [`pipeline`]: one run wiring all of the above together
//!
//! The document store and the relational store are reached through the
//! [`source::SourceStore`] and [`target::TargetStore`] traits.
//!
//! # Example
//!
//! ```no_run
//! use ledgerlift_engine::config::MigrationConfig;
//! use ledgerlift_engine::pipeline::MigrationRun;
//! use ledgerlift_engine::source::JsonExportSource;
//! use ledgerlift_engine::target::MemoryStore;
//!
//! # async fn example() -> ledgerlift_engine::Result<()> {
//! let config = MigrationConfig {
//!     tenant_id: "87dcc6db-2e24-46fb-9a12-7886f690a326".to_string(),
//!     ..MigrationConfig::default()
//! };
//! let graph = config.validate()?;
//! let source = JsonExportSource::open("./export", &config.child_types_of("sales_orders")).await?;
//! let target = MemoryStore::new(graph);
//!
//! let outcome = MigrationRun::new(&config, &source, &target)?.run().await?;
//! println!("{}", outcome.report.to_json().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod config;
pub mod error;
pub mod graph;
pub mod identity;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod source;
pub mod target;
pub mod writer;

pub use error::{EngineError, Result, SourceError, TargetError};
