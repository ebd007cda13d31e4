//! # tabflow - schema-aware tabular pipelines over CSV
//!
//! tabflow runs ordered chains of transformation steps over CSV sources that
//! range from a few rows to far more than fits in memory. Every step predicts
//! the schema it hands to the next one, so a whole chain is checked before a
//! single row moves.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tabflow::cancel::CancellationToken;
//! use tabflow::config::EngineConfig;
//! use tabflow::pipeline::PipelineBuilder;
//! use tabflow::registry::Registry;
//! use serde_json::json;
//!
//! # fn example() -> anyhow::Result<()> {
//! let registry = Registry::with_builtins();
//! let pipeline = PipelineBuilder::new(&registry, "sales.csv")
//!     .config(EngineConfig::default().with_env_overrides()?)
//!     .step_json("filter", json!({
//!         "predicate": {"binary": {"op": "gt", "left": {"column": "amount"}, "right": {"literal": 1000}}}
//!     }))
//!     .step_json("group_by", json!({
//!         "by": ["store"],
//!         "aggregations": [{"column": "amount", "function": "sum"}]
//!     }))
//!     .build()?;
//!
//! println!("output columns: {}", pipeline.output_schema());
//! let table = pipeline.execute(&CancellationToken::new())?.collect()?;
//! println!("{} stores", table.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Modules
//!
//! - [`schema`]: column names and declared types
//! - [`source`]: header reads, previews and chunk iteration over CSV files
//! - [`engine`]: out-of-core execution of translated queries
//! - [`operation`]: the step contract and every built-in step
//! - [`registry`]: name to factory table with parameter schemas
//! - [`pipeline`]: build, validate, persist and run step chains
//! - [`fanout`]: crash-safe partitioning of rows into per-key files
//! - [`assistant`]: contract for natural-language step translators
//!
//! ## Backends
//!
//! Small sources run in memory. Large ones run out-of-core when every step
//! has a query form and chunk by chunk otherwise. Both produce the same rows
//! in the same column order.

#![warn(clippy::all, rust_2018_idioms)]

pub mod assistant;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod fanout;
pub mod logging;
pub mod lookup;
pub mod operation;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod source;
pub mod table;
