//! Out-of-core execution.
//!
//! Operations describe their out-of-core form as plain [`QueryFragment`]
//! data; [`OutOfCoreEngine`] is the single place that turns a [`Query`] into
//! calls on a concrete query engine (polars lazy frames). Nothing outside this
//! module touches polars types.

mod out_of_core;
mod query;

pub use out_of_core::OutOfCoreEngine;
pub use query::{Aggregation, CastColumn, JoinKind, Query, QueryFragment};
