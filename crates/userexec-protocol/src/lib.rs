//! Virtual table contract types.
//!
//! These types describe the boundary between a userexec table and the query
//! engine that evaluates it:
//!
//! - [`ColumnDefinition`]: the fixed schema a table advertises
//! - [`QueryContext`]: the column-scoped predicates a query supplies
//! - [`Row`]: one generated result row
//!
//! The crate carries no runtime; it only defines data and the JSON wire form
//! the query engine uses to hand over its constraints.

pub mod columns;
pub mod query;

use std::collections::BTreeMap;

pub use columns::{ColumnDefinition, ColumnType};
pub use query::{Constraint, ConstraintList, Operator, ProtocolError, QueryContext};

/// A generated row: column name to string value.
pub type Row = BTreeMap<String, String>;
