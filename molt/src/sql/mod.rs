//! SQL text construction and value handling.
//!
//! Everything here is pure: builders take schema metadata and values and
//! return statement text plus bind parameters, so the exact SQL the engine
//! issues is unit-testable without a server.

pub mod builder;
pub mod hints;
pub mod parser;
pub mod value;

pub use builder::*;
pub use hints::OptimizerHints;
pub use value::ColumnValue;
