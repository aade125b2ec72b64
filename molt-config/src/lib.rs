//! Configuration types and hierarchical loading for the molt migration
//! engine.

pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config};
