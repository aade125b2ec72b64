mod cutover;
mod migration;
mod serve;
mod throttle;

pub use cutover::{CutOverConfig, CutOverKind};
pub use migration::{MigrationConfig, MigratorConfig};
pub use serve::ServeConfig;
pub use throttle::ThrottleConfig;

use thiserror::Error;

/// Validation failure for a configuration field.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },

    #[error("missing required field `{field}`")]
    MissingField { field: String },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.into(),
            constraint: constraint.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }
}
