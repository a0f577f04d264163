//! Error types for the tracker store

use thiserror::Error;

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Database query or connection error
    #[error("Tracker database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Could not reach the tracker database even after backing off
    #[error("Could not establish connection with the tracker database after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    /// A required enumeration row is missing from the seeded data
    #[error("Inconsistent tracker state: no {table} row named '{short_name}'")]
    MissingSeed {
        table: &'static str,
        short_name: String,
    },

    /// A row that must exist was not found
    #[error("No {entity} row with id {id}")]
    RowMissing { entity: &'static str, id: i64 },

    /// The supplied filename pattern does not compile
    #[error("Invalid filename pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl TrackerError {
    pub fn missing_seed(table: &'static str, short_name: impl Into<String>) -> Self {
        Self::MissingSeed {
            table,
            short_name: short_name.into(),
        }
    }
}
