use thiserror::Error;

/// Failures raised by the windowing and scoring layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("detector has not been fit: call fit() before score()")]
    NotFitted,

    #[error("cannot fit on an empty feature table")]
    EmptyTable,

    #[error("need at least {required} windows to fit, got {got}")]
    InsufficientRows { required: usize, got: usize },

    #[error("row {row} is missing feature columns: {}", missing.join(", "))]
    SchemaMismatch { row: usize, missing: Vec<String> },

    #[error("row {row} column '{column}' is not a finite number: {value}")]
    InvalidColumn {
        row: usize,
        column: String,
        value: String,
    },

    #[error("feature table must be a JSON array of objects: {0}")]
    MalformedTable(String),

    #[error("contamination must be in (0, 0.5], got {0}")]
    InvalidContamination(f64),

    #[error("window size must be a positive number of seconds, got {0}")]
    InvalidWindowSize(f64),

    #[error("invalid analysis config: {0}")]
    InvalidConfig(String),

    #[error("forest needs at least one tree and one sample per tree")]
    InvalidEstimators,
}

pub type Result<T> = std::result::Result<T, Error>;
