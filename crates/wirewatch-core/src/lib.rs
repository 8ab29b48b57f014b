pub mod error;
pub mod models;
pub mod table;
pub mod ingest;
pub mod window;
pub mod scaler;
pub mod forest;
pub mod detector;
pub mod config;
pub mod report;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
