//! Shared model, errors and logging for the courier crates.

pub mod error;
pub mod logging;
pub mod model;

pub use tracing;
