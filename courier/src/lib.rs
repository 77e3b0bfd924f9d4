//! The courier daemon: configuration and the controller that wires the
//! delivery engine together.

pub mod config;
pub mod controller;

pub use config::Config;
pub use controller::Courier;
