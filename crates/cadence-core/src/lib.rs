//! # Cadence Core
//!
//! Shared foundation for the Cadence engine: configuration loading and the
//! crate-wide error taxonomy. Kept dependency-light so every other crate in
//! the workspace can build on it.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, CoalescerConfig, SchedulerConfig, StoreConfig};
pub use error::{CadenceError, Result};
