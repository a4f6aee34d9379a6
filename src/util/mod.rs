//! Shared utilities
//!
//! Currently just the structured logging setup; anything useful to more
//! than one module lands here.

pub mod logging;

pub use logging::{init_default, init_from_env, init_logging, LoggingConfig};
