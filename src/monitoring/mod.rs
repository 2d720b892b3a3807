//! Monitoring Module
//!
//! Provides observability for diffgat:
//! - Structured logging through `tracing`

pub mod logging;

pub use logging::{init, LogFormat, LogLevel, LoggerConfig};
