//! Monitoring for FluxSync
//!
//! This module provides:
//! - Per-node health probing with up/down tracking
//! - The cluster status HTTP endpoint
//! - Structured logging with tracing

pub mod health;
pub mod logging;
pub mod node;

pub use health::*;
pub use logging::*;
pub use node::*;
