//! Shared utilities.

/// Millisecond clock helpers.
pub mod clock;
/// Tracing/telemetry initialization.
pub mod telemetry;

pub use clock::now_ms;
pub use telemetry::init_tracing;
