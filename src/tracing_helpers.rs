//! Zero-cost tracing shims.
//!
//! With the `tracing` feature enabled these macros forward to the `tracing`
//! crate; without it (the default) they expand to nothing, so the hot
//! writer paths carry no logging overhead.
//!
//! ```bash
//! # Instrumented test run
//! RUST_LOG=thmap=trace cargo test --features tracing
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level logging (per-operation detail: retries, expansion steps).
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level logging (structural events: collapse, gc drains).
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
