//! Shared test harness: tracing subscriber setup.
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ...
//! }
//! ```
//!
//! Honors `RUST_LOG` (e.g. `RUST_LOG=thmap=trace`); defaults to `info`.
//! Only has visible effect when the crate is built with `--features
//! tracing`, but is always safe to call.

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the console subscriber once per test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .try_init();

        tracing::debug!("test tracing initialized");
    });
}
