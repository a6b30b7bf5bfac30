//! Shared test utilities for sieve integration tests.
//!
//! This crate provides:
//! - [`TracingRecordStore`]: in-memory record store with call recording and fault injection
//! - [`TracingMemoryBackend`]: in-memory blob storage with call recording and fault injection
//! - [`TestContext`]: stores and configuration wired into queued or local pipelines
//! - Deterministic input factories and invariant assertions
//!
//! # Example
//!
//! ```rust,ignore
//! use sieve_test_utils::{run_queue, TestContext};
//!
//! #[tokio::test]
//! async fn filters_two_inputs() {
//!     let ctx = TestContext::new();
//!     ctx.seed_chunked("inputs/a", 10, 4).await;
//!     let (pipeline, queue) = ctx.queued_pipeline();
//!     // ... submit, then run_queue(&pipeline, &queue).await ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod records;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use records::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sieve=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
