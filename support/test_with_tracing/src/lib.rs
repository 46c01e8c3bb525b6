// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crate for defining tests that have tracing output.
//!
//! Use `#[test_with_tracing::test]` in place of `#[test]`. Output is captured
//! by the test harness and shown for failing tests. The filter is read from
//! `VHOST_USER_FS_LOG`, falling back to `RUST_LOG`, and defaults to `debug`.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::EnvFilter;

const FILTER_VARS: [&str; 2] = ["VHOST_USER_FS_LOG", "RUST_LOG"];

fn filter() -> EnvFilter {
    FILTER_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::DEBUG.into()))
}

#[doc(hidden)]
/// Initializes `tracing` for tests.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        // Another harness may already have installed a global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // avoid polluting logs with escape sequences
            .log_internal_errors(true)
            .with_test_writer()
            .with_env_filter(filter())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::test;

    #[test]
    fn test_it() {
        tracing::info!("should show tracing output");
    }

    #[test]
    fn test_with_return() -> Result<(), Box<dyn std::error::Error>> {
        tracing::debug!(value = 1, "ok");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_should_panic_passes_through() {
        panic!("boom");
    }
}
