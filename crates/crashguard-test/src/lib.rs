//! Shared helpers for the crash handler's integration tests.
//!
//! The handler writes its report and minidump next to the image it was loaded from. Tests point
//! the fake image into a fresh [`tempdir`] so that every test gets its own artifact directory,
//! and read the report back with [`read_artifact`].
//!
//! Call [`setup`] first in each test, so the handler's `tracing` output shows up next to the
//! failing assertion instead of on the terminal.

use std::path::Path;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Routes `crashguard` logs at trace level into the test harness' captured output.
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("crashguard=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// An empty directory to place a fake crash handler image in.
///
/// Hold on to the returned guard until the handler has written its artifacts. The directory and
/// everything in it is removed when the guard is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Reads a text artifact written by the handler.
///
/// # Panics
///
/// Panics if the file does not exist or is not valid UTF-8.
#[track_caller]
pub fn read_artifact(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read '{}': {e}", path.display()))
}
