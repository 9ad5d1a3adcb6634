//! Helpers for testing strata services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`strata_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     strata_test::setup();
//!
//!     strata_log::debug!("hello, world!");
//! }
//! ```

use strata_system::{Addr, Interface, channel};
use tokio::task::JoinHandle;

/// Capacity of channels created by [`mock_service`].
const MOCK_CAPACITY: usize = 1024;

/// Setup the test environment.
///
///  - Initializes logs: The logger captures logs from all strata crates and mutes all other logs.
pub fn setup() {
    strata_log::__init_test("strata");
}

/// Spawns a mock service that handles messages through a closure.
///
/// The returned handle resolves to the final state once all addresses have been dropped.
pub fn mock_service<S, I, F>(name: &'static str, mut state: S, mut f: F) -> (Addr<I>, JoinHandle<S>)
where
    S: Send + 'static,
    I: Interface,
    F: FnMut(&mut S, I) + Send + 'static,
{
    let (addr, mut rx) = channel(name, MOCK_CAPACITY);

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            f(&mut state, msg);
        }

        state
    });

    (addr, handle)
}
