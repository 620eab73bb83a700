//! Helpers for testing the memoizing caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use a [`Gate`] to hold factories back until all concurrent lookups have been issued, and a
//!    [`CallCounter`] to observe how often a factory actually ran.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memoizer` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memoizer_service=trace,memoizer_stress=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A one-way barrier for asynchronous tasks.
///
/// Tasks calling [`wait`](Self::wait) are suspended until [`open`](Self::open) is called. Once
/// opened, the gate stays open. Clones share the same state.
#[derive(Clone, Debug)]
pub struct Gate {
    state: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        self.state.send_replace(true);
    }

    /// Returns whether the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this can not fail.
        let _ = state.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared counter of invocations.
#[derive(Clone, Debug, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call, returning the total number of calls including this one.
    pub fn increment(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The number of recorded calls.
    pub fn get(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
