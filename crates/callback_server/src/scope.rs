// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test diagnostics.

use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{error, info, warn, Span};

/// The test a piece of interception machinery is working on behalf of.
///
/// Failures come in two strengths, mirroring how the harness treats them:
/// [`fatal`](Self::fatal) stops the test on the spot, while [`error`](Self::error)
/// is recorded and only fails the test once the scope is dropped. Errors recorded
/// from server threads (e.g. an undecodable webhook payload) use the latter, since
/// panicking there would only kill a connection task.
///
/// Messages are logged inside the span that was current when the scope was created,
/// so lines logged from server threads still show up under the owning test.
#[derive(Debug)]
pub struct TestScope {
    name: String,
    owner: ThreadId,
    span: Span,
    failures: Mutex<Vec<String>>,
}

impl TestScope {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            owner: thread::current().id(),
            span: Span::current(),
            failures: Mutex::default(),
        })
    }

    /// Scope named after the current thread, which the test harness names after the
    /// running test.
    pub fn current() -> Arc<Self> {
        let name = thread::current()
            .name()
            .unwrap_or("unnamed test")
            .to_owned();
        Self::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, msg: impl Display) {
        self.span.in_scope(|| info!(test = %self.name, "{msg}"));
    }

    /// Record a failure without stopping the test.
    pub fn error(&self, msg: impl Display) {
        let msg = msg.to_string();
        self.span.in_scope(|| error!(test = %self.name, "{msg}"));
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg);
    }

    /// Fail the test immediately.
    pub fn fatal(&self, msg: impl Display) -> ! {
        self.span
            .in_scope(|| error!(test = %self.name, "FATAL: {msg}"));
        panic!("{}: {msg}", self.name);
    }

    /// Failures recorded so far via [`error`](Self::error).
    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the recorded failures, for tests that expect them.
    pub fn take_failures(&self) -> Vec<String> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for TestScope {
    fn drop(&mut self) {
        let failures = self
            .failures
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if failures.is_empty() {
            return;
        }
        if thread::current().id() == self.owner && !thread::panicking() {
            panic!("{} recorded failures: {failures:?}", self.name);
        }
        self.span.in_scope(|| {
            error!(test = %self.name, "failures recorded after the test finished: {failures:?}")
        });
    }
}

/// Remembers which test owns the most recently opened callback server.
///
/// Opening a server while another is still open almost always means an earlier test
/// forgot to close its server. That is worth a warning but doesn't break anything,
/// since every server listens on its own port.
#[derive(Clone, Debug, Default)]
pub struct ServerTracker {
    open: Arc<Mutex<Option<String>>>,
}

impl ServerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn opened(&self, scope: &TestScope) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = open.as_deref() {
            warn!(
                "WARNING[{}]: callback server opened without closing the last one. Check test '{previous}'",
                scope.name()
            );
        }
        *open = Some(scope.name().to_owned());
    }

    pub(crate) fn closed(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Test that owns the currently open server, if any.
    pub fn open_server_owner(&self) -> Option<String> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn errors_are_recorded_and_reported_on_drop() {
        let scope = TestScope::new("reports");
        scope.error("first");
        scope.error(format_args!("second {}", 2));
        assert_eq!(scope.failures(), vec!["first", "second 2"]);

        let dropped = catch_unwind(AssertUnwindSafe(move || drop(scope)));
        assert!(dropped.is_err());
    }

    #[test]
    fn clean_scopes_drop_quietly() {
        let scope = TestScope::new("clean");
        scope.log("nothing to see");
        drop(scope);
    }

    #[test]
    fn errors_from_other_threads_do_not_panic_them() {
        let scope = TestScope::new("threads");
        let remote = scope.clone();
        thread::spawn(move || remote.error("from a server thread"))
            .join()
            .unwrap();
        assert_eq!(scope.failures().len(), 1);
        // Dropped on another thread, the failure is only logged.
        thread::spawn(move || drop(scope)).join().unwrap();
    }

    #[test]
    #[should_panic(expected = "fatal: gone")]
    fn fatal_panics_with_the_test_name() {
        TestScope::new("fatal").fatal("gone");
    }

    #[test]
    fn tracker_remembers_the_open_server() {
        let tracker = ServerTracker::new();
        let first = TestScope::new("first");
        let second = TestScope::new("second");

        tracker.opened(&first);
        assert_eq!(tracker.open_server_owner().as_deref(), Some("first"));
        // A leaked server only warns.
        tracker.opened(&second);
        assert_eq!(tracker.open_server_owner().as_deref(), Some("second"));
        tracker.closed();
        assert_eq!(tracker.open_server_owner(), None);
    }
}
