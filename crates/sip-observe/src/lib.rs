// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability hooks for SIP call forking.
//!
//! Logging and billing observers register a [`ForkObserver`] to learn how each
//! forked request ended and why each losing branch was cancelled.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{set_fork_observer, TracingForkObserver};
//! set_fork_observer(Arc::new(TracingForkObserver));
//! // Fork lifecycle events are now emitted via tracing
//! ```

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::Level;

/// Sink for fork lifecycle events.
///
/// `reason` and `outcome` are low-cardinality labels (e.g. "accepted_elsewhere",
/// "accepted"). `fork` and `destination` identify a single call and must not be
/// used as metric labels.
pub trait ForkObserver: Send + Sync + 'static {
    fn on_fork_started(&self, fork: &str, branches: usize);
    fn on_branch_cancelled(&self, fork: &str, destination: &str, reason: &str);
    fn on_cancel_failed(&self, fork: &str, destination: &str);
    fn on_outcome(&self, fork: &str, outcome: &str, code: u16);
    fn on_caller_cancel(&self, fork: &str);
}

#[derive(Debug, Default)]
struct NoopForkObserver;

impl ForkObserver for NoopForkObserver {
    fn on_fork_started(&self, _fork: &str, _branches: usize) {}
    fn on_branch_cancelled(&self, _fork: &str, _destination: &str, _reason: &str) {}
    fn on_cancel_failed(&self, _fork: &str, _destination: &str) {}
    fn on_outcome(&self, _fork: &str, _outcome: &str, _code: u16) {}
    fn on_caller_cancel(&self, _fork: &str) {}
}

static FORK_OBSERVER: OnceCell<Arc<dyn ForkObserver>> = OnceCell::new();
static NOOP_FORK_OBSERVER: NoopForkObserver = NoopForkObserver;

/// Installs the global fork observer.
///
/// Returns `true` if the observer was installed, or `false` if one was
/// already configured.
pub fn set_fork_observer(observer: Arc<dyn ForkObserver>) -> bool {
    FORK_OBSERVER.set(observer).is_ok()
}

/// Returns the currently configured fork observer.
pub fn fork_observer() -> &'static dyn ForkObserver {
    FORK_OBSERVER
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_FORK_OBSERVER)
}

/// Creates a tracing span covering all work done for one forked request.
pub fn span_with_fork(fork: &str, call_id: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "fork", fork = fork, call_id = call_id)
}

/// Observer that logs every event via `tracing`.
#[derive(Debug, Default)]
pub struct TracingForkObserver;

impl ForkObserver for TracingForkObserver {
    fn on_fork_started(&self, fork: &str, branches: usize) {
        tracing::debug!(fork, branches, "fork started");
    }

    fn on_branch_cancelled(&self, fork: &str, destination: &str, reason: &str) {
        tracing::info!(fork, destination, reason, "branch cancelled");
    }

    fn on_cancel_failed(&self, fork: &str, destination: &str) {
        tracing::warn!(fork, destination, "cancel delivery failed");
    }

    fn on_outcome(&self, fork: &str, outcome: &str, code: u16) {
        tracing::info!(fork, outcome, code, "fork outcome");
    }

    fn on_caller_cancel(&self, fork: &str) {
        tracing::info!(fork, "fork cancelled by caller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_observer_is_default() {
        // Must not panic before anything is installed.
        let observer = fork_observer();
        observer.on_fork_started("fork-1", 3);
        observer.on_outcome("fork-1", "accepted", 200);
    }

    #[test]
    fn observer_installs_once() {
        assert!(set_fork_observer(Arc::new(TracingForkObserver)));
        assert!(!set_fork_observer(Arc::new(TracingForkObserver)));
    }
}
