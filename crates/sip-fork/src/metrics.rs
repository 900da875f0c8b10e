// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fork counters.
//!
//! [`ForkManager`](crate::ForkManager) records into a [`ForkMetrics`] for
//! every fork it drives; take a [`ForkMetricsSnapshot`] at any time:
//!
//! ```
//! use sip_fork::metrics::ForkMetrics;
//! use sip_fork::{CancelReason, OutcomeKind};
//!
//! let metrics = ForkMetrics::new();
//! metrics.record_fork_started(3);
//! metrics.record_cancel(CancelReason::AcceptedElsewhere);
//! metrics.record_outcome(OutcomeKind::Accepted);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.branches_created, 3);
//! assert_eq!(snapshot.cancels.get(&CancelReason::AcceptedElsewhere), Some(&1));
//! ```
//!
//! All operations take a `parking_lot::RwLock`; the type is `Clone` and
//! shares its storage across clones.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::OutcomeKind;
use crate::reason::CancelReason;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone)]
pub struct ForkMetricsSnapshot {
    pub forks_started: u64,
    pub branches_created: u64,
    pub outcomes: HashMap<OutcomeKind, u64>,
    /// Termination signals issued, by reason
    pub cancels: HashMap<CancelReason, u64>,
    /// Termination signals the transport failed to deliver
    pub cancel_failures: u64,
    pub caller_cancels: u64,
    pub branch_timeouts: u64,
    pub unreachable_branches: u64,
    /// Events dropped because their branch or fork had already finished
    pub ignored_events: u64,
    pub timestamp: Instant,
}

#[derive(Debug, Default)]
struct MetricsData {
    forks_started: u64,
    branches_created: u64,
    outcomes: HashMap<OutcomeKind, u64>,
    cancels: HashMap<CancelReason, u64>,
    cancel_failures: u64,
    caller_cancels: u64,
    branch_timeouts: u64,
    unreachable_branches: u64,
    ignored_events: u64,
}

/// Thread-safe fork counter set.
#[derive(Debug, Clone, Default)]
pub struct ForkMetrics {
    data: Arc<RwLock<MetricsData>>,
}

impl ForkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fork_started(&self, branches: usize) {
        let mut data = self.data.write();
        data.forks_started += 1;
        data.branches_created += branches as u64;
    }

    pub fn record_outcome(&self, kind: OutcomeKind) {
        *self.data.write().outcomes.entry(kind).or_insert(0) += 1;
    }

    pub fn record_cancel(&self, reason: CancelReason) {
        *self.data.write().cancels.entry(reason).or_insert(0) += 1;
    }

    pub fn record_cancel_failure(&self) {
        self.data.write().cancel_failures += 1;
    }

    pub fn record_caller_cancel(&self) {
        self.data.write().caller_cancels += 1;
    }

    pub fn record_branch_timeout(&self) {
        self.data.write().branch_timeouts += 1;
    }

    pub fn record_unreachable(&self) {
        self.data.write().unreachable_branches += 1;
    }

    pub fn record_ignored_event(&self) {
        self.data.write().ignored_events += 1;
    }

    pub fn snapshot(&self) -> ForkMetricsSnapshot {
        let data = self.data.read();
        ForkMetricsSnapshot {
            forks_started: data.forks_started,
            branches_created: data.branches_created,
            outcomes: data.outcomes.clone(),
            cancels: data.cancels.clone(),
            cancel_failures: data.cancel_failures,
            caller_cancels: data.caller_cancels,
            branch_timeouts: data.branch_timeouts,
            unreachable_branches: data.unreachable_branches,
            ignored_events: data.ignored_events,
            timestamp: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = ForkMetrics::new();
        let clone = metrics.clone();

        clone.record_outcome(OutcomeKind::Exhausted);
        clone.record_outcome(OutcomeKind::Exhausted);
        metrics.record_ignored_event();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.outcomes.get(&OutcomeKind::Exhausted), Some(&2));
        assert_eq!(snapshot.ignored_events, 1);
    }
}
