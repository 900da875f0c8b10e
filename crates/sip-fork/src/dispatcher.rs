// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CANCEL dispatch per RFC 3261 §16.10.
//!
//! A stateful proxy cancels only branches it forwarded the INVITE to and
//! that have not yet produced a final response. The reason travels with each
//! CANCEL so the callee can tell a call answered elsewhere from a caller
//! hang-up.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::branch::{BranchId, BranchState};
use crate::context::ForkContext;
use crate::metrics::ForkMetrics;
use crate::reason::CancelReason;
use crate::transport::{BranchTarget, BranchTransport};

/// Whether a branch in `state` still needs a termination signal.
pub fn should_cancel(state: BranchState) -> bool {
    match state {
        // Request sent but no final response yet
        BranchState::Trying | BranchState::Proceeding => true,
        BranchState::Completed | BranchState::Terminated => false,
    }
}

/// What a dispatch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Branches cancelled, in priority order
    pub cancelled: Vec<BranchId>,
    /// Subset of `cancelled` whose signal could not be delivered
    pub failed: Vec<BranchId>,
}

/// Sends termination signals to the still-active branches of a fork.
#[derive(Clone)]
pub struct CancelDispatcher {
    transport: Arc<dyn BranchTransport>,
    metrics: ForkMetrics,
}

impl CancelDispatcher {
    pub fn new(transport: Arc<dyn BranchTransport>, metrics: ForkMetrics) -> Self {
        Self { transport, metrics }
    }

    /// Cancels every active branch of `context` with `reason`.
    ///
    /// Each branch is moved to `Terminated` before its signal is sent, so a
    /// delivery failure leaves it terminated locally and is only logged.
    pub async fn dispatch(&self, context: &mut ForkContext, reason: CancelReason) -> DispatchReport {
        let fork = context.key().clone();
        let call_id = context.call_id().clone();

        let targets: Vec<BranchTarget> = context
            .branches_mut()
            .iter_mut()
            .filter(|branch| should_cancel(branch.state()))
            .filter_map(|branch| {
                if branch.cancel(reason) {
                    Some(BranchTarget::new(fork.clone(), call_id.clone(), branch))
                } else {
                    None
                }
            })
            .collect();

        let mut report = DispatchReport::default();
        for target in targets {
            debug!(
                fork = %fork,
                branch = %target.branch,
                uri = %target.destination.uri,
                %reason,
                "sending CANCEL"
            );
            self.metrics.record_cancel(reason);
            report.cancelled.push(target.branch);

            match self.transport.send_cancel(&target, reason).await {
                Ok(()) => {
                    sip_observe::fork_observer().on_branch_cancelled(
                        fork.as_str(),
                        target.destination.uri.as_str(),
                        reason.as_str(),
                    );
                }
                Err(e) => {
                    warn!(
                        fork = %fork,
                        branch = %target.branch,
                        uri = %target.destination.uri,
                        error = %e,
                        "CANCEL not delivered; branch terminated locally"
                    );
                    self.metrics.record_cancel_failure();
                    sip_observe::fork_observer()
                        .on_cancel_failed(fork.as_str(), target.destination.uri.as_str());
                    report.failed.push(target.branch);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Destination;
    use crate::config::ForkConfig;
    use crate::status::ForkResponse;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        cancels: Mutex<Vec<(BranchId, CancelReason)>>,
        fail_for: Option<BranchId>,
    }

    #[async_trait]
    impl BranchTransport for RecordingTransport {
        async fn send_request(&self, _target: &BranchTarget) -> Result<()> {
            Ok(())
        }

        async fn send_cancel(&self, target: &BranchTarget, reason: CancelReason) -> Result<()> {
            self.cancels.lock().push((target.branch, reason));
            if self.fail_for == Some(target.branch) {
                return Err(anyhow!("connection refused"));
            }
            Ok(())
        }
    }

    fn context(n: usize) -> ForkContext {
        let destinations = (0..n)
            .map(|i| Destination::new(format!("sip:bob@10.0.0.{}", i)))
            .collect();
        ForkContext::new("fork", "call", destinations, &ForkConfig::default()).0
    }

    #[test]
    fn cancels_only_unfinished_branches() {
        assert!(should_cancel(BranchState::Trying));
        assert!(should_cancel(BranchState::Proceeding));
        assert!(!should_cancel(BranchState::Completed));
        assert!(!should_cancel(BranchState::Terminated));
    }

    #[tokio::test]
    async fn dispatches_in_priority_order_skipping_completed() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = CancelDispatcher::new(transport.clone(), ForkMetrics::new());
        let mut ctx = context(4);
        ctx.on_response(BranchId(1), ForkResponse::from_code(486).unwrap());
        ctx.on_response(BranchId(3), ForkResponse::from_code(180).unwrap());

        let report = dispatcher
            .dispatch(&mut ctx, CancelReason::AcceptedElsewhere)
            .await;

        assert_eq!(report.cancelled, vec![BranchId(0), BranchId(2), BranchId(3)]);
        assert!(report.failed.is_empty());
        assert_eq!(
            *transport.cancels.lock(),
            vec![
                (BranchId(0), CancelReason::AcceptedElsewhere),
                (BranchId(2), CancelReason::AcceptedElsewhere),
                (BranchId(3), CancelReason::AcceptedElsewhere),
            ]
        );
        assert_eq!(ctx.branch(BranchId(1)).unwrap().state(), BranchState::Completed);
    }

    #[tokio::test]
    async fn delivery_failure_still_terminates_branch() {
        let transport = Arc::new(RecordingTransport {
            fail_for: Some(BranchId(0)),
            ..Default::default()
        });
        let metrics = ForkMetrics::new();
        let dispatcher = CancelDispatcher::new(transport.clone(), metrics.clone());
        let mut ctx = context(2);

        let report = dispatcher.dispatch(&mut ctx, CancelReason::Standard).await;

        assert_eq!(report.failed, vec![BranchId(0)]);
        assert_eq!(report.cancelled.len(), 2);
        for branch in ctx.branches() {
            assert_eq!(branch.state(), BranchState::Terminated);
            assert_eq!(branch.cancel_reason(), Some(CancelReason::Standard));
        }
        assert_eq!(metrics.snapshot().cancel_failures, 1);
    }

    #[tokio::test]
    async fn second_dispatch_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = CancelDispatcher::new(transport.clone(), ForkMetrics::new());
        let mut ctx = context(2);

        dispatcher.dispatch(&mut ctx, CancelReason::DeclinedElsewhere).await;
        let report = dispatcher.dispatch(&mut ctx, CancelReason::Standard).await;

        assert!(report.cancelled.is_empty());
        assert_eq!(transport.cancels.lock().len(), 2);
        assert_eq!(
            ctx.branch(BranchId(0)).unwrap().cancel_reason(),
            Some(CancelReason::DeclinedElsewhere)
        );
    }
}
