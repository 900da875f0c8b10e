// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fork context: the state of one forked request.
//!
//! ```text
//! Incoming INVITE → ForkContext → [Branch 0] [Branch 1] [Branch 2]
//!                        ↑              │          │          │
//!                        └── responses / timeouts / unreachable
//!                        │
//!                  aggregator::evaluate
//!                        │ outcome
//!                        ↓
//!           Active ──► Terminated ──► ForkActions { cancel, outcome }
//! ```
//!
//! The context is a synchronous state machine. It decides, and reports what
//! must happen next as [`ForkActions`]; [`ForkManager`](crate::ForkManager)
//! performs the I/O while holding the context's lock so that all transitions
//! of one fork are serialized.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use smol_str::SmolStr;
use tracing::{debug, info, warn};

use crate::aggregator::{self, Outcome};
use crate::branch::{Branch, BranchId, Delivery, Destination};
use crate::config::ForkConfig;
use crate::generate_branch_id;
use crate::reason::CancelReason;
use crate::status::{ForkResponse, REQUEST_TIMEOUT};
use crate::transport::BranchTarget;

/// Lifecycle of a fork. The only transition is `Active → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkState {
    Active,
    Terminated,
}

/// Work the owner of a context must carry out after an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkActions {
    /// Provisional response to relay upstream
    pub relay: Option<ForkResponse>,
    /// Cancel every still-active branch with this reason
    pub cancel: Option<CancelReason>,
    /// Outcome whose response must be emitted upstream
    pub outcome: Option<Outcome>,
    /// The event was dropped because its branch or the fork had already finished
    pub late: bool,
}

impl ForkActions {
    fn late() -> Self {
        Self {
            late: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relay.is_none() && self.cancel.is_none() && self.outcome.is_none()
    }
}

/// State for a single forked request.
#[derive(Debug)]
pub struct ForkContext {
    key: SmolStr,
    call_id: SmolStr,
    state: ForkState,
    branches: Vec<Branch>,
    outcome: Option<Outcome>,
    caller_cancelled: bool,
    relay_provisional: bool,
    created_at: Instant,
    terminated_at: Option<Instant>,
}

impl ForkContext {
    /// Creates a context with one `Trying` branch per distinct destination.
    ///
    /// Destinations keep their order; repeated URIs after the first are
    /// dropped. With no destination at all the context is born `Terminated`
    /// and the returned actions carry the synthesized failure.
    pub fn new(
        key: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
        destinations: Vec<Destination>,
        config: &ForkConfig,
    ) -> (Self, ForkActions) {
        let key = key.into();
        let mut seen = HashSet::new();
        let mut branches = Vec::with_capacity(destinations.len());

        for destination in destinations {
            if !seen.insert(destination.uri.clone()) {
                debug!(fork = %key, uri = %destination.uri, "dropping duplicate destination");
                continue;
            }
            let id = BranchId(branches.len());
            branches.push(Branch::new(id, generate_branch_id(), destination));
        }

        let mut context = Self {
            key,
            call_id: call_id.into(),
            state: ForkState::Active,
            branches,
            outcome: None,
            caller_cancelled: false,
            relay_provisional: config.relay_provisional,
            created_at: Instant::now(),
            terminated_at: None,
        };

        let mut actions = ForkActions::default();
        if context.branches.is_empty() {
            info!(fork = %context.key, "no destination to fork to");
            let outcome = Outcome::no_destination(config.no_destination_code);
            context.terminate(Some(outcome.clone()));
            actions.outcome = Some(outcome);
        }

        (context, actions)
    }

    pub fn key(&self) -> &SmolStr {
        &self.key
    }

    pub fn call_id(&self) -> &SmolStr {
        &self.call_id
    }

    pub fn state(&self) -> ForkState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ForkState::Terminated
    }

    /// Branches in destination priority order.
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub(crate) fn branches_mut(&mut self) -> &mut [Branch] {
        &mut self.branches
    }

    pub fn branch(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(id.0)
    }

    /// Finds a branch by the Via branch parameter of its forwarded copy.
    pub fn branch_by_key(&self, branch_key: &str) -> Option<BranchId> {
        self.branches
            .iter()
            .find(|b| b.branch_key().as_str() == branch_key)
            .map(Branch::id)
    }

    /// Outcome that terminated the fork, if it ended with one.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn caller_cancelled(&self) -> bool {
        self.caller_cancelled
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn terminated_at(&self) -> Option<Instant> {
        self.terminated_at
    }

    /// Terminated, with no branch left that could still change state.
    pub fn is_quiescent(&self) -> bool {
        self.is_terminated() && self.branches.iter().all(Branch::is_terminal)
    }

    /// Transport targets for every branch that still has to be sent.
    pub fn pending_targets(&self) -> Vec<BranchTarget> {
        self.branches
            .iter()
            .filter(|b| !b.is_terminal())
            .map(|b| BranchTarget::new(self.key.clone(), self.call_id.clone(), b))
            .collect()
    }

    /// Handles a response received on `branch`.
    pub fn on_response(&mut self, branch: BranchId, response: ForkResponse) -> ForkActions {
        let Some(entry) = self.branches.get_mut(branch.0) else {
            warn!(fork = %self.key, %branch, "response for unknown branch");
            return ForkActions::late();
        };

        let code = response.code();
        match entry.deliver_response(response.clone()) {
            Delivery::Ignored => {
                debug!(fork = %self.key, %branch, code, "ignoring response on finished branch");
                ForkActions::late()
            }
            Delivery::Provisional => {
                debug!(fork = %self.key, %branch, code, "branch proceeding");
                let mut actions = ForkActions::default();
                if self.relay_provisional && self.state == ForkState::Active && code != 100 {
                    actions.relay = Some(response);
                }
                actions
            }
            Delivery::Final => {
                debug!(fork = %self.key, %branch, code, "branch completed");
                self.evaluate(branch)
            }
        }
    }

    /// Handles expiry of `branch`'s response timer as a 408.
    pub fn on_timeout(&mut self, branch: BranchId) -> ForkActions {
        self.on_response(branch, ForkResponse::synthesized(REQUEST_TIMEOUT))
    }

    /// Handles a transport failure on `branch`.
    pub fn on_unreachable(&mut self, branch: BranchId) -> ForkActions {
        let Some(entry) = self.branches.get_mut(branch.0) else {
            return ForkActions::late();
        };
        if !entry.mark_unreachable() {
            return ForkActions::late();
        }
        warn!(fork = %self.key, %branch, uri = %entry.destination().uri, "destination unreachable");
        self.evaluate(branch)
    }

    /// Handles cancellation by the caller.
    ///
    /// Every active branch must then be cancelled with
    /// [`CancelReason::Standard`]; nothing is forwarded upstream.
    pub fn cancel_by_caller(&mut self) -> ForkActions {
        if self.is_terminated() {
            debug!(fork = %self.key, "caller cancel after termination ignored");
            return ForkActions::late();
        }
        info!(fork = %self.key, "fork cancelled by caller");
        self.caller_cancelled = true;
        self.terminate(None);
        ForkActions {
            cancel: Some(CancelReason::Standard),
            ..ForkActions::default()
        }
    }

    fn evaluate(&mut self, completed: BranchId) -> ForkActions {
        let Some(outcome) = aggregator::evaluate(&self.branches, completed) else {
            return ForkActions::default();
        };

        if self.is_terminated() {
            warn!(
                fork = %self.key,
                kind = outcome.kind.as_str(),
                code = outcome.response.code(),
                "outcome after termination ignored"
            );
            return ForkActions::late();
        }

        info!(
            fork = %self.key,
            kind = outcome.kind.as_str(),
            code = outcome.response.code(),
            "fork outcome reached"
        );
        self.terminate(Some(outcome.clone()));
        ForkActions {
            relay: None,
            cancel: outcome.cancel_reason,
            outcome: Some(outcome),
            late: false,
        }
    }

    fn terminate(&mut self, outcome: Option<Outcome>) {
        self.state = ForkState::Terminated;
        self.outcome = outcome;
        self.terminated_at = Some(Instant::now());
    }
}
