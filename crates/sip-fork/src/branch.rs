// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-destination branch state machine.
//!
//! ```text
//!            1xx                final
//! Trying ─────────► Proceeding ───────► Completed
//!   │  └──────────────────┼──── final ─────┘
//!   │                     │
//!   └── cancel/unreachable┴───────────► Terminated
//! ```
//!
//! `Completed` and `Terminated` absorb every further event, so network
//! retransmissions and crossing CANCELs never change a recorded outcome.

use std::time::Instant;

use smol_str::SmolStr;

use crate::reason::CancelReason;
use crate::status::{ForkResponse, SERVICE_UNAVAILABLE};

/// Slot of a branch inside its owning fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub usize);

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Destination a copy of the request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Contact URI from the location service
    pub uri: SmolStr,
}

impl Destination {
    pub fn new(uri: impl Into<SmolStr>) -> Self {
        Self { uri: uri.into() }
    }
}

/// State of a single branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchState {
    /// Request sent, waiting for response
    Trying,
    /// Received provisional response (1xx)
    Proceeding,
    /// Received final response (2xx-6xx) or timed out
    Completed,
    /// Cancelled by the fork, or destination unreachable
    Terminated,
}

/// Inputs that drive [`BranchState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchEvent {
    Provisional,
    Final,
    Cancel,
    Unreachable,
}

impl BranchState {
    /// Transition table. `None` means the event is absorbed without effect.
    pub fn on(self, event: BranchEvent) -> Option<BranchState> {
        use BranchEvent::*;
        use BranchState::*;

        match (self, event) {
            (Trying | Proceeding, Provisional) => Some(Proceeding),
            (Trying | Proceeding, Final) => Some(Completed),
            (Trying | Proceeding, Cancel | Unreachable) => Some(Terminated),
            (Completed | Terminated, _) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BranchState::Completed | BranchState::Terminated)
    }
}

/// How a `Terminated` branch got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Cancelled(CancelReason),
    /// The initial request could not be delivered.
    Unreachable,
}

/// Result of feeding a response into a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Branch already terminal; the response was dropped.
    Ignored,
    Provisional,
    Final,
}

/// One outgoing copy of a forked request.
#[derive(Debug, Clone)]
pub struct Branch {
    id: BranchId,
    branch_key: SmolStr,
    destination: Destination,
    state: BranchState,
    last_response: Option<ForkResponse>,
    termination: Option<TerminationCause>,
    created_at: Instant,
}

impl Branch {
    pub fn new(id: BranchId, branch_key: SmolStr, destination: Destination) -> Self {
        Self {
            id,
            branch_key,
            destination,
            state: BranchState::Trying,
            last_response: None,
            termination: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    /// Via branch parameter the request copy was sent with.
    pub fn branch_key(&self) -> &SmolStr {
        &self.branch_key
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn last_response(&self) -> Option<&ForkResponse> {
        self.last_response.as_ref()
    }

    pub fn termination(&self) -> Option<TerminationCause> {
        self.termination
    }

    /// Reason recorded when the fork cancelled this branch.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self.termination {
            Some(TerminationCause::Cancelled(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies a response received from the destination.
    pub fn deliver_response(&mut self, response: ForkResponse) -> Delivery {
        let event = if response.is_provisional() {
            BranchEvent::Provisional
        } else {
            BranchEvent::Final
        };

        match self.state.on(event) {
            Some(next) => {
                self.state = next;
                self.last_response = Some(response);
                match event {
                    BranchEvent::Provisional => Delivery::Provisional,
                    _ => Delivery::Final,
                }
            }
            None => Delivery::Ignored,
        }
    }

    /// Terminates the branch on behalf of the fork.
    ///
    /// Returns `true` when this call performed the transition and the caller
    /// must send the termination signal downstream. Later calls keep the first
    /// reason and return `false`.
    pub fn cancel(&mut self, reason: CancelReason) -> bool {
        match self.state.on(BranchEvent::Cancel) {
            Some(next) => {
                self.state = next;
                self.termination = Some(TerminationCause::Cancelled(reason));
                true
            }
            None => false,
        }
    }

    /// Marks the destination unreachable. Returns `true` on transition.
    pub fn mark_unreachable(&mut self) -> bool {
        match self.state.on(BranchEvent::Unreachable) {
            Some(next) => {
                self.state = next;
                self.termination = Some(TerminationCause::Unreachable);
                true
            }
            None => false,
        }
    }

    /// Final response this branch contributes to response selection.
    ///
    /// An unreachable destination counts as `503 Service Unavailable`; a
    /// cancelled or still-running branch contributes nothing.
    pub fn effective_final(&self) -> Option<ForkResponse> {
        match (self.state, self.termination) {
            (BranchState::Completed, _) => self.last_response.clone(),
            (BranchState::Terminated, Some(TerminationCause::Unreachable)) => {
                Some(ForkResponse::synthesized(SERVICE_UNAVAILABLE))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch() -> Branch {
        Branch::new(
            BranchId(0),
            SmolStr::new("z9hG4bKtest"),
            Destination::new("sip:bob@192.168.1.100:5060"),
        )
    }

    fn response(code: u16) -> ForkResponse {
        ForkResponse::from_code(code).unwrap()
    }

    #[test]
    fn provisional_moves_to_proceeding() {
        let mut b = branch();
        assert_eq!(b.deliver_response(response(180)), Delivery::Provisional);
        assert_eq!(b.state(), BranchState::Proceeding);
        assert_eq!(b.last_response().unwrap().code(), 180);

        assert_eq!(b.deliver_response(response(183)), Delivery::Provisional);
        assert_eq!(b.state(), BranchState::Proceeding);
    }

    #[test]
    fn final_moves_to_completed() {
        let mut b = branch();
        assert_eq!(b.deliver_response(response(486)), Delivery::Final);
        assert_eq!(b.state(), BranchState::Completed);
        assert_eq!(b.effective_final().unwrap().code(), 486);
        assert!(b.cancel_reason().is_none());
    }

    #[test]
    fn late_responses_are_ignored() {
        let mut b = branch();
        b.deliver_response(response(200));
        assert_eq!(b.deliver_response(response(200)), Delivery::Ignored);
        assert_eq!(b.deliver_response(response(180)), Delivery::Ignored);
        assert_eq!(b.deliver_response(response(603)), Delivery::Ignored);
        assert_eq!(b.last_response().unwrap().code(), 200);
    }

    #[test]
    fn cancel_keeps_first_reason() {
        let mut b = branch();
        assert!(b.cancel(CancelReason::AcceptedElsewhere));
        assert!(!b.cancel(CancelReason::Standard));
        assert_eq!(b.state(), BranchState::Terminated);
        assert_eq!(b.cancel_reason(), Some(CancelReason::AcceptedElsewhere));
    }

    #[test]
    fn cancel_after_completion_is_noop() {
        let mut b = branch();
        b.deliver_response(response(486));
        assert!(!b.cancel(CancelReason::AcceptedElsewhere));
        assert_eq!(b.state(), BranchState::Completed);
        assert!(b.cancel_reason().is_none());
    }

    #[test]
    fn cancelled_branch_ignores_responses() {
        let mut b = branch();
        b.deliver_response(response(180));
        b.cancel(CancelReason::Standard);
        assert_eq!(b.deliver_response(response(487)), Delivery::Ignored);
        assert!(b.effective_final().is_none());
    }

    #[test]
    fn unreachable_counts_as_service_unavailable() {
        let mut b = branch();
        assert!(b.mark_unreachable());
        assert_eq!(b.state(), BranchState::Terminated);
        assert_eq!(b.termination(), Some(TerminationCause::Unreachable));
        assert!(b.cancel_reason().is_none());
        assert_eq!(b.effective_final().unwrap().code(), 503);
        assert!(!b.cancel(CancelReason::Standard));
    }

    #[test]
    fn transition_table_absorbs_terminal_states() {
        for event in [
            BranchEvent::Provisional,
            BranchEvent::Final,
            BranchEvent::Cancel,
            BranchEvent::Unreachable,
        ] {
            assert_eq!(BranchState::Completed.on(event), None);
            assert_eq!(BranchState::Terminated.on(event), None);
        }
    }
}
