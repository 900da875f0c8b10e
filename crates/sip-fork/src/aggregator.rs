// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Response aggregation per RFC 3261 §16.7.
//!
//! Decides when a fork has an outcome and which response goes upstream:
//! 1. A 2xx on any branch accepts the call immediately (first one wins)
//! 2. A 6xx declines the call immediately
//! 3. Otherwise nothing is decided until every branch is terminal, and the
//!    best 3xx-5xx response is chosen by [`preference`]

use std::cmp::Ordering;

use crate::branch::{Branch, BranchId};
use crate::reason::CancelReason;
use crate::status::{ForkResponse, StatusClass, TEMPORARILY_UNAVAILABLE};

/// How a fork ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// A branch answered with 2xx
    Accepted,
    /// A branch answered with 6xx
    Declined,
    /// Every branch failed with 3xx-5xx, timed out or was unreachable
    Exhausted,
    /// No destination to fork to
    NoDestination,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Exhausted => "exhausted",
            Self::NoDestination => "no_destination",
        }
    }
}

/// Decision reached for a fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// Response to forward upstream
    pub response: ForkResponse,
    /// Reason to cancel the remaining branches with, if any are left
    pub cancel_reason: Option<CancelReason>,
    /// Branch whose response decided the outcome
    pub winner: Option<BranchId>,
}

impl Outcome {
    pub(crate) fn no_destination(code: u16) -> Self {
        Self {
            kind: OutcomeKind::NoDestination,
            response: ForkResponse::synthesized(code),
            cancel_reason: None,
            winner: None,
        }
    }
}

/// Evaluates the fork after `completed` reached a final state.
///
/// Returns `None` while the outcome is still open.
pub fn evaluate(branches: &[Branch], completed: BranchId) -> Option<Outcome> {
    let latest = branches
        .get(completed.0)
        .and_then(|branch| branch.effective_final());

    if let Some(response) = latest {
        match response.class() {
            StatusClass::Success => {
                return Some(Outcome {
                    kind: OutcomeKind::Accepted,
                    response,
                    cancel_reason: Some(CancelReason::AcceptedElsewhere),
                    winner: Some(completed),
                })
            }
            StatusClass::GlobalFailure => {
                return Some(Outcome {
                    kind: OutcomeKind::Declined,
                    response,
                    cancel_reason: Some(CancelReason::DeclinedElsewhere),
                    winner: Some(completed),
                })
            }
            _ => {}
        }
    }

    if !branches.iter().all(Branch::is_terminal) {
        return None;
    }

    let best = branches
        .iter()
        .filter_map(|branch| branch.effective_final().map(|resp| (branch.id(), resp)))
        .min_by(|(_, a), (_, b)| preference(a, b));

    let (winner, response) = match best {
        Some((id, response)) => (Some(id), response),
        None => (None, ForkResponse::synthesized(TEMPORARILY_UNAVAILABLE)),
    };

    Some(Outcome {
        kind: OutcomeKind::Exhausted,
        response,
        cancel_reason: None,
        winner,
    })
}

/// Total order over final responses; `Ordering::Less` means `a` is preferred.
///
/// Rules, in order:
/// 1. Lower response class wins (3xx over 4xx over 5xx)
/// 2. Within a class, 408 and 487 lose to any other code: they describe
///    this proxy's own timer or a cancellation, not the callee
/// 3. A specific code wins over the generic x00 code of its class
/// 4. Lower numeric code wins
/// 5. Reason phrase, lexicographically, so identical codes never tie
pub fn preference(a: &ForkResponse, b: &ForkResponse) -> Ordering {
    rank(a).cmp(&rank(b)).then_with(|| a.reason().cmp(&b.reason()))
}

fn rank(response: &ForkResponse) -> (StatusClass, bool, bool, u16) {
    let code = response.code();
    let weak = matches!(code, 408 | 487);
    let generic = code % 100 == 0;
    (response.class(), weak, generic, code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Destination;
    use smol_str::SmolStr;

    fn branches(n: usize) -> Vec<Branch> {
        (0..n)
            .map(|i| {
                Branch::new(
                    BranchId(i),
                    SmolStr::new(format!("z9hG4bK{}", i)),
                    Destination::new(format!("sip:bob@10.0.0.{}", i)),
                )
            })
            .collect()
    }

    fn response(code: u16) -> ForkResponse {
        ForkResponse::from_code(code).unwrap()
    }

    #[test]
    fn success_accepts_immediately() {
        let mut b = branches(3);
        b[1].deliver_response(response(200));

        let outcome = evaluate(&b, BranchId(1)).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Accepted);
        assert_eq!(outcome.response.code(), 200);
        assert_eq!(outcome.cancel_reason, Some(CancelReason::AcceptedElsewhere));
        assert_eq!(outcome.winner, Some(BranchId(1)));
    }

    #[test]
    fn global_failure_declines_immediately() {
        let mut b = branches(2);
        b[0].deliver_response(response(603));

        let outcome = evaluate(&b, BranchId(0)).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Declined);
        assert_eq!(outcome.response.code(), 603);
        assert_eq!(outcome.cancel_reason, Some(CancelReason::DeclinedElsewhere));
    }

    #[test]
    fn client_error_waits_for_other_branches() {
        let mut b = branches(2);
        b[0].deliver_response(response(486));
        assert!(evaluate(&b, BranchId(0)).is_none());

        b[1].deliver_response(response(404));
        let outcome = evaluate(&b, BranchId(1)).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Exhausted);
        assert_eq!(outcome.response.code(), 404);
        assert_eq!(outcome.cancel_reason, None);
        assert_eq!(outcome.winner, Some(BranchId(1)));
    }

    #[test]
    fn unreachable_branch_counts_as_finished() {
        let mut b = branches(2);
        b[0].mark_unreachable();
        assert!(evaluate(&b, BranchId(0)).is_none());

        b[1].deliver_response(response(486));
        let outcome = evaluate(&b, BranchId(1)).unwrap();
        assert_eq!(outcome.response.code(), 486);
    }

    #[test]
    fn all_unreachable_forwards_service_unavailable() {
        let mut b = branches(2);
        b[0].mark_unreachable();
        b[1].mark_unreachable();
        let outcome = evaluate(&b, BranchId(1)).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Exhausted);
        assert_eq!(outcome.response.code(), 503);
    }

    #[test]
    fn lower_class_wins() {
        assert_eq!(preference(&response(302), &response(486)), Ordering::Less);
        assert_eq!(preference(&response(486), &response(500)), Ordering::Less);
        assert_eq!(preference(&response(503), &response(404)), Ordering::Greater);
    }

    #[test]
    fn specific_code_beats_generic() {
        assert_eq!(preference(&response(486), &response(400)), Ordering::Less);
        assert_eq!(preference(&response(500), &response(503)), Ordering::Greater);
    }

    #[test]
    fn timeout_loses_within_class() {
        assert_eq!(preference(&response(486), &response(408)), Ordering::Less);
        assert_eq!(preference(&response(487), &response(480)), Ordering::Greater);
        // Class still dominates.
        assert_eq!(preference(&response(408), &response(503)), Ordering::Less);
    }

    #[test]
    fn identical_codes_break_tie_on_reason() {
        let a = ForkResponse::new(486, "Busy Here").unwrap();
        let b = ForkResponse::new(486, "User Busy").unwrap();
        assert_eq!(preference(&a, &b), Ordering::Less);
        assert_eq!(preference(&b, &a), Ordering::Greater);
        assert_eq!(preference(&a, &a), Ordering::Equal);
    }
}
