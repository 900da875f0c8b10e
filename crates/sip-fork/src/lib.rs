// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call-forking engine for stateful SIP proxies (RFC 3261 §16).
//!
//! One incoming request is forwarded to several destinations in parallel.
//! The engine tracks every branch, picks the response to forward upstream
//! (§16.7), and cancels the branches that are no longer needed (§16.10),
//! telling each callee why with an RFC 3326 `Reason` header:
//!
//! - a 2xx on any branch cancels the rest with "Call completed elsewhere"
//! - a 6xx cancels the rest with "Busy Everywhere"
//! - a caller CANCEL cancels every branch without a `Reason`
//! - otherwise the fork waits for all branches and forwards the best failure
//!
//! [`ForkContext`] holds the decisions; [`ForkManager`] drives contexts
//! against a [`BranchTransport`] and an [`UpstreamSink`].

pub mod aggregator;
pub mod branch;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod reason;
pub mod status;
pub mod transport;

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

pub use aggregator::{Outcome, OutcomeKind};
pub use branch::{Branch, BranchId, BranchState, Destination, TerminationCause};
pub use config::ForkConfig;
pub use context::{ForkActions, ForkContext, ForkState};
pub use dispatcher::{CancelDispatcher, DispatchReport};
pub use error::ForkError;
pub use manager::{ForkHandle, ForkManager};
pub use metrics::{ForkMetrics, ForkMetricsSnapshot};
pub use reason::CancelReason;
pub use status::{ForkResponse, StatusClass};
pub use transport::{BranchTarget, BranchTransport, ChannelUpstream, UpstreamEvent, UpstreamSink};

/// Generates a Via branch for a forwarded copy, with the RFC 3261 magic
/// cookie.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_ids_carry_magic_cookie() {
        let a = generate_branch_id();
        let b = generate_branch_id();
        assert!(a.starts_with("z9hG4bK"));
        assert_eq!(a.len(), 23);
        assert_ne!(a, b);
    }
}
