// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Collaborator interfaces between the forking engine and the SIP stack.
//!
//! The engine never builds or parses messages. [`BranchTransport`] turns a
//! [`BranchTarget`] into a forwarded INVITE or CANCEL (including the `Reason`
//! header for [`CancelReason`]), and [`UpstreamSink`] relays the chosen
//! response to the caller's server transaction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::branch::{Branch, BranchId, Destination};
use crate::reason::CancelReason;
use crate::status::ForkResponse;

/// Everything a transport needs to address one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTarget {
    /// Fork key (normally the caller's Via branch)
    pub fork: SmolStr,
    pub call_id: SmolStr,
    pub branch: BranchId,
    /// Via branch parameter of the forwarded copy; CANCEL reuses it
    pub branch_key: SmolStr,
    pub destination: Destination,
}

impl BranchTarget {
    pub fn new(fork: SmolStr, call_id: SmolStr, branch: &Branch) -> Self {
        Self {
            fork,
            call_id,
            branch: branch.id(),
            branch_key: branch.branch_key().clone(),
            destination: branch.destination().clone(),
        }
    }
}

/// Downstream side: one call per forwarded copy and per termination signal.
///
/// An `Err` from either method means the destination is unreachable.
#[async_trait]
pub trait BranchTransport: Send + Sync + 'static {
    async fn send_request(&self, target: &BranchTarget) -> Result<()>;
    async fn send_cancel(&self, target: &BranchTarget, reason: CancelReason) -> Result<()>;
}

/// Upstream side: the caller's server transaction.
#[async_trait]
pub trait UpstreamSink: Send + Sync + 'static {
    /// Called at most once per fork with the chosen final response.
    async fn emit_final(&self, fork: &SmolStr, response: ForkResponse) -> Result<()>;

    /// Relays a provisional response while the fork is still active.
    async fn relay_provisional(&self, fork: &SmolStr, response: ForkResponse) -> Result<()>;
}

/// Message produced by [`ChannelUpstream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Provisional { fork: SmolStr, response: ForkResponse },
    Final { fork: SmolStr, response: ForkResponse },
}

/// Upstream sink that pushes responses onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelUpstream {
    tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl ChannelUpstream {
    /// Creates the sink and the receiver the server transaction reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl UpstreamSink for ChannelUpstream {
    async fn emit_final(&self, fork: &SmolStr, response: ForkResponse) -> Result<()> {
        self.tx
            .send(UpstreamEvent::Final {
                fork: fork.clone(),
                response,
            })
            .map_err(|_| anyhow!("upstream receiver dropped"))
    }

    async fn relay_provisional(&self, fork: &SmolStr, response: ForkResponse) -> Result<()> {
        self.tx
            .send(UpstreamEvent::Provisional {
                fork: fork.clone(),
                response,
            })
            .map_err(|_| anyhow!("upstream receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_upstream_delivers_events() {
        let (sink, mut rx) = ChannelUpstream::channel();
        let fork = SmolStr::new("z9hG4bKclient");

        sink.relay_provisional(&fork, ForkResponse::from_code(180).unwrap())
            .await
            .unwrap();
        sink.emit_final(&fork, ForkResponse::from_code(200).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(UpstreamEvent::Provisional { response, .. }) if response.code() == 180
        ));
        assert!(matches!(
            rx.recv().await,
            Some(UpstreamEvent::Final { response, .. }) if response.code() == 200
        ));
    }

    #[tokio::test]
    async fn channel_upstream_reports_closed_receiver() {
        let (sink, rx) = ChannelUpstream::channel();
        drop(rx);
        let result = sink
            .emit_final(&SmolStr::new("f"), ForkResponse::from_code(486).unwrap())
            .await;
        assert!(result.is_err());
    }
}
