// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registry and driver for active forks.
//!
//! Each fork lives behind its own `tokio::sync::Mutex`; every event for a
//! fork (response, timer, transport failure, caller CANCEL) takes that lock,
//! updates the [`ForkContext`], then performs the resulting I/O before
//! releasing it. Forks never share a lock, so different calls proceed in
//! parallel.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use sip_fork::{ChannelUpstream, Destination, ForkConfig, ForkManager, ForkResponse};
//! # async fn example(transport: Arc<dyn sip_fork::BranchTransport>) -> anyhow::Result<()> {
//! let (upstream, mut responses) = ChannelUpstream::channel();
//! let manager = Arc::new(ForkManager::new(transport, Arc::new(upstream), ForkConfig::default()));
//!
//! let fork = manager
//!     .start_fork(
//!         "z9hG4bKclient123",
//!         "call-12345",
//!         vec![
//!             Destination::new("sip:bob@192.168.1.100:5060"),
//!             Destination::new("sip:bob@192.168.1.101:5060"),
//!         ],
//!     )
//!     .await?;
//!
//! // The transport hands every downstream response back by Via branch.
//! let branch_key = fork.lock().await.branches()[0].branch_key().clone();
//! manager.deliver_response(&branch_key, ForkResponse::from_code(200)?).await;
//!
//! let forwarded = responses.recv().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

use crate::branch::{Branch, BranchId, Destination};
use crate::config::ForkConfig;
use crate::context::{ForkActions, ForkContext};
use crate::dispatcher::CancelDispatcher;
use crate::error::ForkError;
use crate::metrics::ForkMetrics;
use crate::status::ForkResponse;
use crate::transport::{BranchTransport, UpstreamSink};

/// Shared, lockable handle on one fork.
pub type ForkHandle = Arc<Mutex<ForkContext>>;

struct ForkEntry {
    context: ForkHandle,
    branch_keys: Vec<SmolStr>,
    /// Response timers of branches still waiting for a final response
    timers: parking_lot::Mutex<HashMap<BranchId, AbortHandle>>,
    created_at: Instant,
}

/// Drives every fork of a proxy instance.
pub struct ForkManager {
    /// Active forks, keyed by fork key (the caller's Via branch)
    forks: DashMap<SmolStr, Arc<ForkEntry>>,

    /// Downstream Via branch → (fork key, branch slot)
    branches: DashMap<SmolStr, (SmolStr, BranchId)>,

    transport: Arc<dyn BranchTransport>,
    upstream: Arc<dyn UpstreamSink>,
    dispatcher: CancelDispatcher,
    config: ForkConfig,
    metrics: ForkMetrics,
}

impl ForkManager {
    pub fn new(
        transport: Arc<dyn BranchTransport>,
        upstream: Arc<dyn UpstreamSink>,
        config: ForkConfig,
    ) -> Self {
        let metrics = ForkMetrics::new();
        Self {
            forks: DashMap::new(),
            branches: DashMap::new(),
            dispatcher: CancelDispatcher::new(transport.clone(), metrics.clone()),
            transport,
            upstream,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ForkMetrics {
        &self.metrics
    }

    /// Number of forks still registered.
    pub fn fork_count(&self) -> usize {
        self.forks.len()
    }

    pub fn find(&self, key: &str) -> Option<ForkHandle> {
        self.forks.get(key).map(|entry| entry.context.clone())
    }

    /// Forks a request to `destinations` (in priority order).
    ///
    /// Sends one copy per distinct destination and arms a response timer per
    /// branch. A destination whose send fails is marked unreachable. With no
    /// destination the synthesized failure is emitted upstream before this
    /// returns.
    pub async fn start_fork(
        self: &Arc<Self>,
        key: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
        destinations: Vec<Destination>,
    ) -> Result<ForkHandle, ForkError> {
        let key = key.into();
        let call_id = call_id.into();
        let span = sip_observe::span_with_fork(key.as_str(), call_id.as_str());
        self.start_fork_inner(key, call_id, destinations)
            .instrument(span)
            .await
    }

    async fn start_fork_inner(
        self: &Arc<Self>,
        key: SmolStr,
        call_id: SmolStr,
        destinations: Vec<Destination>,
    ) -> Result<ForkHandle, ForkError> {
        if self.forks.contains_key(&key) {
            return Err(ForkError::DuplicateFork(key));
        }

        let (context, actions) = ForkContext::new(key.clone(), call_id, destinations, &self.config);
        let targets = context.pending_targets();
        let handle: ForkHandle = Arc::new(Mutex::new(context));
        let entry = Arc::new(ForkEntry {
            context: handle.clone(),
            branch_keys: targets.iter().map(|t| t.branch_key.clone()).collect(),
            timers: parking_lot::Mutex::new(HashMap::new()),
            created_at: Instant::now(),
        });

        match self.forks.entry(key.clone()) {
            Entry::Occupied(_) => return Err(ForkError::DuplicateFork(key)),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        for target in &targets {
            self.branches
                .insert(target.branch_key.clone(), (key.clone(), target.branch));
        }

        self.metrics.record_fork_started(targets.len());
        sip_observe::fork_observer().on_fork_started(key.as_str(), targets.len());

        let mut ctx = handle.lock().await;
        self.apply(&mut ctx, actions).await;

        for target in targets {
            if ctx.branch(target.branch).map_or(true, Branch::is_terminal) {
                continue;
            }
            debug!(branch = %target.branch, uri = %target.destination.uri, "forwarding request");
            if let Err(e) = self.transport.send_request(&target).await {
                warn!(
                    branch = %target.branch,
                    uri = %target.destination.uri,
                    error = %e,
                    "failed to forward request"
                );
                self.metrics.record_unreachable();
                let actions = ctx.on_unreachable(target.branch);
                self.apply(&mut ctx, actions).await;
            }
        }

        let done = ctx.is_quiescent();
        if !done && self.config.branch_timers_enabled() {
            let pending = ctx
                .pending_targets()
                .into_iter()
                .map(|t| (t.branch, t.branch_key))
                .collect();
            self.arm_timers(&entry, pending);
        }
        drop(ctx);

        if done {
            self.remove(&key);
        }
        Ok(handle)
    }

    /// Feeds a downstream response, identified by its Via branch.
    ///
    /// Returns `false` when no active fork owns the branch (late delivery
    /// after cleanup); the response is dropped.
    pub async fn deliver_response(&self, branch_key: &str, response: ForkResponse) -> bool {
        let Some((fork, branch)) = self.lookup_branch(branch_key) else {
            debug!(branch_key, code = response.code(), "response for unknown branch");
            self.metrics.record_ignored_event();
            return false;
        };
        self.drive(&fork, move |ctx| ctx.on_response(branch, response))
            .await
    }

    /// Handles expiry of a branch response timer.
    pub async fn branch_timed_out(&self, branch_key: &str) -> bool {
        let Some((fork, branch)) = self.lookup_branch(branch_key) else {
            return false;
        };
        let metrics = &self.metrics;
        self.drive(&fork, move |ctx| {
            let mut actions = ctx.on_timeout(branch);
            if actions.late {
                // Timer lost the race against the branch's final response
                actions.late = false;
            } else {
                debug!(fork = %ctx.key(), %branch, "branch timed out");
                metrics.record_branch_timeout();
            }
            actions
        })
        .await
    }

    /// Reports a transport failure on a branch after its request was sent.
    pub async fn branch_unreachable(&self, branch_key: &str) -> bool {
        let Some((fork, branch)) = self.lookup_branch(branch_key) else {
            return false;
        };
        let metrics = &self.metrics;
        self.drive(&fork, move |ctx| {
            let actions = ctx.on_unreachable(branch);
            if !actions.late {
                metrics.record_unreachable();
            }
            actions
        })
        .await
    }

    /// Cancellation requested by the caller (CANCEL received upstream).
    ///
    /// Every active branch receives a `Standard` cancel; nothing is emitted
    /// upstream.
    pub async fn cancel_fork(&self, key: &str) -> Result<(), ForkError> {
        let fork = SmolStr::new(key);
        let metrics = &self.metrics;
        let found = self
            .drive(&fork, move |ctx| {
                let actions = ctx.cancel_by_caller();
                if !actions.late {
                    metrics.record_caller_cancel();
                    sip_observe::fork_observer().on_caller_cancel(ctx.key().as_str());
                }
                actions
            })
            .await;

        if found {
            Ok(())
        } else {
            Err(ForkError::UnknownFork(fork))
        }
    }

    /// Removes `key` if it is terminated and none of its branches can still
    /// change state. Returns `true` if the fork was removed.
    pub async fn reap(&self, key: &str) -> bool {
        let Some(handle) = self.find(key) else {
            return false;
        };
        if !handle.lock().await.is_quiescent() {
            return false;
        }
        self.remove(&SmolStr::new(key))
    }

    /// Concludes and removes forks older than the cleanup timeout.
    ///
    /// Unfinished branches of an expired fork are treated as timed out, so the
    /// fork still reaches an outcome and emits upstream once. Returns the
    /// number of forks removed.
    pub async fn cleanup_expired(&self) -> usize {
        let max_age = self.config.cleanup_timeout;
        let expired: Vec<(SmolStr, Arc<ForkEntry>)> = self
            .forks
            .iter()
            .filter(|entry| entry.created_at.elapsed() >= max_age)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, entry) in &expired {
            let mut ctx = entry.context.lock().await;
            let pending: Vec<BranchId> = ctx
                .branches()
                .iter()
                .filter(|b| !b.is_terminal())
                .map(Branch::id)
                .collect();
            if !pending.is_empty() {
                warn!(fork = %key, pending = pending.len(), "fork expired with unfinished branches");
            }
            for branch in pending {
                self.metrics.record_branch_timeout();
                let actions = ctx.on_timeout(branch);
                self.apply(&mut ctx, actions).await;
            }
            drop(ctx);
            self.remove(key);
        }

        expired.len()
    }

    /// Runs [`cleanup_expired`](Self::cleanup_expired) every `every` until the
    /// manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_expired().await;
                if removed > 0 {
                    debug!(removed, "expired forks removed");
                }
            }
        })
    }

    fn lookup_branch(&self, branch_key: &str) -> Option<(SmolStr, BranchId)> {
        self.branches.get(branch_key).map(|entry| entry.value().clone())
    }

    /// Applies one event to a fork under its lock. Returns `false` if the fork
    /// is no longer registered.
    async fn drive<F>(&self, fork: &SmolStr, event: F) -> bool
    where
        F: FnOnce(&mut ForkContext) -> ForkActions + Send,
    {
        let Some(entry) = self.forks.get(fork).map(|entry| entry.value().clone()) else {
            self.metrics.record_ignored_event();
            return false;
        };

        let mut ctx = entry.context.lock().await;
        let actions = event(&mut ctx);
        self.apply(&mut ctx, actions).await;
        Self::disarm_finished(&entry, &ctx);
        let done = ctx.is_quiescent();
        drop(ctx);

        if done {
            self.remove(fork);
        }
        true
    }

    /// Performs the I/O for `actions`: relay, then cancel dispatch, then the
    /// single upstream emission.
    async fn apply(&self, ctx: &mut ForkContext, actions: ForkActions) {
        if actions.late {
            self.metrics.record_ignored_event();
        }

        if let Some(response) = actions.relay {
            if let Err(e) = self.upstream.relay_provisional(ctx.key(), response).await {
                warn!(fork = %ctx.key(), error = %e, "failed to relay provisional response");
            }
        }

        if let Some(reason) = actions.cancel {
            let report = self.dispatcher.dispatch(ctx, reason).await;
            debug!(
                fork = %ctx.key(),
                %reason,
                cancelled = report.cancelled.len(),
                failed = report.failed.len(),
                "cancel dispatch finished"
            );
        }

        if let Some(outcome) = actions.outcome {
            self.metrics.record_outcome(outcome.kind);
            sip_observe::fork_observer().on_outcome(
                ctx.key().as_str(),
                outcome.kind.as_str(),
                outcome.response.code(),
            );
            if let Err(e) = self.upstream.emit_final(ctx.key(), outcome.response).await {
                warn!(fork = %ctx.key(), error = %e, "failed to emit final response upstream");
            }
        }
    }

    fn arm_timers(self: &Arc<Self>, entry: &ForkEntry, pending: Vec<(BranchId, SmolStr)>) {
        let timeout = self.config.branch_timeout;
        let mut timers = entry.timers.lock();
        for (branch, branch_key) in pending {
            let manager: Weak<Self> = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(manager) = manager.upgrade() {
                    manager.branch_timed_out(&branch_key).await;
                }
            });
            timers.insert(branch, task.abort_handle());
        }
    }

    /// Aborts the response timers of branches that reached a terminal state.
    ///
    /// Must run after the last `.await` of the caller: the aborted timer may
    /// be the task currently driving the fork.
    fn disarm_finished(entry: &ForkEntry, ctx: &ForkContext) {
        let mut timers = entry.timers.lock();
        if timers.is_empty() {
            return;
        }
        for branch in ctx.branches().iter().filter(|b| b.is_terminal()) {
            if let Some(timer) = timers.remove(&branch.id()) {
                timer.abort();
            }
        }
    }

    fn remove(&self, fork: &SmolStr) -> bool {
        let Some((_, entry)) = self.forks.remove(fork) else {
            return false;
        };
        for (_, timer) in entry.timers.lock().drain() {
            timer.abort();
        }
        for branch_key in &entry.branch_keys {
            self.branches.remove(branch_key);
        }
        debug!(fork = %fork, "fork removed");
        true
    }
}
