// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Simulated downstream network playing back scripted responses.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sip_fork::{BranchTarget, BranchTransport, CancelReason, ForkResponse};
use smol_str::SmolStr;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{info, warn};

use crate::scenario::DestinationScript;

/// A downstream response ready to be fed into the fork manager.
#[derive(Debug)]
pub struct SimulatedResponse {
    pub branch_key: SmolStr,
    pub response: ForkResponse,
}

pub struct SimulatedTransport {
    scripts: HashMap<SmolStr, DestinationScript>,
    responses: mpsc::UnboundedSender<SimulatedResponse>,
    running: DashMap<SmolStr, AbortHandle>,
}

impl SimulatedTransport {
    pub fn new(
        destinations: &[DestinationScript],
        responses: mpsc::UnboundedSender<SimulatedResponse>,
    ) -> Self {
        let scripts = destinations
            .iter()
            .map(|d| (SmolStr::new(&d.uri), d.clone()))
            .collect();
        Self {
            scripts,
            responses,
            running: DashMap::new(),
        }
    }
}

#[async_trait]
impl BranchTransport for SimulatedTransport {
    async fn send_request(&self, target: &BranchTarget) -> Result<()> {
        let script = self
            .scripts
            .get(&target.destination.uri)
            .ok_or_else(|| anyhow!("no script for {}", target.destination.uri))?;
        if script.unreachable {
            return Err(anyhow!("{} is unreachable", target.destination.uri));
        }

        info!(branch = %target.branch_key, uri = %target.destination.uri, "INVITE sent");

        let tx = self.responses.clone();
        let branch_key = target.branch_key.clone();
        let steps = script.responses.clone();
        let task = tokio::spawn(async move {
            let start = Instant::now();
            for step in steps {
                sleep_until(start + Duration::from_millis(step.after_ms)).await;
                let response = match step.reason {
                    Some(reason) => ForkResponse::new(step.code, reason),
                    None => ForkResponse::from_code(step.code),
                };
                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(branch = %branch_key, error = %e, "skipping scripted response");
                        continue;
                    }
                };
                let delivery = SimulatedResponse {
                    branch_key: branch_key.clone(),
                    response,
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
        });
        self.running
            .insert(target.branch_key.clone(), task.abort_handle());
        Ok(())
    }

    async fn send_cancel(&self, target: &BranchTarget, reason: CancelReason) -> Result<()> {
        let header = reason.reason_header();
        info!(
            branch = %target.branch_key,
            uri = %target.destination.uri,
            %reason,
            reason_header = header.as_deref().unwrap_or("-"),
            "CANCEL sent"
        );

        if let Some((_, script)) = self.running.remove(&target.branch_key) {
            script.abort();
        }

        // The callee answers the cancelled INVITE with 487
        let _ = self.responses.send(SimulatedResponse {
            branch_key: target.branch_key.clone(),
            response: ForkResponse::from_code(487)?,
        });
        Ok(())
    }
}
