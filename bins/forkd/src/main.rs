// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod scenario;
mod transport;

use anyhow::Result;
use clap::Parser;
use sip_fork::{
    generate_branch_id, ChannelUpstream, Destination, ForkConfig, ForkManager,
    ForkMetricsSnapshot, ForkResponse, UpstreamEvent,
};
use sip_observe::{set_fork_observer, TracingForkObserver};
use std::{path::PathBuf, sync::Arc};
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::scenario::Scenario;
use crate::transport::SimulatedTransport;

/// Plays a scripted forked INVITE through the forking engine
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON scenario
    #[arg(long)]
    scenario: PathBuf,
    /// Per-branch response timeout in milliseconds (0 disables); overrides the scenario
    #[arg(long)]
    branch_timeout_ms: Option<u64>,
    /// Do not relay 18x responses to the caller
    #[arg(long)]
    no_relay_provisional: bool,
}

#[tokio::main]
/// Entry point for the fork simulator.
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    set_fork_observer(Arc::new(TracingForkObserver));

    let Args {
        scenario,
        branch_timeout_ms,
        no_relay_provisional,
    } = Args::parse();

    let scenario = Scenario::load(&scenario)?;
    let mut config = scenario.config.apply(ForkConfig::default());
    if let Some(ms) = branch_timeout_ms {
        config = config.with_branch_timeout(Duration::from_millis(ms));
    }
    if no_relay_provisional {
        config = config.with_relay_provisional(false);
    }

    let report = run(scenario, config).await?;

    for response in &report.provisional {
        println!("provisional: {}", response);
    }
    match &report.final_response {
        Some(response) => println!("final: {}", response),
        None => println!("final: none (cancelled by caller)"),
    }
    let metrics = &report.metrics;
    println!(
        "branches: {}, cancels sent: {}, cancel failures: {}, timeouts: {}, unreachable: {}",
        metrics.branches_created,
        metrics.cancels.values().sum::<u64>(),
        metrics.cancel_failures,
        metrics.branch_timeouts,
        metrics.unreachable_branches,
    );
    Ok(())
}

/// What the caller saw.
#[derive(Debug)]
struct Report {
    provisional: Vec<ForkResponse>,
    final_response: Option<ForkResponse>,
    metrics: ForkMetricsSnapshot,
}

/// Runs one scenario to completion.
async fn run(scenario: Scenario, config: ForkConfig) -> Result<Report> {
    let (response_tx, mut responses) = mpsc::unbounded_channel();
    let transport = Arc::new(SimulatedTransport::new(&scenario.destinations, response_tx));
    let (sink, mut upstream) = ChannelUpstream::channel();
    let manager = Arc::new(ForkManager::new(transport, Arc::new(sink), config));
    let reaper = manager.spawn_reaper(Duration::from_secs(1));

    let fork = generate_branch_id();
    let call_id = scenario
        .call_id
        .clone()
        .unwrap_or_else(|| format!("forkd-{}", fork.trim_start_matches("z9hG4bK")));
    let destinations = scenario
        .destinations
        .iter()
        .map(|d| Destination::new(d.uri.as_str()))
        .collect();

    info!(fork = %fork, call_id = %call_id, "starting fork");
    manager.start_fork(fork.clone(), call_id, destinations).await?;

    if let Some(ms) = scenario.caller_cancel_after_ms {
        let manager = manager.clone();
        let fork = fork.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(ms)).await;
            match manager.cancel_fork(&fork).await {
                Ok(()) => info!(fork = %fork, "caller sent CANCEL"),
                Err(e) => info!(fork = %fork, error = %e, "caller CANCEL after fork finished"),
            }
        });
    }

    let mut provisional = Vec::new();
    let mut final_response = None;
    let mut record = |event: UpstreamEvent| match event {
        UpstreamEvent::Provisional { response, .. } => provisional.push(response),
        UpstreamEvent::Final { response, .. } => final_response = Some(response),
    };

    let mut ticker = time::interval(Duration::from_millis(50));
    while manager.fork_count() > 0 {
        tokio::select! {
            Some(sim) = responses.recv() => {
                manager.deliver_response(&sim.branch_key, sim.response).await;
            }
            Some(event) = upstream.recv() => record(event),
            _ = ticker.tick() => {}
        }
    }
    while let Ok(event) = upstream.try_recv() {
        record(event);
    }
    reaper.abort();

    Ok(Report {
        provisional,
        final_response,
        metrics: manager.metrics().snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_fork::CancelReason;

    const ANSWERED_ELSEWHERE: &str = r#"{
        "destinations": [
            { "uri": "sip:alice@10.0.0.1", "responses": [
                { "after_ms": 50, "code": 180 },
                { "after_ms": 200, "code": 486 }
            ] },
            { "uri": "sip:bob@10.0.0.2", "responses": [{ "after_ms": 300, "code": 200 }] },
            { "uri": "sip:carol@10.0.0.3", "responses": [{ "after_ms": 80, "code": 183 }] },
            { "uri": "sip:dave@10.0.0.4", "unreachable": true }
        ]
    }"#;

    #[tokio::test(start_paused = true)]
    async fn answered_call_cancels_ringing_branch() {
        let scenario = Scenario::parse(ANSWERED_ELSEWHERE).unwrap();
        let report = run(scenario, ForkConfig::default()).await.unwrap();

        let codes: Vec<u16> = report.provisional.iter().map(|r| r.code()).collect();
        assert_eq!(codes, vec![180, 183]);
        assert_eq!(report.final_response.map(|r| r.code()), Some(200));
        assert_eq!(
            report.metrics.cancels.get(&CancelReason::AcceptedElsewhere),
            Some(&1)
        );
        assert_eq!(report.metrics.unreachable_branches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancel_forwards_nothing() {
        let scenario = Scenario::parse(
            r#"{
                "destinations": [
                    { "uri": "sip:alice@10.0.0.1", "responses": [{ "after_ms": 50, "code": 180 }] },
                    { "uri": "sip:bob@10.0.0.2" }
                ],
                "caller_cancel_after_ms": 100
            }"#,
        )
        .unwrap();
        let report = run(scenario, ForkConfig::default()).await.unwrap();

        assert!(report.final_response.is_none());
        assert_eq!(report.metrics.caller_cancels, 1);
        assert_eq!(report.metrics.cancels.get(&CancelReason::Standard), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_destinations_time_out() {
        let scenario =
            Scenario::parse(r#"{ "destinations": [{ "uri": "sip:alice@10.0.0.1" }] }"#).unwrap();
        let config = ForkConfig::default().with_branch_timeout(Duration::from_secs(2));
        let report = run(scenario, config).await.unwrap();

        assert_eq!(report.final_response.map(|r| r.code()), Some(408));
        assert_eq!(report.metrics.branch_timeouts, 1);
    }
}
