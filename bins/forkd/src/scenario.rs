// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Scripted fork scenarios loaded from JSON.
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sip_fork::ForkConfig;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Call-ID of the forked INVITE; generated when omitted
    pub call_id: Option<String>,
    pub destinations: Vec<DestinationScript>,
    /// Caller sends CANCEL this long after the fork starts
    pub caller_cancel_after_ms: Option<u64>,
    #[serde(default)]
    pub config: FileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationScript {
    pub uri: String,
    /// Forwarding to this destination fails at the transport
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub responses: Vec<ScriptedResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedResponse {
    /// Delay after the request reaches the destination
    pub after_ms: u64,
    pub code: u16,
    pub reason: Option<String>,
}

/// `config` section of a scenario; unset fields keep the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub branch_timeout_ms: Option<u64>,
    pub cleanup_timeout_ms: Option<u64>,
    pub relay_provisional: Option<bool>,
    pub no_destination_code: Option<u16>,
}

impl FileConfig {
    pub fn apply(&self, mut config: ForkConfig) -> ForkConfig {
        if let Some(ms) = self.branch_timeout_ms {
            config = config.with_branch_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.cleanup_timeout_ms {
            config = config.with_cleanup_timeout(Duration::from_millis(ms));
        }
        if let Some(relay) = self.relay_provisional {
            config = config.with_relay_provisional(relay);
        }
        if let Some(code) = self.no_destination_code {
            config = config.with_no_destination_code(code);
        }
        config
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(raw)?;
        for destination in &scenario.destinations {
            if let Some(bad) = destination
                .responses
                .iter()
                .find(|r| !(100..=699).contains(&r.code))
            {
                return Err(anyhow!(
                    "destination {} scripts invalid status {}",
                    destination.uri,
                    bad.code
                ));
            }
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "call_id": "sim-1",
        "destinations": [
            { "uri": "sip:alice@10.0.0.1", "responses": [
                { "after_ms": 50, "code": 180 },
                { "after_ms": 200, "code": 486, "reason": "Busy Here" }
            ] },
            { "uri": "sip:bob@10.0.0.2", "unreachable": true }
        ],
        "caller_cancel_after_ms": 1000,
        "config": { "branch_timeout_ms": 4000, "relay_provisional": false }
    }"#;

    #[test]
    fn parses_scripts_and_overrides() {
        let scenario = Scenario::parse(SAMPLE).unwrap();
        assert_eq!(scenario.call_id.as_deref(), Some("sim-1"));
        assert_eq!(scenario.destinations.len(), 2);
        assert_eq!(scenario.destinations[0].responses[1].code, 486);
        assert!(scenario.destinations[1].unreachable);
        assert!(scenario.destinations[1].responses.is_empty());
        assert_eq!(scenario.caller_cancel_after_ms, Some(1000));

        let config = scenario.config.apply(ForkConfig::default());
        assert_eq!(config.branch_timeout, Duration::from_secs(4));
        assert!(!config.relay_provisional);
        assert_eq!(config.no_destination_code, 480);
    }

    #[test]
    fn config_section_is_optional() {
        let scenario = Scenario::parse(r#"{ "destinations": [] }"#).unwrap();
        assert_eq!(scenario.config.apply(ForkConfig::default()), ForkConfig::default());
    }

    #[test]
    fn rejects_out_of_range_status() {
        let raw = r#"{ "destinations": [
            { "uri": "sip:a@h", "responses": [{ "after_ms": 0, "code": 99 }] }
        ] }"#;
        assert!(Scenario::parse(raw).is_err());
    }
}
