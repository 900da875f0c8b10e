// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

use crate::status::TEMPORARILY_UNAVAILABLE;

/// Timer B (64*T1): how long a branch may stay without a final response.
pub const DEFAULT_BRANCH_TIMEOUT: Duration = Duration::from_secs(32);

/// Upper bound on how long any fork stays registered.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(300);

/// Forking engine configuration.
///
/// # Examples
/// ```
/// use sip_fork::ForkConfig;
/// use std::time::Duration;
///
/// let config = ForkConfig::default()
///     .with_branch_timeout(Duration::from_secs(20))
///     .with_relay_provisional(false);
/// assert_eq!(config.branch_timeout, Duration::from_secs(20));
/// assert_eq!(config.no_destination_code, 480);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkConfig {
    /// Per-branch response timeout. `Duration::ZERO` disables branch timers.
    pub branch_timeout: Duration,

    /// Forks older than this are concluded and removed by
    /// [`ForkManager::cleanup_expired`](crate::ForkManager::cleanup_expired).
    pub cleanup_timeout: Duration,

    /// Relay 1xx responses (other than 100) upstream while the fork is active
    pub relay_provisional: bool,

    /// Status forwarded when no destination could be resolved
    pub no_destination_code: u16,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            branch_timeout: DEFAULT_BRANCH_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            relay_provisional: true,
            no_destination_code: TEMPORARILY_UNAVAILABLE,
        }
    }
}

impl ForkConfig {
    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = timeout;
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn with_relay_provisional(mut self, relay: bool) -> Self {
        self.relay_provisional = relay;
        self
    }

    /// Sets the "no destination" status; values outside 300..=699 are ignored.
    pub fn with_no_destination_code(mut self, code: u16) -> Self {
        if (300..=699).contains(&code) {
            self.no_destination_code = code;
        }
        self
    }

    pub fn branch_timers_enabled(&self) -> bool {
        !self.branch_timeout.is_zero()
    }
}
