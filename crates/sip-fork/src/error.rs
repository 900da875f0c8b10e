// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

/// Errors returned by the forking engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkError {
    /// Status code outside 100..=699
    InvalidStatus(u16),
    /// A fork with this key is already registered
    DuplicateFork(SmolStr),
    /// No fork is registered under this key
    UnknownFork(SmolStr),
}

impl std::fmt::Display for ForkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatus(code) => write!(f, "invalid status code {}", code),
            Self::DuplicateFork(key) => write!(f, "fork {} already exists", key),
            Self::UnknownFork(key) => write!(f, "no fork registered for {}", key),
        }
    }
}

impl std::error::Error for ForkError {}
