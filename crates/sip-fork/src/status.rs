// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Response codes as seen by the forking engine.
//!
//! The engine never looks at headers or bodies; a branch response is reduced
//! to its status code and reason phrase. Parsing and serialization stay with
//! the transport layer.

use smol_str::SmolStr;

use crate::ForkError;

/// Status code used when no destination could be resolved.
pub const TEMPORARILY_UNAVAILABLE: u16 = 480;
/// Status code synthesized when a branch timer expires.
pub const REQUEST_TIMEOUT: u16 = 408;
/// Status code synthesized for an unreachable destination.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Response class (RFC 3261 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusClass {
    Provisional,
    Success,
    Redirection,
    ClientError,
    ServerError,
    GlobalFailure,
}

impl StatusClass {
    /// Classifies a raw status code, returning `None` outside 100..=699.
    pub fn of(code: u16) -> Option<Self> {
        match code {
            100..=199 => Some(Self::Provisional),
            200..=299 => Some(Self::Success),
            300..=399 => Some(Self::Redirection),
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::ServerError),
            600..=699 => Some(Self::GlobalFailure),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::Provisional)
    }
}

/// Status line of a response received on (or synthesized for) a branch.
///
/// Fields are private so every value has passed the 100..=699 check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForkResponse {
    code: u16,
    reason: SmolStr,
}

impl ForkResponse {
    /// Builds a response, rejecting codes outside 100..=699.
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Result<Self, ForkError> {
        if StatusClass::of(code).is_none() {
            return Err(ForkError::InvalidStatus(code));
        }
        Ok(Self {
            code,
            reason: reason.into(),
        })
    }

    /// Builds a response with the default reason phrase for `code`.
    pub fn from_code(code: u16) -> Result<Self, ForkError> {
        Self::new(code, default_reason(code))
    }

    pub(crate) fn synthesized(code: u16) -> Self {
        Self {
            code,
            reason: SmolStr::new(default_reason(code)),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &SmolStr {
        &self.reason
    }

    pub fn class(&self) -> StatusClass {
        // Unreachable: constructors reject codes without a class.
        StatusClass::of(self.code).unwrap_or(StatusClass::ServerError)
    }

    pub fn is_provisional(&self) -> bool {
        self.class() == StatusClass::Provisional
    }

    pub fn is_success(&self) -> bool {
        self.class() == StatusClass::Success
    }

    pub fn is_global_failure(&self) -> bool {
        self.class() == StatusClass::GlobalFailure
    }
}

impl std::fmt::Display for ForkResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// Default reason phrase for well-known codes.
pub fn default_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => match StatusClass::of(code) {
            Some(StatusClass::Provisional) => "Provisional",
            Some(StatusClass::Success) => "Success",
            Some(StatusClass::Redirection) => "Redirection",
            Some(StatusClass::ClientError) => "Client Error",
            Some(StatusClass::ServerError) => "Server Error",
            Some(StatusClass::GlobalFailure) => "Global Failure",
            None => "Unknown",
        },
    }
}
