// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Why a branch was actively terminated by the fork rather than completing on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The call was accepted on another branch of the same fork.
    AcceptedElsewhere,
    /// The call was definitively declined on another branch.
    DeclinedElsewhere,
    /// The caller cancelled the call.
    Standard,
}

impl CancelReason {
    /// Low-cardinality label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcceptedElsewhere => "accepted_elsewhere",
            Self::DeclinedElsewhere => "declined_elsewhere",
            Self::Standard => "standard",
        }
    }

    /// Value of the `Reason` header (RFC 3326) to attach to the CANCEL.
    ///
    /// `Standard` yields `None`: the caller's own CANCEL is relayed as-is.
    pub fn reason_header(self) -> Option<SmolStr> {
        match self {
            Self::AcceptedElsewhere => Some(SmolStr::new(
                "SIP;cause=200;text=\"Call completed elsewhere\"",
            )),
            Self::DeclinedElsewhere => {
                Some(SmolStr::new("SIP;cause=600;text=\"Busy Everywhere\""))
            }
            Self::Standard => None,
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown cancellation reason label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCancelReason(pub String);

impl std::fmt::Display for UnknownCancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown cancellation reason: {}", self.0)
    }
}

impl std::error::Error for UnknownCancelReason {}

impl FromStr for CancelReason {
    type Err = UnknownCancelReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted_elsewhere" => Ok(Self::AcceptedElsewhere),
            "declined_elsewhere" => Ok(Self::DeclinedElsewhere),
            "standard" => Ok(Self::Standard),
            other => Err(UnknownCancelReason(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_reasons_to_reason_header() {
        assert_eq!(
            CancelReason::AcceptedElsewhere.reason_header().unwrap(),
            "SIP;cause=200;text=\"Call completed elsewhere\""
        );
        assert_eq!(
            CancelReason::DeclinedElsewhere.reason_header().unwrap(),
            "SIP;cause=600;text=\"Busy Everywhere\""
        );
        assert!(CancelReason::Standard.reason_header().is_none());
    }

    #[test]
    fn parses_labels() {
        for reason in [
            CancelReason::AcceptedElsewhere,
            CancelReason::DeclinedElsewhere,
            CancelReason::Standard,
        ] {
            assert_eq!(reason.as_str().parse::<CancelReason>(), Ok(reason));
        }
        assert_eq!(
            " Accepted_Elsewhere ".parse::<CancelReason>(),
            Ok(CancelReason::AcceptedElsewhere)
        );
        assert!("hangup".parse::<CancelReason>().is_err());
    }
}
