// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine error kinds and their SIP status mappings.
//!
//! Errors below the dialog layer surface as values; the call engine is the
//! single place that turns them into the final status the A-leg sees.

use sluice_media::MediaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed message")]
    MalformedMessage,
    #[error("no binding for {0}")]
    UnknownAor(String),
    #[error("media backend unavailable")]
    MediaBackendUnavailable,
    #[error("media session error E{0}")]
    MediaSession(u32),
    #[error("transaction timed out")]
    TransactionTimeout,
    #[error("no ACK within the answer window")]
    AnswerTimeout,
    #[error("Max-Forwards reached zero")]
    TooManyHops,
    #[error("peer transport failure")]
    PeerTransportFailure,
}

impl EngineError {
    /// The SIP status this error maps to on the A-leg.
    pub fn sip_status(&self) -> (u16, &'static str) {
        match self {
            EngineError::MalformedMessage => (400, "Bad Request"),
            EngineError::UnknownAor(_) => (404, "Not Found"),
            EngineError::MediaBackendUnavailable => (503, "Service Unavailable"),
            EngineError::MediaSession(_) => (488, "Not Acceptable Here"),
            EngineError::TransactionTimeout => (408, "Request Timeout"),
            EngineError::AnswerTimeout => (500, "Server Internal Error"),
            EngineError::TooManyHops => (483, "Too Many Hops"),
            EngineError::PeerTransportFailure => (408, "Request Timeout"),
        }
    }

    /// The CALL_END reason string consumers see.
    pub fn end_reason(&self) -> &'static str {
        match self {
            EngineError::MalformedMessage => "MALFORMED",
            EngineError::UnknownAor(_) => "UNKNOWN_AOR",
            EngineError::MediaBackendUnavailable => "MEDIA_UNAVAILABLE",
            EngineError::MediaSession(_) => "MEDIA_REJECTED",
            EngineError::TransactionTimeout => "NO_ANSWER",
            EngineError::AnswerTimeout => "ACK_TIMEOUT",
            EngineError::TooManyHops => "LOOP",
            EngineError::PeerTransportFailure => "TRANSPORT_FAILURE",
        }
    }
}

impl From<MediaError> for EngineError {
    fn from(err: MediaError) -> Self {
        match err {
            err if err.backend_unavailable() => EngineError::MediaBackendUnavailable,
            MediaError::Relay(sluice_rtpp::RtppError::Session(code)) => {
                EngineError::MediaSession(code)
            }
            MediaError::NoAudio => EngineError::MediaSession(0),
            _ => EngineError::MediaBackendUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mappings_match_the_policy_table() {
        assert_eq!(EngineError::UnknownAor("x".into()).sip_status().0, 404);
        assert_eq!(EngineError::MediaBackendUnavailable.sip_status().0, 503);
        assert_eq!(EngineError::MediaSession(7).sip_status().0, 488);
        assert_eq!(EngineError::TransactionTimeout.sip_status().0, 408);
        assert_eq!(EngineError::AnswerTimeout.sip_status().0, 500);
        assert_eq!(EngineError::TooManyHops.sip_status().0, 483);
    }

    #[test]
    fn media_errors_convert_by_kind() {
        let unavailable = MediaError::Relay(sluice_rtpp::RtppError::BackendUnavailable {
            attempts: 3,
        });
        assert!(matches!(
            EngineError::from(unavailable),
            EngineError::MediaBackendUnavailable
        ));
        let rejected = MediaError::Relay(sluice_rtpp::RtppError::Session(3));
        assert!(matches!(
            EngineError::from(rejected),
            EngineError::MediaSession(3)
        ));
    }
}
