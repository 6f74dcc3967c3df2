// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

/// SIP request methods understood by the engine.
///
/// Methods outside the core set are carried as [`Method::Extension`] so the
/// transaction layer can still run them as opaque non-INVITE transactions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Message,
    Update,
    Notify,
    Extension(SmolStr),
}

impl Method {
    /// Maps a method token to a [`Method`], case-sensitively per RFC 3261.
    pub fn from_token(token: &str) -> Method {
        match token {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "UPDATE" => Method::Update,
            "NOTIFY" => Method::Notify,
            other => Method::Extension(SmolStr::new(other)),
        }
    }

    /// Returns the wire token for the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Notify => "NOTIFY",
            Method::Extension(name) => name.as_str(),
        }
    }

    /// Returns `true` for methods that create an INVITE transaction.
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_core_methods() {
        for token in [
            "INVITE", "ACK", "BYE", "CANCEL", "REGISTER", "OPTIONS", "INFO", "MESSAGE", "UPDATE",
            "NOTIFY",
        ] {
            assert_eq!(Method::from_token(token).as_str(), token);
        }
    }

    #[test]
    fn unknown_method_is_extension() {
        let method = Method::from_token("PUBLISH");
        assert_eq!(method, Method::Extension(SmolStr::new("PUBLISH")));
        assert_eq!(method.as_str(), "PUBLISH");
    }

    #[test]
    fn method_matching_is_case_sensitive() {
        assert_ne!(Method::from_token("invite"), Method::Invite);
    }
}
