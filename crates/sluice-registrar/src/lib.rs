// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §10 REGISTER handling with an in-memory location service.
//!
//! One binding per AoR: a new REGISTER supersedes the previous contact.
//! The caller applies the NAT contact rewrite before handing the request
//! over, so the stored contact is already the reachable one; the observed
//! source address is kept alongside it as the next-hop for outbound
//! requests.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sluice_auth::{AuthOutcome, CredentialStore, DigestAuthenticator};
use sluice_core::{
    contact_value, uri_from_header, with_tag, Headers, Request, Response, SipUri, StatusLine,
};
use sluice_parse::expires_value;
use smol_str::SmolStr;
use tracing::{info, warn};

/// A registration binding for one AoR.
#[derive(Debug, Clone)]
pub struct Binding {
    /// AoR in `user@host` form.
    pub aor: SmolStr,
    /// Reachable contact URI (NAT-corrected).
    pub contact: SipUri,
    /// Transport source the REGISTER arrived from.
    pub source: SocketAddr,
    /// Absolute expiry.
    pub expires_at: Instant,
    /// Call-ID of the registering dialog, for CSeq-ordering checks.
    pub call_id: SmolStr,
    pub cseq: u32,
}

impl Binding {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// What a REGISTER did, for event emission by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// 401 challenge issued (fresh or stale nonce).
    Challenged { stale: bool },
    /// 403 digest failure.
    AuthFailed,
    /// Binding created or refreshed.
    Bound { aor: SmolStr, expires: u32 },
    /// Binding(s) removed via Expires: 0 or wildcard.
    Removed { aor: SmolStr },
    /// Query (no Contact header): current binding echoed.
    Queried,
    /// Request was structurally unusable (bad To URI / Contact).
    Invalid,
}

/// Result of processing one REGISTER.
#[derive(Debug)]
pub struct RegisterResult {
    pub response: Response,
    pub outcome: RegisterOutcome,
}

/// Registrar with optional digest authentication.
pub struct Registrar<S: CredentialStore> {
    bindings: DashMap<SmolStr, Binding>,
    authenticator: Option<DigestAuthenticator<S>>,
    default_expiry: Duration,
    max_expiry: Duration,
}

impl<S: CredentialStore> Registrar<S> {
    pub fn new(authenticator: Option<DigestAuthenticator<S>>) -> Self {
        Self {
            bindings: DashMap::new(),
            authenticator,
            default_expiry: Duration::from_secs(3600),
            max_expiry: Duration::from_secs(3600),
        }
    }

    pub fn with_max_expiry(mut self, max: Duration) -> Self {
        self.max_expiry = max;
        self.default_expiry = self.default_expiry.min(max);
        self
    }

    /// Current live binding for an AoR; lapsed bindings are dropped on read.
    pub fn lookup(&self, aor: &str) -> Option<Binding> {
        let binding = self.bindings.get(aor)?.clone();
        if binding.is_expired() {
            drop(binding);
            self.bindings.remove(aor);
            return None;
        }
        Some(binding)
    }

    /// Removes lapsed bindings; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| !binding.is_expired());
        before - self.bindings.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Processes a REGISTER whose Contact has already been NAT-corrected.
    pub fn handle_register(&self, request: &Request, source: SocketAddr) -> RegisterResult {
        if let Some(auth) = &self.authenticator {
            match auth.verify(request) {
                AuthOutcome::Ok => {}
                AuthOutcome::Challenge => {
                    return self.challenge(request, false);
                }
                AuthOutcome::StaleNonce => {
                    return self.challenge(request, true);
                }
                AuthOutcome::Rejected => {
                    warn!(source = %source, "REGISTER digest verification failed");
                    return RegisterResult {
                        response: self.simple_response(request, 403, "Forbidden"),
                        outcome: RegisterOutcome::AuthFailed,
                    };
                }
            }
        }

        let aor = match request.headers.get("To").and_then(|to| uri_from_header(to)) {
            Some(uri) => uri.aor(),
            None => {
                return RegisterResult {
                    response: self.simple_response(request, 400, "Bad Request"),
                    outcome: RegisterOutcome::Invalid,
                };
            }
        };

        let contact_header = match request.headers.get("Contact") {
            Some(value) => value.clone(),
            None => {
                // Query form: report the current binding.
                let mut response = self.simple_response(request, 200, "OK");
                if let Some(binding) = self.lookup(&aor) {
                    let remaining = binding
                        .expires_at
                        .saturating_duration_since(Instant::now())
                        .as_secs();
                    response.headers.push(
                        "Contact".into(),
                        SmolStr::new(format!(
                            "{};expires={}",
                            contact_value(&binding.contact),
                            remaining
                        )),
                    );
                }
                return RegisterResult {
                    response,
                    outcome: RegisterOutcome::Queried,
                };
            }
        };

        let requested_expires = contact_param_expires(&contact_header)
            .or_else(|| expires_value(&request.headers));

        if contact_header.trim() == "*" {
            // Wildcard removal is only valid with Expires: 0.
            if requested_expires != Some(0) {
                return RegisterResult {
                    response: self.simple_response(request, 400, "Bad Request"),
                    outcome: RegisterOutcome::Invalid,
                };
            }
            self.bindings.remove(&aor);
            info!(%aor, "all bindings removed (wildcard)");
            let mut response = self.simple_response(request, 200, "OK");
            response.headers.push("Expires".into(), "0".into());
            return RegisterResult {
                response,
                outcome: RegisterOutcome::Removed { aor },
            };
        }

        let contact = match uri_from_header(&contact_header) {
            Some(uri) => uri,
            None => {
                return RegisterResult {
                    response: self.simple_response(request, 400, "Bad Request"),
                    outcome: RegisterOutcome::Invalid,
                };
            }
        };

        if requested_expires == Some(0) {
            self.bindings.remove(&aor);
            info!(%aor, "binding removed");
            let mut response = self.simple_response(request, 200, "OK");
            response.headers.push("Expires".into(), "0".into());
            return RegisterResult {
                response,
                outcome: RegisterOutcome::Removed { aor },
            };
        }

        let granted = requested_expires
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.default_expiry)
            .min(self.max_expiry);
        let granted_secs = granted.as_secs() as u32;

        let binding = Binding {
            aor: aor.clone(),
            contact: contact.clone(),
            source,
            expires_at: Instant::now() + granted,
            call_id: request
                .headers
                .get("Call-ID")
                .cloned()
                .unwrap_or_default(),
            cseq: sluice_parse::cseq_number(&request.headers).unwrap_or(0),
        };
        self.bindings.insert(aor.clone(), binding);
        info!(%aor, contact = %contact, source = %source, expires = granted_secs, "binding stored");

        let mut response = self.simple_response(request, 200, "OK");
        response.headers.push(
            "Contact".into(),
            SmolStr::new(format!("{};expires={}", contact_value(&contact), granted_secs)),
        );
        response
            .headers
            .push("Expires".into(), SmolStr::new(granted_secs.to_string()));
        RegisterResult {
            response,
            outcome: RegisterOutcome::Bound {
                aor,
                expires: granted_secs,
            },
        }
    }

    fn challenge(&self, request: &Request, stale: bool) -> RegisterResult {
        let auth = self
            .authenticator
            .as_ref()
            .expect("challenge requires an authenticator");
        let mut response = self.simple_response(request, 401, "Unauthorized");
        response
            .headers
            .push("WWW-Authenticate".into(), auth.challenge_value(stale));
        RegisterResult {
            response,
            outcome: RegisterOutcome::Challenged { stale },
        }
    }

    /// Response shell echoing the dialog-identifying headers, with a To tag.
    fn simple_response(&self, request: &Request, code: u16, reason: &str) -> Response {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via".into(), via.clone());
        }
        if let Some(from) = request.headers.get("From") {
            headers.push("From".into(), from.clone());
        }
        if let Some(to) = request.headers.get("To") {
            headers.push("To".into(), with_tag(to, &random_tag()));
        }
        if let Some(call_id) = request.headers.get("Call-ID") {
            headers.push("Call-ID".into(), call_id.clone());
        }
        if let Some(cseq) = request.headers.get("CSeq") {
            headers.push("CSeq".into(), cseq.clone());
        }
        Response::new(
            StatusLine::new(code, SmolStr::new(reason)),
            headers,
            Bytes::new(),
        )
    }
}

/// The `;expires=` parameter on a Contact header value, when present.
fn contact_param_expires(value: &str) -> Option<u32> {
    // Only look at parameters outside the angle brackets.
    let after = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    after.split(';').skip(1).find_map(|part| {
        let (name, v) = part.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("expires") {
            v.trim().parse().ok()
        } else {
            None
        }
    })
}

fn random_tag() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_auth::{authorization_value, MemoryCredentialStore};
    use sluice_core::{Method, RequestLine};

    fn source(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    fn register_request(
        aor: &str,
        contact: Option<&str>,
        expires: Option<&str>,
        auth: Option<String>,
    ) -> Request {
        let mut headers = Headers::new();
        headers.push("Via".into(), "SIP/2.0/UDP h;branch=z9hG4bKreg".into());
        headers.push("Max-Forwards".into(), "70".into());
        headers.push(
            "From".into(),
            SmolStr::new(format!("<sip:{}>;tag=regtag", aor)),
        );
        headers.push("To".into(), SmolStr::new(format!("<sip:{}>", aor)));
        headers.push("Call-ID".into(), "reg-call".into());
        headers.push("CSeq".into(), "1 REGISTER".into());
        if let Some(contact) = contact {
            headers.push("Contact".into(), SmolStr::new(contact));
        }
        if let Some(expires) = expires {
            headers.push("Expires".into(), SmolStr::new(expires));
        }
        if let Some(auth) = auth {
            headers.push("Authorization".into(), SmolStr::new(auth));
        }
        Request::new(
            RequestLine::new(Method::Register, SipUri::parse("sip:sluice.local").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn open_registrar() -> Registrar<MemoryCredentialStore> {
        Registrar::new(None)
    }

    fn authed_registrar() -> Registrar<MemoryCredentialStore> {
        let mut store = MemoryCredentialStore::new();
        store.add("1001", "secret");
        Registrar::new(Some(DigestAuthenticator::new("sluice.local", store)))
    }

    #[test]
    fn stores_binding_and_echoes_contact() {
        let registrar = open_registrar();
        let request = register_request(
            "1001@sluice.local",
            Some("<sip:1001@203.0.113.7:41002>"),
            Some("3600"),
            None,
        );
        let result = registrar.handle_register(&request, source("203.0.113.7:41002"));
        assert_eq!(result.response.start.code, 200);
        assert_eq!(
            result.response.headers.get("Contact").unwrap().as_str(),
            "<sip:1001@203.0.113.7:41002>;expires=3600"
        );
        assert!(matches!(result.outcome, RegisterOutcome::Bound { .. }));

        let binding = registrar.lookup("1001@sluice.local").expect("binding");
        assert_eq!(binding.contact.host.as_str(), "203.0.113.7");
        assert_eq!(binding.contact.port, Some(41002));
        assert_eq!(binding.source, source("203.0.113.7:41002"));
    }

    #[test]
    fn new_register_supersedes_prior_binding() {
        let registrar = open_registrar();
        let first = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            None,
            None,
        );
        registrar.handle_register(&first, source("10.0.0.10:5060"));
        let second = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.99:5062>"),
            None,
            None,
        );
        registrar.handle_register(&second, source("10.0.0.99:5062"));

        assert_eq!(registrar.binding_count(), 1);
        let binding = registrar.lookup("1001@sluice.local").unwrap();
        assert_eq!(binding.contact.host.as_str(), "10.0.0.99");
    }

    #[test]
    fn expires_zero_removes_binding() {
        let registrar = open_registrar();
        let create = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            None,
            None,
        );
        registrar.handle_register(&create, source("10.0.0.10:5060"));
        assert!(registrar.lookup("1001@sluice.local").is_some());

        let remove = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            Some("0"),
            None,
        );
        let result = registrar.handle_register(&remove, source("10.0.0.10:5060"));
        assert_eq!(result.response.start.code, 200);
        assert_eq!(
            result.response.headers.get("Expires").unwrap().as_str(),
            "0"
        );
        assert!(matches!(result.outcome, RegisterOutcome::Removed { .. }));
        assert!(registrar.lookup("1001@sluice.local").is_none());
    }

    #[test]
    fn wildcard_contact_removes_all() {
        let registrar = open_registrar();
        let create = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            None,
            None,
        );
        registrar.handle_register(&create, source("10.0.0.10:5060"));

        let wildcard = register_request("1001@sluice.local", Some("*"), Some("0"), None);
        let result = registrar.handle_register(&wildcard, source("10.0.0.10:5060"));
        assert_eq!(result.response.start.code, 200);
        assert!(registrar.lookup("1001@sluice.local").is_none());

        // Wildcard without Expires: 0 is malformed.
        let bad = register_request("1001@sluice.local", Some("*"), Some("60"), None);
        assert_eq!(
            registrar
                .handle_register(&bad, source("10.0.0.10:5060"))
                .response
                .start
                .code,
            400
        );
    }

    #[test]
    fn expiry_is_capped_at_server_max() {
        let registrar = open_registrar().with_max_expiry(Duration::from_secs(600));
        let request = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            Some("86400"),
            None,
        );
        let result = registrar.handle_register(&request, source("10.0.0.10:5060"));
        assert_eq!(
            result.response.headers.get("Expires").unwrap().as_str(),
            "600"
        );
    }

    #[test]
    fn contact_param_expires_wins_over_header() {
        let registrar = open_registrar();
        let request = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>;expires=120"),
            Some("3600"),
            None,
        );
        let result = registrar.handle_register(&request, source("10.0.0.10:5060"));
        assert_eq!(
            result.response.headers.get("Expires").unwrap().as_str(),
            "120"
        );
    }

    #[test]
    fn challenge_then_success_round_trip() {
        let registrar = authed_registrar();
        let bare = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            None,
            None,
        );
        let result = registrar.handle_register(&bare, source("10.0.0.10:5060"));
        assert_eq!(result.response.start.code, 401);
        let challenge = result
            .response
            .headers
            .get("WWW-Authenticate")
            .expect("challenge header")
            .clone();
        let nonce = challenge
            .split("nonce=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .expect("nonce");

        let authed = register_request(
            "1001@sluice.local",
            Some("<sip:1001@10.0.0.10:5060>"),
            None,
            Some(authorization_value(
                "1001",
                "sluice.local",
                "secret",
                &Method::Register,
                "sip:sluice.local",
                nonce,
            )),
        );
        let result = registrar.handle_register(&authed, source("10.0.0.10:5060"));
        assert_eq!(result.response.start.code, 200);
        assert!(registrar.lookup("1001@sluice.local").is_some());
    }

    #[test]
    fn bad_digest_is_forbidden() {
        let registrar = authed_registrar();
        let nonce = registrar
            .authenticator
            .as_ref()
            .unwrap()
            .nonces
            .generate();
        let result = registrar.handle_register(
            &register_request(
                "1001@sluice.local",
                Some("<sip:1001@10.0.0.10:5060>"),
                None,
                Some(authorization_value(
                    "1001",
                    "sluice.local",
                    "wrong-password",
                    &Method::Register,
                    "sip:sluice.local",
                    &nonce,
                )),
            ),
            source("10.0.0.10:5060"),
        );
        assert_eq!(result.response.start.code, 403);
        assert_eq!(result.outcome, RegisterOutcome::AuthFailed);
    }

    #[test]
    fn unknown_nonce_gets_fresh_challenge() {
        let registrar = authed_registrar();
        let result = registrar.handle_register(
            &register_request(
                "1001@sluice.local",
                Some("<sip:1001@10.0.0.10:5060>"),
                None,
                Some(authorization_value(
                    "1001",
                    "sluice.local",
                    "secret",
                    &Method::Register,
                    "sip:sluice.local",
                    "nonce-from-before-restart",
                )),
            ),
            source("10.0.0.10:5060"),
        );
        assert_eq!(result.response.start.code, 401);
        assert!(result
            .response
            .headers
            .get("WWW-Authenticate")
            .is_some());
        assert!(matches!(
            result.outcome,
            RegisterOutcome::Challenged { stale: false }
        ));
    }

    #[test]
    fn query_without_contact_reports_binding() {
        let registrar = open_registrar();
        registrar.handle_register(
            &register_request(
                "1001@sluice.local",
                Some("<sip:1001@10.0.0.10:5060>"),
                Some("600"),
                None,
            ),
            source("10.0.0.10:5060"),
        );
        let result = registrar.handle_register(
            &register_request("1001@sluice.local", None, None, None),
            source("10.0.0.10:5060"),
        );
        assert_eq!(result.response.start.code, 200);
        assert!(result
            .response
            .headers
            .get("Contact")
            .unwrap()
            .contains("sip:1001@10.0.0.10:5060"));
    }
}
