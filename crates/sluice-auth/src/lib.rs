// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! MD5 digest authentication (RFC 3261 §22 / RFC 2617).
//!
//! Issues nonce challenges, verifies Authorization headers, and tells a
//! stale nonce apart from bad credentials so the registrar can answer
//! 401 `stale=true` versus 403.

use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sluice_core::{Method, Request};
use smol_str::SmolStr;
use tracing::debug;

/// Shared secret for one user.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: SmolStr,
    pub password: SmolStr,
}

/// Credential lookup seam; the daemon backs this with its config users map.
pub trait CredentialStore: Send + Sync {
    fn fetch(&self, username: &str) -> Option<Credentials>;
}

/// In-memory credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    creds: Vec<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, username: &str, password: &str) {
        self.creds.push(Credentials {
            username: SmolStr::new(username),
            password: SmolStr::new(password),
        });
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn fetch(&self, username: &str) -> Option<Credentials> {
        self.creds
            .iter()
            .find(|c| c.username == username)
            .cloned()
    }
}

/// Nonce table with expiry. Nonces are random, timestamped server-side, and
/// opaque to the client.
#[derive(Debug)]
pub struct NonceManager {
    nonces: Arc<DashMap<SmolStr, Instant>>,
    ttl: Duration,
}

/// Nonce verification result; expired and unknown both demand a fresh
/// challenge but only expired sets `stale=true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceState {
    Valid,
    Expired,
    Unknown,
}

impl NonceManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            nonces: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Mints and remembers a fresh nonce.
    pub fn generate(&self) -> SmolStr {
        let token: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let nonce = SmolStr::new(token);
        self.nonces.insert(nonce.clone(), Instant::now());
        nonce
    }

    pub fn check(&self, value: &str) -> NonceState {
        match self.nonces.get(value) {
            Some(entry) if entry.elapsed() <= self.ttl => NonceState::Valid,
            Some(_) => NonceState::Expired,
            None => NonceState::Unknown,
        }
    }

    /// Drops expired nonces.
    pub fn cleanup(&self) {
        let ttl = self.ttl;
        self.nonces.retain(|_, created| created.elapsed() <= ttl);
    }

    pub fn count(&self) -> usize {
        self.nonces.len()
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Outcome of verifying a request's Authorization header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Digest verified.
    Ok,
    /// No usable Authorization header, or a nonce this server never minted:
    /// answer 401 with a fresh challenge.
    Challenge,
    /// The nonce expired but the digest may be fine: 401 with `stale=true`.
    StaleNonce,
    /// Unknown user or digest mismatch: 403.
    Rejected,
}

/// MD5 digest authenticator bound to one realm.
pub struct DigestAuthenticator<S: CredentialStore> {
    pub realm: SmolStr,
    pub store: S,
    pub nonces: NonceManager,
}

impl<S: CredentialStore> DigestAuthenticator<S> {
    pub fn new(realm: &str, store: S) -> Self {
        Self {
            realm: SmolStr::new(realm),
            store,
            nonces: NonceManager::default(),
        }
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonces = NonceManager::new(ttl);
        self
    }

    /// Builds the `WWW-Authenticate` value for a 401, minting a fresh nonce.
    pub fn challenge_value(&self, stale: bool) -> SmolStr {
        let nonce = self.nonces.generate();
        let mut value = String::new();
        let _ = write!(
            value,
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
            self.realm, nonce
        );
        if stale {
            value.push_str(", stale=true");
        }
        SmolStr::new(value)
    }

    /// Verifies the request's Authorization header against the store.
    pub fn verify(&self, request: &Request) -> AuthOutcome {
        let auth = match request.headers.get("Authorization") {
            Some(value) => value,
            None => return AuthOutcome::Challenge,
        };
        let params = match DigestParams::parse(auth) {
            Some(params) => params,
            None => return AuthOutcome::Challenge,
        };

        if !params.realm.eq_ignore_ascii_case(&self.realm) {
            debug!(realm = %params.realm, "digest realm mismatch");
            return AuthOutcome::Rejected;
        }

        match self.nonces.check(&params.nonce) {
            NonceState::Valid => {}
            NonceState::Expired => return AuthOutcome::StaleNonce,
            // A nonce this server never issued earns a fresh challenge, not
            // a rejection: the UA may simply have restarted mid-dialog.
            NonceState::Unknown => return AuthOutcome::Challenge,
        }

        let creds = match self.store.fetch(&params.username) {
            Some(creds) => creds,
            None => {
                debug!(username = %params.username, "digest for unknown user");
                return AuthOutcome::Rejected;
            }
        };

        let expected = digest_response(
            &params.username,
            &self.realm,
            &creds.password,
            &request.start.method,
            &params.uri,
            &params.nonce,
            params.qop_triplet(),
        );
        if constant_time_eq(expected.as_bytes(), params.response.as_bytes()) {
            AuthOutcome::Ok
        } else {
            AuthOutcome::Rejected
        }
    }
}

/// Computes the RFC 2617 digest response value.
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &Method,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));
    let input = match qop {
        Some((qop, nc, cnonce)) => {
            format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2)
        }
        None => format!("{}:{}:{}", ha1, nonce, ha2),
    };
    md5_hex(&input)
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Compares two byte strings without early exit on mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// The Digest parameters the verifier needs from an Authorization header.
struct DigestParams {
    username: SmolStr,
    realm: SmolStr,
    nonce: SmolStr,
    uri: SmolStr,
    response: SmolStr,
    qop: Option<SmolStr>,
    nc: Option<SmolStr>,
    cnonce: Option<SmolStr>,
}

impl DigestParams {
    fn parse(value: &str) -> Option<DigestParams> {
        let rest = value.trim().strip_prefix("Digest")?.trim_start();
        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut qop = None;
        let mut nc = None;
        let mut cnonce = None;

        for part in split_digest_params(rest) {
            let (name, raw) = match part.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            let val = SmolStr::new(raw.trim().trim_matches('"'));
            match name.trim().to_ascii_lowercase().as_str() {
                "username" => username = Some(val),
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "uri" => uri = Some(val),
                "response" => response = Some(val),
                "qop" => qop = Some(val),
                "nc" => nc = Some(val),
                "cnonce" => cnonce = Some(val),
                _ => {}
            }
        }

        Some(DigestParams {
            username: username?,
            realm: realm?,
            nonce: nonce?,
            uri: uri?,
            response: response?,
            qop,
            nc,
            cnonce,
        })
    }

    fn qop_triplet(&self) -> Option<(&str, &str, &str)> {
        match (&self.qop, &self.nc, &self.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => {
                Some((qop.as_str(), nc.as_str(), cnonce.as_str()))
            }
            _ => None,
        }
    }
}

/// Splits digest parameters on commas outside quoted strings.
fn split_digest_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts
}

/// Builds a client Authorization header value; used by the test suite to
/// play the UA side of a challenge round.
pub fn authorization_value(
    username: &str,
    realm: &str,
    password: &str,
    method: &Method,
    uri: &str,
    nonce: &str,
) -> String {
    let response = digest_response(username, realm, password, method, uri, nonce, None);
    format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        username, realm, nonce, uri, response
    )
}
