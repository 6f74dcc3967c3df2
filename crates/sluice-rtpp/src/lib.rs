// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RTPProxy control protocol client.
//!
//! Speaks the newline-terminated ASCII rtpp protocol over a UDP or UNIX
//! datagram socket. Every command carries a random cookie; a single reader
//! task demultiplexes replies back to their callers, so commands may be
//! issued concurrently from any task.
//!
//! Reply forms tolerated: bare port (`40000`), port plus learned address
//! (`40000 203.0.113.9`), `0`/`OK` acknowledgements, and `E<code>` errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use smol_str::SmolStr;
use thiserror::Error;
use tokio::net::UdpSocket;
#[cfg(unix)]
use tokio::net::UnixDatagram;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, warn};

/// Per-command reply timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Attempts per command before the backend is declared unavailable.
const COMMAND_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum RtppError {
    /// No reply after all attempts: the relay is down or unreachable.
    #[error("media backend unavailable after {attempts} attempts")]
    BackendUnavailable { attempts: u32 },
    /// The relay answered `E<code>`.
    #[error("rtpproxy error E{0}")]
    Session(u32),
    /// Reply arrived but could not be understood.
    #[error("unparseable rtpproxy reply: {0:?}")]
    Malformed(String),
    #[error("control socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Where the rtpproxy control socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddress {
    Udp(std::net::SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ControlAddress {
    /// Parses `udp:host:port`, `unix:/path`, or a bare `host:port`.
    pub fn parse(raw: &str) -> Option<ControlAddress> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("udp:") {
            return rest.parse().ok().map(ControlAddress::Udp);
        }
        #[cfg(unix)]
        if let Some(rest) = raw.strip_prefix("unix:") {
            return Some(ControlAddress::Unix(PathBuf::from(rest)));
        }
        raw.parse().ok().map(ControlAddress::Udp)
    }
}

enum ControlSocket {
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixDatagram),
}

impl ControlSocket {
    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        match self {
            ControlSocket::Udp(socket) => socket.send(payload).await.map(|_| ()),
            #[cfg(unix)]
            ControlSocket::Unix(socket) => socket.send(payload).await.map(|_| ()),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ControlSocket::Udp(socket) => socket.recv(buf).await,
            #[cfg(unix)]
            ControlSocket::Unix(socket) => socket.recv(buf).await,
        }
    }
}

struct ClientInner {
    socket: ControlSocket,
    pending: DashMap<SmolStr, oneshot::Sender<String>>,
    timeout: Duration,
    attempts: u32,
}

/// Handle to the shared control socket; clone freely.
#[derive(Clone)]
pub struct RtppClient {
    inner: Arc<ClientInner>,
}

impl RtppClient {
    /// Connects the control socket and starts the reply reader.
    pub async fn connect(address: &ControlAddress) -> Result<RtppClient, RtppError> {
        Self::connect_with_policy(address, COMMAND_TIMEOUT, COMMAND_ATTEMPTS).await
    }

    /// Connects with an explicit retry policy.
    pub async fn connect_with_policy(
        address: &ControlAddress,
        timeout: Duration,
        attempts: u32,
    ) -> Result<RtppClient, RtppError> {
        let socket = match address {
            ControlAddress::Udp(addr) => {
                let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                ControlSocket::Udp(socket)
            }
            #[cfg(unix)]
            ControlAddress::Unix(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                ControlSocket::Unix(socket)
            }
        };
        let client = RtppClient {
            inner: Arc::new(ClientInner {
                socket,
                pending: DashMap::new(),
                timeout,
                attempts: attempts.max(1),
            }),
        };
        client.spawn_reader();
        Ok(client)
    }

    fn spawn_reader(&self) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let strong = match inner.upgrade() {
                    Some(strong) => strong,
                    None => break,
                };
                let n = match strong.socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(%e, "rtpproxy control socket read failed");
                        break;
                    }
                };
                let reply = String::from_utf8_lossy(&buf[..n]);
                let line = reply.trim_end_matches(['\r', '\n']);
                let (cookie, result) = match line.split_once(' ') {
                    Some((cookie, result)) => (cookie, result.trim()),
                    None => (line, ""),
                };
                match strong.pending.remove(cookie) {
                    Some((_, tx)) => {
                        let _ = tx.send(result.to_owned());
                    }
                    None => {
                        debug!(cookie, "reply for unknown or timed-out cookie dropped");
                    }
                }
            }
        });
    }

    /// Create the offer-side of a relay session; returns the allocated RTP port.
    pub async fn offer(&self, call_id: &str, from_tag: &str) -> Result<u16, RtppError> {
        let call_id = sanitize_token(call_id);
        let from_tag = sanitize_token(from_tag);
        let reply = self
            .send_command('V', &format!("{} {}", call_id, from_tag))
            .await?;
        parse_port(&reply)
    }

    /// Complete the answer-side of a relay session; returns the second port.
    pub async fn answer(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
    ) -> Result<u16, RtppError> {
        let call_id = sanitize_token(call_id);
        let from_tag = sanitize_token(from_tag);
        let to_tag = sanitize_token(to_tag);
        let reply = self
            .send_command('V', &format!("{} {} {}", call_id, from_tag, to_tag))
            .await?;
        parse_port(&reply)
    }

    /// Re-point an existing session at a newly learned peer address.
    pub async fn update(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        peer: std::net::SocketAddr,
    ) -> Result<u16, RtppError> {
        let call_id = sanitize_token(call_id);
        let from_tag = sanitize_token(from_tag);
        let to_tag = sanitize_token(to_tag);
        let reply = self
            .send_command(
                'U',
                &format!("{} {} {} {}:{}", call_id, from_tag, to_tag, peer.ip(), peer.port()),
            )
            .await?;
        parse_port(&reply)
    }

    /// Tear down a relay session. Any non-error reply counts as success.
    pub async fn delete(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
    ) -> Result<(), RtppError> {
        let call_id = sanitize_token(call_id);
        let from_tag = sanitize_token(from_tag);
        let to_tag = sanitize_token(to_tag);
        let reply = self
            .send_command('D', &format!("{} {} {}", call_id, from_tag, to_tag))
            .await?;
        check_error(&reply)?;
        Ok(())
    }

    /// Liveness probe; returns the implementation info string.
    pub async fn probe(&self) -> Result<String, RtppError> {
        let reply = self.send_command('I', "").await?;
        check_error(&reply)?;
        Ok(reply)
    }

    /// Sends `<cmd><cookie> <args>\n` and awaits the cookie-matched reply,
    /// retrying with a fresh cookie per attempt.
    async fn send_command(&self, cmd: char, args: &str) -> Result<String, RtppError> {
        for _attempt in 0..self.inner.attempts {
            let cookie = random_cookie();
            let (tx, rx) = oneshot::channel();
            self.inner.pending.insert(cookie.clone(), tx);

            let line = if args.is_empty() {
                format!("{}{}\n", cmd, cookie)
            } else {
                format!("{}{} {}\n", cmd, cookie, args)
            };
            if let Err(e) = self.inner.socket.send(line.as_bytes()).await {
                self.inner.pending.remove(&cookie);
                return Err(RtppError::Socket(e));
            }

            match time::timeout(self.inner.timeout, rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                // Reader died; give up immediately.
                Ok(Err(_)) => break,
                Err(_) => {
                    self.inner.pending.remove(&cookie);
                    debug!(cmd = %cmd, "rtpproxy command timed out; retrying");
                }
            }
        }
        Err(RtppError::BackendUnavailable {
            attempts: self.inner.attempts,
        })
    }
}

/// Replaces whitespace and control characters, which the rtpp wire format
/// cannot carry, with underscores.
fn sanitize_token(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn check_error(reply: &str) -> Result<(), RtppError> {
    let first = reply.split_whitespace().next().unwrap_or("");
    if let Some(code) = first.strip_prefix('E') {
        let code = code.parse::<u32>().unwrap_or(0);
        return Err(RtppError::Session(code));
    }
    Ok(())
}

/// Reads the allocated port from a success reply, ignoring any trailing
/// fields (long-form replies carry the learned address after the port).
fn parse_port(reply: &str) -> Result<u16, RtppError> {
    check_error(reply)?;
    reply
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u16>().ok())
        .ok_or_else(|| RtppError::Malformed(reply.to_owned()))
}

fn random_cookie() -> SmolStr {
    let token: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    SmolStr::new(token)
}
