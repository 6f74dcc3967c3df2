// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Async SIP transport: a UDP listener (primary) and an optional TCP
//! listener with Content-Length framing.
//!
//! The transport never interprets SIP beyond framing. Inbound bytes are
//! delivered as [`InboundPacket`]s carrying the observed source address so
//! upper layers can do symmetric response routing; send failures are
//! reported to the caller and never retried here.
//!
//! # Example
//! ```no_run
//! use sluice_transport::{run_udp, InboundPacket};
//! use tokio::sync::mpsc;
//! use tokio::net::UdpSocket;
//! use std::sync::Arc;
//! # async fn example() -> anyhow::Result<()> {
//! let socket = Arc::new(UdpSocket::bind("0.0.0.0:5060").await?);
//! let (tx, mut rx) = mpsc::channel::<InboundPacket>(100);
//! tokio::spawn(run_udp(socket, tx));
//! while let Some(packet) = rx.recv().await {
//!     // feed the parser
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Maximum size of SIP headers before `\r\n\r\n` on a stream (64 KB).
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum body size accepted from a stream based on Content-Length (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Maximum number of concurrent inbound TCP sessions.
const MAX_CONCURRENT_SESSIONS: usize = 1024;

/// Idle timeout before a TCP session is closed.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for outbound TCP connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which transport carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    /// Via header transport parameter value.
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }

    /// Reliable transports disable retransmission timers.
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp)
    }
}

/// A framed message received by a listener, with source metadata.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub payload: Bytes,
    /// Write side of the originating TCP connection, when there is one, so
    /// responses ride the same connection.
    pub stream: Option<mpsc::Sender<Bytes>>,
}

/// Runs the UDP receive loop, forwarding whole datagrams to the channel.
pub async fn run_udp(socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundPacket>) -> Result<()> {
    let bind = socket.local_addr()?;
    info!(%bind, "listening (udp)");
    let mut buf = vec![0u8; 65_535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                if n == buf.len() {
                    warn!(%peer, max = n, "udp datagram likely truncated (buffer full)");
                }
                let packet = InboundPacket {
                    transport: TransportKind::Udp,
                    peer,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                    stream: None,
                };
                if tx.send(packet).await.is_err() {
                    error!("receiver dropped; shutting down udp loop");
                    break;
                }
            }
            Err(e) => {
                error!(%e, "udp recv_from error");
            }
        }
    }
    Ok(())
}

/// Sends a UDP datagram from an existing bound socket.
pub async fn send_udp(socket: &UdpSocket, to: &SocketAddr, data: &[u8]) -> Result<()> {
    socket.send_to(data, to).await?;
    Ok(())
}

/// Accepts TCP connections and streams framed messages to the channel.
pub async fn run_tcp(bind: &str, tx: mpsc::Sender<InboundPacket>) -> Result<()> {
    let bind_addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow!("invalid bind address: {}", e))?;

    let listener = {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(128)?;

        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener)?
    };
    info!(%bind, "listening (tcp)");

    let limiter = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_SESSIONS));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(%e, "tcp accept error");
                continue;
            }
        };
        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%peer, "tcp session limit reached; dropping connection");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_tcp_session(peer, stream, tx).await;
        });
    }
}

/// Connects to the destination and writes the bytes over TCP.
pub async fn send_tcp(to: &SocketAddr, data: &[u8]) -> Result<()> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(to))
        .await
        .map_err(|_| anyhow!("tcp connect timeout to {}", to))??;
    stream.write_all(data).await?;
    Ok(())
}

/// Per-connection loop: reads, frames on Content-Length, forwards frames,
/// and drains an outbound channel back onto the socket.
async fn run_tcp_session(peer: SocketAddr, stream: TcpStream, tx: mpsc::Sender<InboundPacket>) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(32);

    let write_task = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            // An empty payload is the close sentinel: upper layers use it
            // to poison a connection that produced unparseable SIP.
            if payload.is_empty() {
                break;
            }
            if let Err(e) = writer.write_all(&payload).await {
                warn!(%peer, %e, "tcp write error");
                break;
            }
        }
    });

    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut read_buf = vec![0u8; 8 * 1024];
    loop {
        let read = tokio::time::timeout(SESSION_IDLE_TIMEOUT, reader.read(&mut read_buf)).await;
        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!(%peer, %e, "tcp read error");
                break;
            }
            Err(_) => {
                warn!(%peer, "tcp session idle timeout");
                break;
            }
        };
        buffer.extend_from_slice(&read_buf[..n]);

        loop {
            match extract_frame(&mut buffer) {
                Ok(Some(frame)) => {
                    let packet = InboundPacket {
                        transport: TransportKind::Tcp,
                        peer,
                        payload: frame,
                        stream: Some(out_tx.clone()),
                    };
                    if tx.send(packet).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing violations poison the stream; close it.
                    warn!(%peer, %e, "tcp framing error; closing connection");
                    write_task.abort();
                    return;
                }
            }
        }
    }
    write_task.abort();
}

/// Extracts one complete SIP message from the stream buffer.
///
/// Returns `Ok(None)` when more bytes are needed. Messages are delimited by
/// the `\r\n\r\n` header terminator plus the declared Content-Length.
fn extract_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    let delim = b"\r\n\r\n";
    let head_end = match buffer
        .windows(delim.len())
        .position(|window| window == delim)
    {
        Some(pos) => pos,
        None => {
            if buffer.len() > MAX_HEADER_SIZE {
                return Err(anyhow!("headers exceed {} bytes", MAX_HEADER_SIZE));
            }
            return Ok(None);
        }
    };

    let head = std::str::from_utf8(&buffer[..head_end])
        .map_err(|_| anyhow!("non-UTF8 header block"))?;
    let body_len = content_length_of(head)?;
    if body_len > MAX_BODY_SIZE {
        return Err(anyhow!("declared body of {} bytes is too large", body_len));
    }

    let total = head_end + delim.len() + body_len;
    if buffer.len() < total {
        return Ok(None);
    }

    let frame = Bytes::copy_from_slice(&buffer[..total]);
    buffer.advance(total);
    Ok(Some(frame))
}

/// Scans the raw header block for Content-Length (or compact `l`).
/// Absence means 0; an unparseable value is a framing error on TCP.
fn content_length_of(head: &str) -> Result<usize> {
    for line in head.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                return value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| anyhow!("unparseable Content-Length"));
            }
        }
    }
    Ok(0)
}
