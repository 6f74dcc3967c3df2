// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport wiring: listeners in, dispatcher out.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use sluice_transaction::{TransportContext, TransportDispatcher};
use sluice_transport::{send_tcp, send_udp, TransportKind};
use tokio::net::UdpSocket;

/// Sends outbound messages over the shared UDP socket or, for TCP, back
/// down the originating connection (falling back to a fresh connection).
pub struct SluiceTransportDispatcher {
    udp_socket: Arc<UdpSocket>,
}

impl SluiceTransportDispatcher {
    pub fn new(udp_socket: Arc<UdpSocket>) -> Self {
        Self { udp_socket }
    }
}

#[async_trait]
impl TransportDispatcher for SluiceTransportDispatcher {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        match ctx.transport {
            TransportKind::Udp => {
                send_udp(self.udp_socket.as_ref(), &ctx.peer, &payload).await
            }
            TransportKind::Tcp => match &ctx.stream {
                Some(stream) => stream
                    .send(payload)
                    .await
                    .map_err(|_| anyhow::anyhow!("tcp connection closed")),
                None => send_tcp(&ctx.peer, &payload).await,
            },
        }
    }
}
