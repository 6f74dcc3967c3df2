// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! sluiced engine internals, exposed as a library so the integration tests
//! can drive full call flows through an in-memory transport.

use std::sync::Arc;

use bytes::Bytes;
use sluice_core::Method;
use sluice_parse::{parse_request, parse_request_strict, parse_response, parse_response_strict};
use sluice_transaction::{Incoming, TransactionManager, TransportContext};
use sluice_transport::{InboundPacket, TransportKind};
use tracing::warn;

pub mod call;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod services;
pub mod transport;
pub mod util;

use call::CallCommand;
use dispatcher::RequestDispatcher;
use services::ServiceRegistry;

/// Parses one inbound packet and routes it through the transaction layer to
/// the handlers, the call table, or the bin.
pub async fn route_packet(
    manager: &TransactionManager,
    request_dispatcher: &Arc<RequestDispatcher>,
    services: &Arc<ServiceRegistry>,
    packet: InboundPacket,
) {
    let strict = packet.transport == TransportKind::Tcp;
    let parsed_request = if strict {
        parse_request_strict(&packet.payload)
    } else {
        parse_request(&packet.payload)
    };

    if let Some(request) = parsed_request {
        let ctx = TransportContext::new(packet.transport, packet.peer, packet.stream.clone());
        match manager.receive_request(request.clone(), ctx.clone()).await {
            Incoming::New(handle) => {
                request_dispatcher.dispatch(&request, handle, &ctx).await;
            }
            Incoming::Retransmission | Incoming::AckAbsorbed => {}
            Incoming::AckForDialog(ack) => {
                let sender = ack
                    .headers
                    .get("Call-ID")
                    .and_then(|call_id| services.calls.sender(call_id));
                if let Some(sender) = sender {
                    let _ = sender.send(CallCommand::Ack(ack)).await;
                }
            }
        }
        return;
    }

    let parsed_response = if strict {
        parse_response_strict(&packet.payload)
    } else {
        parse_response(&packet.payload)
    };
    if let Some(response) = parsed_response {
        if let Some(unmatched) = manager.receive_response(response).await {
            // A 2xx INVITE retransmission whose transaction is gone: the
            // owning call re-sends its ACK.
            if sluice_parse::cseq_method(&unmatched.headers) == Some(Method::Invite) {
                let sender = unmatched
                    .headers
                    .get("Call-ID")
                    .and_then(|call_id| services.calls.sender(call_id));
                if let Some(sender) = sender {
                    let _ = sender.send(CallCommand::Stray2xx(unmatched)).await;
                }
            }
        }
        return;
    }

    // Malformed: dropped on UDP; a TCP connection that produced it is
    // poisoned and closed via the sentinel.
    warn!(peer = %packet.peer, transport = ?packet.transport, "unparseable message");
    if let Some(stream) = &packet.stream {
        let _ = stream.send(Bytes::new()).await;
    }
}
