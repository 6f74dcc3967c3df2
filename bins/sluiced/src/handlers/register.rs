// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REGISTER: NAT contact correction, digest auth, binding upkeep.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::Request;
use sluice_events::EventKind;
use sluice_registrar::RegisterOutcome;
use sluice_transaction::{ServerTransactionHandle, TransportContext};
use std::sync::Arc;
use tracing::info;

use super::RequestHandler;
use crate::services::ServiceRegistry;

pub struct RegisterHandler;

impl RegisterHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestHandler for RegisterHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        ctx: &TransportContext,
        services: &Arc<ServiceRegistry>,
    ) -> Result<()> {
        // The NAT rewrite runs first so the stored binding is the address
        // the UA is actually reachable at.
        let mut request = request.clone();
        services
            .nat
            .rewrite_contact(&mut request.headers, ctx.peer);

        let result = services.registrar.handle_register(&request, ctx.peer);
        let call_id = request
            .headers
            .get("Call-ID")
            .map(|v| v.as_str())
            .unwrap_or("-");

        match &result.outcome {
            RegisterOutcome::Bound { aor, expires } => {
                info!(call_id, %aor, expires, "registered");
                services.events.publish(call_id, EventKind::RegisterOk, vec![
                    ("aor".into(), aor.clone()),
                ]);
            }
            RegisterOutcome::Removed { aor } => {
                info!(call_id, %aor, "deregistered");
                services.events.publish(call_id, EventKind::RegisterOk, vec![
                    ("aor".into(), aor.clone()),
                    ("removed".into(), "1".into()),
                ]);
            }
            RegisterOutcome::AuthFailed => {
                services
                    .events
                    .publish(call_id, EventKind::RegisterFail, vec![]);
            }
            // Challenges and queries are part of the normal exchange.
            _ => {}
        }

        handle.send_final(result.response).await;
        Ok(())
    }
}
