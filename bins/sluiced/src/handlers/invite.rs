// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! INVITE: routes the request into its call task. A new Call-ID spawns a
//! bridge; a known one is a re-INVITE for the existing dialog pair.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::{tag_from_header, Request};
use sluice_transaction::{ServerTransactionHandle, TransportContext};
use std::sync::Arc;
use tracing::warn;

use super::RequestHandler;
use crate::call::CallCommand;
use crate::services::ServiceRegistry;
use crate::util::response_for;

pub struct InviteHandler;

impl InviteHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestHandler for InviteHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        ctx: &TransportContext,
        services: &Arc<ServiceRegistry>,
    ) -> Result<()> {
        let call_id = match request.headers.get("Call-ID") {
            Some(call_id) => call_id.clone(),
            None => {
                handle
                    .send_final(response_for(request, 400, "Bad Request", None))
                    .await;
                return Ok(());
            }
        };

        let has_to_tag = request
            .headers
            .get("To")
            .and_then(|to| tag_from_header(to))
            .is_some();

        if let Some(sender) = services.calls.sender(&call_id) {
            let command = CallCommand::Reinvite {
                request: request.clone(),
                handle,
                ctx: ctx.clone(),
            };
            if sender.send(command).await.is_err() {
                warn!(%call_id, "call task gone; re-INVITE rejected");
            }
            return Ok(());
        }

        if has_to_tag {
            // In-dialog INVITE for a call this server no longer knows.
            handle
                .send_final(response_for(
                    request,
                    481,
                    "Call/Transaction Does Not Exist",
                    None,
                ))
                .await;
            return Ok(());
        }

        let sender = services.calls.spawn_call(services.clone(), call_id);
        let _ = sender
            .send(CallCommand::Initial {
                request: request.clone(),
                handle,
                ctx: ctx.clone(),
            })
            .await;
        Ok(())
    }
}
