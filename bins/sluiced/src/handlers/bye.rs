// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! BYE: forwarded into the call task, which answers 200 and tears down the
//! opposite leg.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::Request;
use sluice_transaction::{ServerTransactionHandle, TransportContext};
use std::sync::Arc;

use super::RequestHandler;
use crate::call::CallCommand;
use crate::services::ServiceRegistry;
use crate::util::response_for;

pub struct ByeHandler;

impl ByeHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestHandler for ByeHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        _ctx: &TransportContext,
        services: &Arc<ServiceRegistry>,
    ) -> Result<()> {
        let sender = request
            .headers
            .get("Call-ID")
            .and_then(|call_id| services.calls.sender(call_id));
        match sender {
            Some(sender) => {
                let _ = sender
                    .send(CallCommand::Bye {
                        request: request.clone(),
                        handle,
                    })
                    .await;
            }
            None => {
                handle
                    .send_final(response_for(
                        request,
                        481,
                        "Call/Transaction Does Not Exist",
                        None,
                    ))
                    .await;
            }
        }
        Ok(())
    }
}
