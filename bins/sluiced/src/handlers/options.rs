//! OPTIONS: answered directly as a keepalive probe.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::Request;
use sluice_transaction::{ServerTransactionHandle, TransportContext};
use std::sync::Arc;

use super::RequestHandler;
use crate::services::ServiceRegistry;
use crate::util::response_for;

const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER, INFO, MESSAGE, UPDATE, NOTIFY";

pub struct OptionsHandler;

impl OptionsHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestHandler for OptionsHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        _ctx: &TransportContext,
        _services: &Arc<ServiceRegistry>,
    ) -> Result<()> {
        let mut response = response_for(request, 200, "OK", None);
        response.headers.push("Allow".into(), ALLOW.into());
        handle.send_final(response).await;
        Ok(())
    }
}
