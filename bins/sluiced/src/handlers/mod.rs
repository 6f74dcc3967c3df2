//! Method handlers behind the request dispatcher.

use anyhow::Result;
use async_trait::async_trait;
use sluice_core::Request;
use sluice_transaction::{ServerTransactionHandle, TransportContext};
use std::sync::Arc;

use crate::services::ServiceRegistry;

pub mod bye;
pub mod cancel;
pub mod in_dialog;
pub mod invite;
pub mod options;
pub mod register;

/// One handler per SIP method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Processes an incoming request and answers through the transaction
    /// handle (or forwards into the owning call's task).
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        ctx: &TransportContext,
        services: &Arc<ServiceRegistry>,
    ) -> Result<()>;
}
