//! Routes fresh requests to their method handlers.

use std::collections::HashMap;
use std::sync::Arc;

use sluice_core::{Method, Request};
use sluice_transaction::{ServerTransactionHandle, TransportContext};
use tracing::warn;

use crate::handlers::{
    bye::ByeHandler, cancel::CancelHandler, in_dialog::InDialogHandler, invite::InviteHandler,
    options::OptionsHandler, register::RegisterHandler, RequestHandler,
};
use crate::services::ServiceRegistry;
use crate::util::response_for;

pub struct RequestDispatcher {
    handlers: HashMap<Method, Arc<dyn RequestHandler>>,
    services: Arc<ServiceRegistry>,
}

impl RequestDispatcher {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        let mut handlers: HashMap<Method, Arc<dyn RequestHandler>> = HashMap::new();
        handlers.insert(Method::Invite, Arc::new(InviteHandler::new()));
        handlers.insert(Method::Cancel, Arc::new(CancelHandler::new()));
        handlers.insert(Method::Bye, Arc::new(ByeHandler::new()));
        handlers.insert(Method::Register, Arc::new(RegisterHandler::new()));
        handlers.insert(Method::Options, Arc::new(OptionsHandler::new()));

        let in_dialog = Arc::new(InDialogHandler::new());
        for method in [Method::Info, Method::Message, Method::Update, Method::Notify] {
            handlers.insert(method, in_dialog.clone());
        }

        Self { handlers, services }
    }

    pub async fn dispatch(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        ctx: &TransportContext,
    ) {
        match self.handlers.get(&request.start.method) {
            Some(handler) => {
                if let Err(e) = handler.handle(request, handle, ctx, &self.services).await {
                    warn!(
                        method = %request.start.method,
                        error = %e,
                        "handler failed to process request"
                    );
                }
            }
            None => {
                warn!(method = %request.start.method, "no handler for method");
                handle
                    .send_final(response_for(request, 501, "Not Implemented", None))
                    .await;
            }
        }
    }
}
