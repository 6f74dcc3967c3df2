//! Shared service registry handed to every handler and call task.
//!
//! Explicit handles only: the registrar binding map, the call table and the
//! transaction table are process-scoped but always reached through this
//! registry, never through globals.

use std::sync::{Arc, OnceLock};

use sluice_auth::{DigestAuthenticator, MemoryCredentialStore};
use sluice_events::EventBus;
use sluice_media::MediaSessionManager;
use sluice_nat::NatInspector;
use sluice_registrar::Registrar;
use sluice_transaction::{TransactionManager, TransportDispatcher};

use crate::call::CallTable;
use crate::config::Config;

pub struct ServiceRegistry {
    pub config: Arc<Config>,
    pub registrar: Registrar<MemoryCredentialStore>,
    pub nat: NatInspector,
    pub media: MediaSessionManager,
    pub events: EventBus,
    pub calls: CallTable,
    /// Direct transport access for messages outside any transaction
    /// (end-to-end ACKs, engine-owned 2xx retransmissions).
    pub dispatcher: Arc<dyn TransportDispatcher>,
    /// Set once after the transport is wired up.
    transactions: OnceLock<TransactionManager>,
}

impl ServiceRegistry {
    pub fn new(
        config: Arc<Config>,
        dispatcher: Arc<dyn TransportDispatcher>,
        media: MediaSessionManager,
    ) -> Self {
        let authenticator = if config.users.is_empty() {
            None
        } else {
            let mut store = MemoryCredentialStore::new();
            for (user, secret) in &config.users {
                store.add(user, secret);
            }
            Some(DigestAuthenticator::new(&config.realm, store))
        };
        let registrar =
            Registrar::new(authenticator).with_max_expiry(config.registration_max_expiry);
        let nat = NatInspector::new(config.private_cidrs.clone());

        Self {
            config,
            registrar,
            nat,
            media,
            events: EventBus::default(),
            calls: CallTable::new(),
            dispatcher,
            transactions: OnceLock::new(),
        }
    }

    /// Wires in the transaction manager; callable once.
    pub fn set_transactions(&self, manager: TransactionManager) {
        if self.transactions.set(manager).is_err() {
            panic!("transaction manager already set");
        }
    }

    pub fn transactions(&self) -> &TransactionManager {
        self.transactions
            .get()
            .expect("transaction manager not wired up yet")
    }
}
