// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! Pure state machines in [`fsm`] emit actions; the [`manager`] owns the
//! transaction tables, runs the timers, and talks to the transport through
//! the [`TransportDispatcher`](manager::TransportDispatcher) seam. Upward,
//! exactly one event per transaction reaches the transaction user;
//! retransmissions are absorbed here.

use rand::{distributions::Alphanumeric, Rng};
use sluice_core::{Headers, Method, Request};
use smol_str::SmolStr;

pub mod fsm;
pub mod manager;
pub mod timers;

pub use fsm::{
    ClientAction, ClientEvent, ClientInviteFsm, ClientNonInviteFsm, ServerAction, ServerEvent,
    ServerInviteFsm, ServerNonInviteFsm, TerminateReason,
};
pub use manager::{
    ClientTransactionUser, Incoming, ServerTransactionHandle, TransactionManager,
    TransportContext, TransportDispatcher,
};
pub use timers::{TimerDefaults, TransactionTimers};

/// Extracts the `branch=` parameter from a Via header value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the top-most Via header value, if present.
pub fn top_via(headers: &Headers) -> Option<&SmolStr> {
    headers.get_all("Via").next()
}

/// Returns the transaction branch for a request, from its top Via.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = top_via(&req.headers)?;
    branch_from_via(via).map(SmolStr::new)
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}

/// Timers referenced by the transaction state machines (RFC 3261 §17).
///
/// `Trying` is not an RFC timer: it fires 200 ms after a server INVITE
/// transaction is created and triggers the automatic 100 Trying when the
/// transaction user has not responded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Trying,
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Non-INVITE transaction states, shared by both directions (Figures 6/8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Unique transaction key: top Via branch + CSeq method + direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    /// Builds a transaction key from a request, deriving the branch parameter.
    pub fn from_request(req: &Request, is_server: bool) -> Option<Self> {
        let branch = request_branch_id(req)?;
        Some(Self {
            branch,
            method: req.start.method.clone(),
            is_server,
        })
    }
}
