// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction runtime: owns the transaction tables, schedules timers, and
//! applies FSM actions against the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sluice_core::{Headers, Method, Request, RequestLine, Response, StatusLine};
use sluice_parse::serialize_request;
use sluice_transport::TransportKind;
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, warn};

use crate::{
    fsm::{
        ClientAction, ClientEvent, ClientInviteFsm, ClientNonInviteFsm, ServerAction, ServerEvent,
        ServerInviteFsm, ServerNonInviteFsm, TerminateReason,
    },
    request_branch_id,
    timers::{TimerDefaults, TransactionTimers},
    branch_from_via, generate_branch_id, Timer, TransactionKey,
};

/// Dispatches outbound bytes produced by the transaction layer.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()>;
}

/// Application callbacks for client transaction events.
///
/// Each transaction surfaces at most one final response and one termination.
#[async_trait]
pub trait ClientTransactionUser: Send + Sync + 'static {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response);
    async fn on_final(&self, key: &TransactionKey, response: &Response);
    async fn on_terminated(&self, key: &TransactionKey, reason: TerminateReason);
}

/// Transport context captured per transaction so retransmissions reuse the
/// same path, and responses return to the observed source address.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    /// Write side of the originating TCP connection, when there is one.
    pub stream: Option<mpsc::Sender<Bytes>>,
}

impl TransportContext {
    pub fn new(
        transport: TransportKind,
        peer: SocketAddr,
        stream: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            transport,
            peer,
            stream,
        }
    }
}

/// Classification of an inbound request by the transaction layer.
#[derive(Debug)]
pub enum Incoming {
    /// A fresh request: the transaction user should process it and respond
    /// through the handle.
    New(ServerTransactionHandle),
    /// A retransmission, absorbed here; the last response was re-sent.
    Retransmission,
    /// An ACK that matched a non-2xx INVITE transaction and was absorbed.
    AckAbsorbed,
    /// An ACK with no matching transaction: the end-to-end ACK for a 2xx,
    /// which the dialog layer routes by Call-ID.
    AckForDialog(Request),
}

enum ManagerCommand {
    ServerTimerFired { key: TransactionKey, timer: Timer },
    ClientTimerFired { key: TransactionKey, timer: Timer },
    ServerTransportError { key: TransactionKey },
    ClientTransportError { key: TransactionKey },
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ServerEntry {
    kind: ServerKind,
    ctx: TransportContext,
    timers: HashMap<Timer, oneshot::Sender<()>>,
    request: Request,
    responded: bool,
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    ctx: TransportContext,
    tu: Arc<dyn ClientTransactionUser>,
    timers: HashMap<Timer, oneshot::Sender<()>>,
    request: Request,
}

impl ServerEntry {
    fn cancel_timer(&mut self, timer: Timer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: Timer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

/// Owns SIP transactions and drives their timers and retransmissions.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
    cmd_tx: mpsc::Sender<ManagerCommand>,
}

struct ManagerInner {
    dispatcher: Arc<dyn TransportDispatcher>,
    server: DashMap<TransactionKey, ServerEntry>,
    client: DashMap<TransactionKey, ClientEntry>,
    timer_defaults: TimerDefaults,
}

impl TransactionManager {
    /// Creates a manager with RFC default timers.
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>) -> Self {
        Self::with_timers(dispatcher, TimerDefaults::default())
    }

    /// Creates a manager with custom base timers (test hook).
    pub fn with_timers(dispatcher: Arc<dyn TransportDispatcher>, defaults: TimerDefaults) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                dispatcher,
                server: DashMap::new(),
                client: DashMap::new(),
                timer_defaults: defaults,
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    fn spawn_command_loop(&self, mut rx: mpsc::Receiver<ManagerCommand>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ManagerCommand::ServerTimerFired { key, timer } => {
                        manager.handle_server_timer(key, timer).await;
                    }
                    ManagerCommand::ClientTimerFired { key, timer } => {
                        manager.handle_client_timer(key, timer).await;
                    }
                    ManagerCommand::ServerTransportError { key } => {
                        manager.handle_server_transport_error(key).await;
                    }
                    ManagerCommand::ClientTransportError { key } => {
                        manager.handle_client_transport_error(key).await;
                    }
                }
            }
        });
    }

    /// Registers an inbound request, absorbing retransmissions and ACKs.
    pub async fn receive_request(&self, request: Request, ctx: TransportContext) -> Incoming {
        if request.start.method == Method::Ack {
            return self.receive_ack(request).await;
        }

        let branch = request_branch_id(&request).unwrap_or_else(generate_branch_id);
        let key = TransactionKey {
            branch,
            method: request.start.method.clone(),
            is_server: true,
        };

        if let Some(mut entry) = self.inner.server.get_mut(&key) {
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_retransmit(),
                ServerKind::NonInvite(fsm) => fsm.on_retransmit(),
            };
            drop(entry);
            debug!(branch = %key.branch, method = %key.method, "absorbed retransmission");
            self.apply_server_actions(&key, actions).await;
            return Incoming::Retransmission;
        }

        let timers = TransactionTimers::with_defaults(ctx.transport, self.inner.timer_defaults);
        let is_invite = request.start.method == Method::Invite;
        let entry = ServerEntry {
            kind: if is_invite {
                ServerKind::Invite(ServerInviteFsm::new(timers))
            } else {
                ServerKind::NonInvite(ServerNonInviteFsm::new(timers))
            },
            ctx,
            timers: HashMap::new(),
            request,
            responded: false,
        };
        self.inner.server.insert(key.clone(), entry);

        if is_invite {
            // The TU gets 200 ms before the layer answers 100 Trying itself.
            self.schedule_server_timer(key.clone(), Timer::Trying, timers.duration(Timer::Trying));
        }

        Incoming::New(ServerTransactionHandle {
            manager: self.clone(),
            key,
        })
    }

    async fn receive_ack(&self, request: Request) -> Incoming {
        if let Some(branch) = request_branch_id(&request) {
            let invite_key = TransactionKey {
                branch,
                method: Method::Invite,
                is_server: true,
            };
            if let Some(mut entry) = self.inner.server.get_mut(&invite_key) {
                if let ServerKind::Invite(fsm) = &mut entry.kind {
                    let actions = fsm.on_event(ServerEvent::ReceiveAck);
                    drop(entry);
                    self.apply_server_actions(&invite_key, actions).await;
                    return Incoming::AckAbsorbed;
                }
            }
        }
        Incoming::AckForDialog(request)
    }

    /// Starts a client transaction and transmits the initial request.
    pub async fn start_client_transaction(
        &self,
        request: Request,
        ctx: TransportContext,
        tu: Arc<dyn ClientTransactionUser>,
    ) -> Result<TransactionKey> {
        let branch = request_branch_id(&request)
            .ok_or_else(|| anyhow!("missing Via branch for client transaction"))?;
        let key = TransactionKey {
            branch,
            method: request.start.method.clone(),
            is_server: false,
        };
        debug!(branch = %key.branch, method = %key.method, "starting client transaction");

        let timers = TransactionTimers::with_defaults(ctx.transport, self.inner.timer_defaults);
        let (kind, actions) = if request.start.method == Method::Invite {
            let mut fsm = ClientInviteFsm::new(timers);
            let actions = fsm.on_event(ClientEvent::SendRequest(request.clone()));
            (ClientKind::Invite(fsm), actions)
        } else {
            let mut fsm = ClientNonInviteFsm::new(timers);
            let actions = fsm.on_event(ClientEvent::SendRequest(request.clone()));
            (ClientKind::NonInvite(fsm), actions)
        };

        let entry = ClientEntry {
            kind,
            ctx,
            tu,
            timers: HashMap::new(),
            request,
        };
        self.inner.client.insert(key.clone(), entry);
        self.apply_client_actions(&key, actions).await;
        Ok(key)
    }

    /// Feeds a network response into the matching client transaction.
    ///
    /// Returns the response back when no transaction matches, so the dialog
    /// layer can handle 2xx retransmissions that outlive their transaction.
    pub async fn receive_response(&self, response: Response) -> Option<Response> {
        let branch = match response.headers.get("Via").and_then(|v| branch_from_via(v)) {
            Some(branch) => SmolStr::new(branch),
            None => {
                debug!("response without Via branch dropped");
                return None;
            }
        };
        let method = match sluice_parse::cseq_method(&response.headers) {
            Some(method) => method,
            None => {
                debug!("response without CSeq method dropped");
                return None;
            }
        };
        let key = TransactionKey {
            branch,
            method,
            is_server: false,
        };

        let mut entry = match self.inner.client.get_mut(&key) {
            Some(entry) => entry,
            None => return Some(response),
        };
        let event = if response.is_provisional() {
            ClientEvent::ReceiveProvisional(response)
        } else {
            ClientEvent::ReceiveFinal(response)
        };
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => fsm.on_event(event),
            ClientKind::NonInvite(fsm) => fsm.on_event(event),
        };
        drop(entry);
        self.apply_client_actions(&key, actions).await;
        None
    }

    /// Sends a provisional response on a server transaction.
    pub async fn send_provisional(&self, key: &TransactionKey, response: Response) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            entry.responded = true;
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::SendProvisional(response)),
                ServerKind::NonInvite(fsm) => {
                    fsm.on_event(ServerEvent::SendProvisional(response))
                }
            };
            drop(entry);
            self.apply_server_actions(key, actions).await;
        }
    }

    /// Sends a final response on a server transaction.
    pub async fn send_final(&self, key: &TransactionKey, response: Response) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            entry.responded = true;
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::SendFinal(response)),
                ServerKind::NonInvite(fsm) => fsm.on_event(ServerEvent::SendFinal(response)),
            };
            drop(entry);
            self.apply_server_actions(key, actions).await;
        }
    }

    async fn handle_server_timer(&self, key: TransactionKey, timer: Timer) {
        if timer == Timer::Trying {
            self.auto_trying(&key).await;
            return;
        }
        if let Some(mut entry) = self.inner.server.get_mut(&key) {
            entry.cancel_timer(timer);
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::TimerFired(timer)),
                ServerKind::NonInvite(fsm) => fsm.on_event(ServerEvent::TimerFired(timer)),
            };
            drop(entry);
            self.apply_server_actions(&key, actions).await;
        }
    }

    /// Emits the automatic 100 Trying when the TU has stayed silent.
    async fn auto_trying(&self, key: &TransactionKey) {
        let request = match self.inner.server.get(key) {
            Some(entry) if !entry.responded => entry.request.clone(),
            _ => return,
        };
        debug!(branch = %key.branch, "TU silent for 200ms; sending 100 Trying");
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via".into(), via.clone());
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(name.into(), value.clone());
            }
        }
        let trying = Response::new(
            StatusLine::new(100, "Trying".into()),
            headers,
            Bytes::new(),
        );
        self.send_provisional(key, trying).await;
    }

    async fn handle_client_timer(&self, key: TransactionKey, timer: Timer) {
        if let Some(mut entry) = self.inner.client.get_mut(&key) {
            entry.cancel_timer(timer);
            let actions = match &mut entry.kind {
                ClientKind::Invite(fsm) => fsm.on_event(ClientEvent::TimerFired(timer)),
                ClientKind::NonInvite(fsm) => fsm.on_event(ClientEvent::TimerFired(timer)),
            };
            drop(entry);
            self.apply_client_actions(&key, actions).await;
        }
    }

    async fn handle_server_transport_error(&self, key: TransactionKey) {
        if let Some(mut entry) = self.inner.server.get_mut(&key) {
            let actions = match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::TransportError),
                ServerKind::NonInvite(fsm) => fsm.on_event(ServerEvent::TransportError),
            };
            drop(entry);
            self.apply_server_actions(&key, actions).await;
        }
    }

    async fn handle_client_transport_error(&self, key: TransactionKey) {
        if let Some(mut entry) = self.inner.client.get_mut(&key) {
            let actions = match &mut entry.kind {
                ClientKind::Invite(fsm) => fsm.on_event(ClientEvent::TransportError),
                ClientKind::NonInvite(fsm) => fsm.on_event(ClientEvent::TransportError),
            };
            drop(entry);
            self.apply_client_actions(&key, actions).await;
        }
    }

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Transmit(bytes) => {
                    let ctx = match self.inner.server.get(key) {
                        Some(entry) => entry.ctx.clone(),
                        None => continue,
                    };
                    if let Err(e) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
                        error!(%e, branch = %key.branch, "server transport dispatch failed");
                        let _ = self
                            .cmd_tx
                            .send(ManagerCommand::ServerTransportError { key: key.clone() })
                            .await;
                    }
                }
                ServerAction::Schedule { timer, duration } => {
                    self.schedule_server_timer(key.clone(), timer, duration);
                }
                ServerAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                ServerAction::Terminate(_) => {
                    if let Some((_, mut entry)) = self.inner.server.remove(key) {
                        entry.cancel_all();
                    }
                }
            }
        }
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Transmit(bytes) => {
                    let ctx = match self.inner.client.get(key) {
                        Some(entry) => entry.ctx.clone(),
                        None => continue,
                    };
                    if let Err(e) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
                        error!(%e, branch = %key.branch, "client transport dispatch failed");
                        let _ = self
                            .cmd_tx
                            .send(ManagerCommand::ClientTransportError { key: key.clone() })
                            .await;
                    }
                }
                ClientAction::Deliver(response) => {
                    let tu = match self.inner.client.get(key) {
                        Some(entry) => entry.tu.clone(),
                        None => continue,
                    };
                    if response.is_provisional() {
                        tu.on_provisional(key, &response).await;
                    } else {
                        tu.on_final(key, &response).await;
                    }
                }
                ClientAction::AckNon2xx(response) => {
                    self.send_non2xx_ack(key, &response).await;
                }
                ClientAction::Schedule { timer, duration } => {
                    self.schedule_client_timer(key.clone(), timer, duration);
                }
                ClientAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                ClientAction::Terminate(reason) => {
                    if let Some((_, mut entry)) = self.inner.client.remove(key) {
                        entry.cancel_all();
                        entry.tu.on_terminated(key, reason).await;
                    }
                }
            }
        }
    }

    /// Builds and transmits the hop-by-hop ACK for a non-2xx INVITE final
    /// (RFC 3261 §17.1.1.3): same branch, same CSeq number, To taken from
    /// the response.
    async fn send_non2xx_ack(&self, key: &TransactionKey, response: &Response) {
        let (request, ctx) = match self.inner.client.get(key) {
            Some(entry) => (entry.request.clone(), entry.ctx.clone()),
            None => return,
        };

        let mut headers = Headers::new();
        if let Some(via) = request.headers.get("Via") {
            headers.push("Via".into(), via.clone());
        }
        if let Some(max_forwards) = request.headers.get("Max-Forwards") {
            headers.push("Max-Forwards".into(), max_forwards.clone());
        }
        if let Some(from) = request.headers.get("From") {
            headers.push("From".into(), from.clone());
        }
        let to = response
            .headers
            .get("To")
            .or_else(|| request.headers.get("To"));
        if let Some(to) = to {
            headers.push("To".into(), to.clone());
        }
        if let Some(call_id) = request.headers.get("Call-ID") {
            headers.push("Call-ID".into(), call_id.clone());
        }
        if let Some(number) = sluice_parse::cseq_number(&request.headers) {
            headers.push("CSeq".into(), SmolStr::new(format!("{} ACK", number)));
        }

        let ack = Request::new(
            RequestLine::new(Method::Ack, request.start.uri.clone()),
            headers,
            Bytes::new(),
        );
        if let Err(e) = self
            .inner
            .dispatcher
            .dispatch(&ctx, serialize_request(&ack))
            .await
        {
            warn!(%e, branch = %key.branch, "failed to send non-2xx ACK");
        }
    }

    fn schedule_server_timer(&self, key: TransactionKey, timer: Timer, duration: Duration) {
        if duration.is_zero() {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx
                    .send(ManagerCommand::ServerTimerFired { key, timer })
                    .await;
            });
            return;
        }
        if let Some(mut entry) = self.inner.server.get_mut(&key) {
            entry.cancel_timer(timer);
            let (cancel_tx, mut cancel_rx) = oneshot::channel();
            entry.timers.insert(timer, cancel_tx);
            drop(entry);
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = time::sleep(duration) => {
                        let _ = cmd_tx.send(ManagerCommand::ServerTimerFired { key, timer }).await;
                    }
                    _ = &mut cancel_rx => {}
                }
            });
        }
    }

    fn schedule_client_timer(&self, key: TransactionKey, timer: Timer, duration: Duration) {
        if duration.is_zero() {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx
                    .send(ManagerCommand::ClientTimerFired { key, timer })
                    .await;
            });
            return;
        }
        if let Some(mut entry) = self.inner.client.get_mut(&key) {
            entry.cancel_timer(timer);
            let (cancel_tx, mut cancel_rx) = oneshot::channel();
            entry.timers.insert(timer, cancel_tx);
            drop(entry);
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = time::sleep(duration) => {
                        let _ = cmd_tx.send(ManagerCommand::ClientTimerFired { key, timer }).await;
                    }
                    _ = &mut cancel_rx => {}
                }
            });
        }
    }
}

/// Handle for responding on a server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl std::fmt::Debug for ServerTransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransactionHandle")
            .field("key", &self.key)
            .finish()
    }
}

impl ServerTransactionHandle {
    pub async fn send_provisional(&self, response: Response) {
        self.manager.send_provisional(&self.key, response).await;
    }

    pub async fn send_final(&self, response: Response) {
        self.manager.send_final(&self.key, response).await;
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::SipUri;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct TestDispatcher {
        sent: Mutex<Vec<Bytes>>,
    }

    impl TestDispatcher {
        async fn sent_text(&self) -> Vec<String> {
            self.sent
                .lock()
                .await
                .iter()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl TransportDispatcher for TestDispatcher {
        async fn dispatch(&self, _ctx: &TransportContext, payload: Bytes) -> Result<()> {
            self.sent.lock().await.push(payload);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestTu {
        provisionals: Mutex<Vec<u16>>,
        finals: Mutex<Vec<u16>>,
        terminated: Mutex<Vec<TerminateReason>>,
    }

    #[async_trait]
    impl ClientTransactionUser for TestTu {
        async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
            self.provisionals.lock().await.push(response.start.code);
        }
        async fn on_final(&self, _key: &TransactionKey, response: &Response) {
            self.finals.lock().await.push(response.start.code);
        }
        async fn on_terminated(&self, _key: &TransactionKey, reason: TerminateReason) {
            self.terminated.lock().await.push(reason);
        }
    }

    fn ctx() -> TransportContext {
        TransportContext::new(TransportKind::Udp, "127.0.0.1:5060".parse().unwrap(), None)
    }

    fn request(method: Method, branch: &str) -> Request {
        let mut headers = Headers::new();
        headers.push(
            "Via".into(),
            SmolStr::new(format!("SIP/2.0/UDP 10.0.0.1;branch={}", branch)),
        );
        headers.push("Max-Forwards".into(), "70".into());
        headers.push("From".into(), "<sip:a@h>;tag=ft".into());
        headers.push("To".into(), "<sip:b@h>".into());
        headers.push("Call-ID".into(), "call-1".into());
        headers.push(
            "CSeq".into(),
            SmolStr::new(format!("1 {}", method.as_str())),
        );
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:b@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn response(code: u16, branch: &str, method: Method) -> Response {
        let mut headers = Headers::new();
        headers.push(
            "Via".into(),
            SmolStr::new(format!("SIP/2.0/UDP 10.0.0.1;branch={}", branch)),
        );
        headers.push("From".into(), "<sip:a@h>;tag=ft".into());
        headers.push("To".into(), "<sip:b@h>;tag=tt".into());
        headers.push("Call-ID".into(), "call-1".into());
        headers.push(
            "CSeq".into(),
            SmolStr::new(format!("1 {}", method.as_str())),
        );
        Response::new(
            StatusLine::new(code, "X".into()),
            headers,
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn retransmitted_request_is_absorbed_and_last_response_resent() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());

        let invite = request(Method::Invite, "z9hG4bKr1");
        let incoming = manager.receive_request(invite.clone(), ctx()).await;
        let handle = match incoming {
            Incoming::New(handle) => handle,
            other => panic!("expected New, got {:?}", other),
        };
        handle
            .send_provisional(response(180, "z9hG4bKr1", Method::Invite))
            .await;

        let before = dispatcher.sent.lock().await.len();
        let incoming = manager.receive_request(invite, ctx()).await;
        assert!(matches!(incoming, Incoming::Retransmission));
        let after = dispatcher.sent.lock().await.len();
        assert_eq!(after, before + 1, "last response must be re-sent");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_tu_triggers_automatic_100_trying() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());

        let incoming = manager
            .receive_request(request(Method::Invite, "z9hG4bKt1"), ctx())
            .await;
        assert!(matches!(incoming, Incoming::New(_)));

        time::sleep(Duration::from_millis(300)).await;
        let sent = dispatcher.sent_text().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("SIP/2.0 100 Trying"));
    }

    #[tokio::test(start_paused = true)]
    async fn responded_tu_suppresses_automatic_trying() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());

        let incoming = manager
            .receive_request(request(Method::Invite, "z9hG4bKt2"), ctx())
            .await;
        let handle = match incoming {
            Incoming::New(handle) => handle,
            other => panic!("expected New, got {:?}", other),
        };
        handle
            .send_provisional(response(180, "z9hG4bKt2", Method::Invite))
            .await;

        time::sleep(Duration::from_millis(300)).await;
        let sent = dispatcher.sent_text().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("SIP/2.0 180"));
    }

    #[tokio::test]
    async fn client_final_is_delivered_once_and_duplicates_returned() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());
        let tu = Arc::new(TestTu::default());

        manager
            .start_client_transaction(request(Method::Invite, "z9hG4bKc1"), ctx(), tu.clone())
            .await
            .unwrap();

        let unmatched = manager
            .receive_response(response(200, "z9hG4bKc1", Method::Invite))
            .await;
        assert!(unmatched.is_none());
        assert_eq!(tu.finals.lock().await.as_slice(), &[200]);

        // The 2xx terminated the INVITE client transaction; a retransmitted
        // 2xx comes back for the dialog layer to re-ACK.
        let unmatched = manager
            .receive_response(response(200, "z9hG4bKc1", Method::Invite))
            .await;
        assert!(unmatched.is_some());
        assert_eq!(tu.finals.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn non2xx_final_generates_hop_by_hop_ack() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());
        let tu = Arc::new(TestTu::default());

        manager
            .start_client_transaction(request(Method::Invite, "z9hG4bKc2"), ctx(), tu.clone())
            .await
            .unwrap();
        manager
            .receive_response(response(486, "z9hG4bKc2", Method::Invite))
            .await;

        let sent = dispatcher.sent_text().await;
        let ack = sent
            .iter()
            .find(|m| m.starts_with("ACK "))
            .expect("ACK must be sent for non-2xx final");
        assert!(ack.contains("branch=z9hG4bKc2"));
        assert!(ack.contains("CSeq: 1 ACK"));
        assert!(ack.contains(";tag=tt"), "To tag must come from the response");
        assert_eq!(tu.finals.lock().await.as_slice(), &[486]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_invite_times_out_with_timer_b() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let defaults = TimerDefaults {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(40),
            t4: Duration::from_millis(50),
        };
        let manager = TransactionManager::with_timers(dispatcher.clone(), defaults);
        let tu = Arc::new(TestTu::default());

        manager
            .start_client_transaction(request(Method::Invite, "z9hG4bKc3"), ctx(), tu.clone())
            .await
            .unwrap();

        time::sleep(Duration::from_millis(10 * 64 + 50)).await;
        assert_eq!(
            tu.terminated.lock().await.as_slice(),
            &[TerminateReason::Timeout]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invite_retransmits_until_provisional() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let defaults = TimerDefaults {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(40),
            t4: Duration::from_millis(50),
        };
        let manager = TransactionManager::with_timers(dispatcher.clone(), defaults);
        let tu = Arc::new(TestTu::default());

        manager
            .start_client_transaction(request(Method::Invite, "z9hG4bKc4"), ctx(), tu.clone())
            .await
            .unwrap();
        time::sleep(Duration::from_millis(35)).await;

        // Initial send at t=0 plus retransmits at ~10ms and ~30ms.
        let sent = dispatcher.sent_text().await;
        let invites = sent.iter().filter(|m| m.starts_with("INVITE")).count();
        assert!(invites >= 3, "expected at least 3 INVITE sends, got {}", invites);

        manager
            .receive_response(response(180, "z9hG4bKc4", Method::Invite))
            .await;
        let after_provisional = dispatcher.sent_text().await.len();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.sent_text().await.len(), after_provisional);
        assert_eq!(tu.provisionals.lock().await.as_slice(), &[180]);
    }

    #[tokio::test]
    async fn ack_without_transaction_is_for_the_dialog_layer() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());
        let incoming = manager
            .receive_request(request(Method::Ack, "z9hG4bKa1"), ctx())
            .await;
        assert!(matches!(incoming, Incoming::AckForDialog(_)));
    }

    #[tokio::test]
    async fn ack_matching_non2xx_invite_is_absorbed() {
        let dispatcher = Arc::new(TestDispatcher::default());
        let manager = TransactionManager::new(dispatcher.clone());

        let incoming = manager
            .receive_request(request(Method::Invite, "z9hG4bKa2"), ctx())
            .await;
        let handle = match incoming {
            Incoming::New(handle) => handle,
            other => panic!("expected New, got {:?}", other),
        };
        handle
            .send_final(response(486, "z9hG4bKa2", Method::Invite))
            .await;

        let incoming = manager
            .receive_request(request(Method::Ack, "z9hG4bKa2"), ctx())
            .await;
        assert!(matches!(incoming, Incoming::AckAbsorbed));
    }
}
