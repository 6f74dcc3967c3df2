// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The B2BUA call engine.
//!
//! Every bridged call runs as one task consuming [`CallCommand`]s from a
//! channel, so all state transitions for a call are totally ordered while
//! different calls proceed independently. The table is keyed by Call-ID;
//! the B-leg reuses the A-leg Call-ID, which keeps correlation to a single
//! lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sluice_core::{tag_from_header, uri_from_header, Method, Request, Response};
use sluice_dialog::{Leg, LegState};
use sluice_parse::{cseq_method, serialize_request, serialize_response};
use sluice_sdp::SessionDescription;
use sluice_transaction::{
    generate_branch_id, ClientTransactionUser, ServerTransactionHandle, TerminateReason,
    TransactionKey, TransportContext,
};
use sluice_transport::TransportKind;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::services::ServiceRegistry;
use crate::util::{decrement_max_forwards, random_tag, response_for, with_sdp};
use sluice_events::EventKind;

/// Aggregate call states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initiating,
    Ringing,
    Connected,
    Terminating,
    Ended,
}

/// Commands consumed by a call task. Each carries everything the engine
/// needs so the handlers stay thin.
pub enum CallCommand {
    Initial {
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    },
    Reinvite {
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    },
    Cancel {
        request: Request,
        handle: ServerTransactionHandle,
    },
    Bye {
        request: Request,
        handle: ServerTransactionHandle,
    },
    Passthrough {
        request: Request,
        handle: ServerTransactionHandle,
    },
    Ack(Request),
    /// A 2xx INVITE retransmission that outlived its client transaction.
    Stray2xx(Response),
    Client {
        key: TransactionKey,
        event: ClientTxEvent,
    },
    AnswerTimeout,
    AckTimeout,
    Retransmit2xx,
}

/// Client transaction events funneled into the call task.
pub enum ClientTxEvent {
    Provisional(Response),
    Final(Response),
    Terminated(TerminateReason),
}

/// Table of live calls keyed by Call-ID.
#[derive(Default)]
pub struct CallTable {
    calls: DashMap<SmolStr, mpsc::Sender<CallCommand>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self, call_id: &str) -> Option<mpsc::Sender<CallCommand>> {
        self.calls.get(call_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }

    /// Spawns the serializer task for a new call and returns its inbox.
    pub fn spawn_call(
        &self,
        services: Arc<ServiceRegistry>,
        call_id: SmolStr,
    ) -> mpsc::Sender<CallCommand> {
        let (tx, rx) = mpsc::channel(64);
        self.calls.insert(call_id.clone(), tx.clone());
        let task_tx = tx.clone();
        tokio::spawn(async move {
            CallEngine::new(services, call_id, task_tx).run(rx).await;
        });
        tx
    }

    fn remove(&self, call_id: &str) {
        self.calls.remove(call_id);
    }
}

/// Engine-held 2xx retransmission state: the dialog layer owns reliable 2xx
/// delivery because the INVITE server transaction terminates on 2xx.
struct TwoxxRetransmit {
    bytes: Bytes,
    interval: Duration,
    started: Instant,
}

/// One in-flight re-offer; a second concurrent one is answered 491.
struct PendingReinvite {
    handle: ServerTransactionHandle,
    request: Request,
    client_branch: SmolStr,
    from_a: bool,
    awaiting_ack: bool,
}

/// A forwarded mid-dialog request awaiting the peer's final response.
struct PendingPassthrough {
    handle: ServerTransactionHandle,
    request: Request,
}

struct CallEngine {
    services: Arc<ServiceRegistry>,
    call_id: SmolStr,
    tx: mpsc::Sender<CallCommand>,
    state: CallState,
    a_leg: Option<Leg>,
    b_leg: Option<Leg>,
    a_ctx: Option<TransportContext>,
    b_ctx: Option<TransportContext>,
    a_invite_handle: Option<ServerTransactionHandle>,
    a_invite_request: Option<Request>,
    b_invite_request: Option<Request>,
    b_invite_branch: Option<SmolStr>,
    b_invite_cseq: u32,
    b_early_tag: Option<SmolStr>,
    two_xx: Option<TwoxxRetransmit>,
    reinvite: Option<PendingReinvite>,
    passthrough: HashMap<SmolStr, PendingPassthrough>,
    closing_byes: Vec<SmolStr>,
    caller_cancelled: bool,
    disposition: Option<SmolStr>,
    received_at: Instant,
    answered_at: Option<Instant>,
    finished: bool,
}

/// Forwards client transaction events into the owning call's inbox.
struct CallClientUser {
    tx: mpsc::Sender<CallCommand>,
}

#[async_trait]
impl ClientTransactionUser for CallClientUser {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response) {
        let _ = self
            .tx
            .send(CallCommand::Client {
                key: key.clone(),
                event: ClientTxEvent::Provisional(response.clone()),
            })
            .await;
    }

    async fn on_final(&self, key: &TransactionKey, response: &Response) {
        let _ = self
            .tx
            .send(CallCommand::Client {
                key: key.clone(),
                event: ClientTxEvent::Final(response.clone()),
            })
            .await;
    }

    async fn on_terminated(&self, key: &TransactionKey, reason: TerminateReason) {
        let _ = self
            .tx
            .send(CallCommand::Client {
                key: key.clone(),
                event: ClientTxEvent::Terminated(reason),
            })
            .await;
    }
}

impl CallEngine {
    fn new(
        services: Arc<ServiceRegistry>,
        call_id: SmolStr,
        tx: mpsc::Sender<CallCommand>,
    ) -> Self {
        Self {
            services,
            call_id,
            tx,
            state: CallState::Initiating,
            a_leg: None,
            b_leg: None,
            a_ctx: None,
            b_ctx: None,
            a_invite_handle: None,
            a_invite_request: None,
            b_invite_request: None,
            b_invite_branch: None,
            b_invite_cseq: 0,
            b_early_tag: None,
            two_xx: None,
            reinvite: None,
            passthrough: HashMap::new(),
            closing_byes: Vec::new(),
            caller_cancelled: false,
            disposition: None,
            received_at: Instant::now(),
            answered_at: None,
            finished: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CallCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
            if self.finished {
                break;
            }
        }
        self.services.calls.remove(&self.call_id);
        debug!(call_id = %self.call_id, "call task finished");
    }

    async fn handle(&mut self, command: CallCommand) {
        match command {
            CallCommand::Initial {
                request,
                handle,
                ctx,
            } => self.on_initial_invite(request, handle, ctx).await,
            CallCommand::Reinvite {
                request,
                handle,
                ctx,
            } => self.on_reinvite(request, handle, ctx).await,
            CallCommand::Cancel { request, handle } => self.on_cancel(request, handle).await,
            CallCommand::Bye { request, handle } => self.on_bye(request, handle).await,
            CallCommand::Passthrough { request, handle } => {
                self.on_passthrough(request, handle).await
            }
            CallCommand::Ack(request) => self.on_ack(request).await,
            CallCommand::Stray2xx(response) => self.on_stray_2xx(response).await,
            CallCommand::Client { key, event } => self.on_client_event(key, event).await,
            CallCommand::AnswerTimeout => self.on_answer_timeout().await,
            CallCommand::AckTimeout => self.on_ack_timeout().await,
            CallCommand::Retransmit2xx => self.on_retransmit_2xx().await,
        }
    }

    // ---- A-leg INVITE ---------------------------------------------------

    async fn on_initial_invite(
        &mut self,
        mut request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    ) {
        self.emit(EventKind::CallStart, vec![]);

        if !decrement_max_forwards(&mut request.headers) {
            let (code, reason) = EngineError::TooManyHops.sip_status();
            handle.send_final(response_for(&request, code, reason, None)).await;
            self.end_with_reason(EngineError::TooManyHops.end_reason()).await;
            return;
        }

        // NAT correction first: the corrected Contact becomes the in-dialog
        // target for the A-leg.
        self.services.nat.rewrite_contact(&mut request.headers, ctx.peer);

        let offer = match self.parse_sdp_body(&request.body) {
            Some(sdp) => {
                let (rewritten, _) = self.services.nat.rewrite_sdp(&sdp, ctx.peer);
                rewritten
            }
            None => {
                let response = response_for(&request, 488, "Not Acceptable Here", None);
                handle.send_final(response).await;
                self.end_with_reason("NO_OFFER").await;
                return;
            }
        };

        // Callee lookup by request-URI AoR.
        let callee_aor = request.start.uri.aor();
        let binding = match self.services.registrar.lookup(&callee_aor) {
            Some(binding) => binding,
            None => {
                let err = EngineError::UnknownAor(callee_aor.to_string());
                let (code, reason) = err.sip_status();
                handle.send_final(response_for(&request, code, reason, None)).await;
                self.end_with_reason(err.end_reason()).await;
                return;
            }
        };

        let from_tag = request
            .headers
            .get("From")
            .and_then(|from| tag_from_header(from))
            .map(SmolStr::new)
            .unwrap_or_else(random_tag);

        // Media offer: allocate the relay before any B-leg signalling.
        let steered = match self
            .services
            .media
            .offer(&self.call_id, &from_tag, &offer, ctx.peer.ip())
            .await
        {
            Ok(steered) => steered,
            Err(err) => {
                let err = EngineError::from(err);
                self.emit(
                    EventKind::MediaFail,
                    vec![("stage".into(), "offer".into())],
                );
                let (code, reason) = err.sip_status();
                handle.send_final(response_for(&request, code, reason, None)).await;
                self.end_with_reason(err.end_reason()).await;
                return;
            }
        };
        self.emit(
            EventKind::MediaAlloc,
            vec![(
                "audio_port".into(),
                SmolStr::new(steered.audio_port.to_string()),
            )],
        );

        // A-leg dialog state.
        let a_contact = request
            .headers
            .get("Contact")
            .and_then(|c| uri_from_header(c))
            .or_else(|| {
                request
                    .headers
                    .get("From")
                    .and_then(|f| uri_from_header(f))
            });
        let a_contact = match a_contact {
            Some(contact) => contact,
            None => {
                handle.send_final(response_for(&request, 400, "Bad Request", None)).await;
                self.end_with_reason("MALFORMED").await;
                return;
            }
        };
        let a_local_tag = random_tag();
        let a_leg =
            match Leg::from_uas_invite(&request, a_local_tag.clone(), a_contact, ctx.peer) {
                Some(leg) => leg,
                None => {
                    handle.send_final(response_for(&request, 400, "Bad Request", None)).await;
                    self.end_with_reason("MALFORMED").await;
                    return;
                }
            };

        // B-leg INVITE, reusing the Call-ID, fresh tag and branch.
        let identity = &self.services.config.identity;
        let b_tag = random_tag();
        let b_from = replace_tag(
            request.headers.get("From").map(|s| s.as_str()).unwrap_or(""),
            &b_tag,
        );
        let b_to = SmolStr::new(format!("<sip:{}>", callee_aor));
        let branch = generate_branch_id();

        let b_leg = Leg::new_uac(
            self.call_id.clone(),
            b_from.clone(),
            b_tag,
            b_to.clone(),
            binding.contact.clone(),
            binding.source,
            1,
        );
        let max_forwards = request
            .headers
            .get("Max-Forwards")
            .cloned()
            .unwrap_or_else(|| SmolStr::new("69"));

        let mut invite = b_leg.build_request(
            Method::Invite,
            1,
            SmolStr::new(identity.via_value(&branch)),
            Some(SmolStr::new(identity.contact_value())),
            Some(SmolStr::new("application/sdp")),
            Bytes::from(steered.body()),
        );
        invite.headers.set("Max-Forwards", max_forwards);

        let b_ctx = TransportContext::new(TransportKind::Udp, binding.source, None);
        let tu = Arc::new(CallClientUser {
            tx: self.tx.clone(),
        });
        let manager = self.services.transactions();
        match manager
            .start_client_transaction(invite.clone(), b_ctx.clone(), tu)
            .await
        {
            Ok(_key) => {}
            Err(e) => {
                warn!(call_id = %self.call_id, %e, "failed to start B-leg INVITE");
                handle
                    .send_final(response_for(&request, 500, "Server Internal Error", None))
                    .await;
                self.services.media.release(&self.call_id).await;
                self.end_with_reason("INTERNAL").await;
                return;
            }
        }

        info!(call_id = %self.call_id, callee = %callee_aor, "bridging call");
        self.a_leg = Some(a_leg);
        self.b_leg = Some(b_leg);
        self.a_ctx = Some(ctx);
        self.b_ctx = Some(b_ctx);
        self.a_invite_handle = Some(handle);
        self.a_invite_request = Some(request);
        self.b_invite_request = Some(invite);
        self.b_invite_branch = Some(branch);
        self.b_invite_cseq = 1;
        self.state = CallState::Initiating;

        let timeout = self.services.config.answer_timeout;
        self.schedule(CallCommand::AnswerTimeout, timeout);
    }

    // ---- B-leg responses ------------------------------------------------

    async fn on_client_event(&mut self, key: TransactionKey, event: ClientTxEvent) {
        if Some(&key.branch) == self.b_invite_branch.as_ref() && key.method == Method::Invite {
            return self.on_b_invite_event(event).await;
        }
        if let Some(pending) = &self.reinvite {
            if pending.client_branch == key.branch && key.method == Method::Invite {
                return self.on_reinvite_event(event).await;
            }
        }
        if self.closing_byes.iter().any(|branch| branch == &key.branch) {
            if matches!(
                event,
                ClientTxEvent::Final(_) | ClientTxEvent::Terminated(_)
            ) {
                self.closing_byes.retain(|branch| branch != &key.branch);
                if self.closing_byes.is_empty() && self.state == CallState::Terminating {
                    self.finish_call().await;
                }
            }
            return;
        }
        if self.passthrough.contains_key(&key.branch) {
            return self.on_passthrough_event(key.branch.clone(), event).await;
        }
        debug!(branch = %key.branch, "client event for unknown transaction ignored");
    }

    async fn on_b_invite_event(&mut self, event: ClientTxEvent) {
        match event {
            ClientTxEvent::Provisional(response) => self.relay_provisional(response).await,
            ClientTxEvent::Final(response) if response.is_success() => {
                self.on_b_answered(response).await
            }
            ClientTxEvent::Final(response) => self.on_b_failed(response).await,
            ClientTxEvent::Terminated(TerminateReason::Completed) => {}
            ClientTxEvent::Terminated(TerminateReason::Timeout) => {
                self.fail_call(EngineError::TransactionTimeout).await;
            }
            ClientTxEvent::Terminated(TerminateReason::TransportError) => {
                self.fail_call(EngineError::PeerTransportFailure).await;
            }
        }
    }

    /// Maps B-leg 18x to the A-leg. Only the first tagged fork establishes
    /// the early dialog; later forks are relayed tag-less for display only.
    async fn relay_provisional(&mut self, response: Response) {
        if self.state == CallState::Terminating || self.state == CallState::Ended {
            return;
        }
        let code = response.start.code;
        if code < 180 {
            return;
        }

        let fork_tag = response
            .headers
            .get("To")
            .and_then(|to| tag_from_header(to))
            .map(SmolStr::new);
        let first_tag = self.b_early_tag.clone();
        let (relay_code, own_tag, absorb) = match (&fork_tag, &first_tag) {
            (Some(_), None) => (code, true, true),
            (Some(tag), Some(first)) if tag == first => (code, true, false),
            // A different fork: keep it away from the dialog state.
            (Some(_), Some(_)) => (180, false, false),
            (None, _) => (code, true, false),
        };
        if absorb {
            self.b_early_tag = fork_tag.clone();
            if let Some(b_leg) = &mut self.b_leg {
                b_leg.absorb_uac_response(&response);
            }
        }

        if let (Some(request), Some(handle)) = (&self.a_invite_request, &self.a_invite_handle) {
            let tag = self.a_leg.as_ref().map(|leg| leg.local_tag.clone());
            let to_tag = if own_tag { tag } else { None };
            let reason = if relay_code == response.start.code {
                response.start.reason.as_str()
            } else {
                "Ringing"
            };
            let provisional = response_for(request, relay_code, reason, to_tag.as_deref());
            handle.send_provisional(provisional).await;
        }
        if self.state == CallState::Initiating {
            self.state = CallState::Ringing;
            self.emit(EventKind::CallRing, vec![]);
        }
    }

    async fn on_b_answered(&mut self, response: Response) {
        let b_tag = match response
            .headers
            .get("To")
            .and_then(|to| tag_from_header(to))
            .map(SmolStr::new)
        {
            Some(tag) => tag,
            None => {
                warn!(call_id = %self.call_id, "B-leg 2xx without To tag");
                self.fail_call(EngineError::MalformedMessage).await;
                return;
            }
        };

        if let Some(b_leg) = &mut self.b_leg {
            b_leg.absorb_uac_response(&response);
            b_leg.confirm();
        }

        // Terminating already (CANCEL raced ahead of the 2xx): reconcile by
        // ACK-then-BYE, the A-leg has its 487.
        if self.state == CallState::Terminating {
            self.send_b_ack().await;
            self.send_bye_to_b().await;
            return;
        }

        let answer = match self.parse_sdp_body(&response.body) {
            Some(sdp) => sdp,
            None => {
                warn!(call_id = %self.call_id, "B-leg 2xx carried unusable SDP");
                self.send_b_ack().await;
                self.send_bye_to_b().await;
                self.respond_a_invite(488, "Not Acceptable Here").await;
                self.state = CallState::Terminating;
                self.disposition = Some(SmolStr::new("MEDIA_REJECTED"));
                return;
            }
        };

        let source_ip = self
            .b_ctx
            .as_ref()
            .map(|ctx| ctx.peer.ip())
            .unwrap_or_else(|| "0.0.0.0".parse().unwrap());
        let steered = match self
            .services
            .media
            .answer(&self.call_id, &b_tag, &answer, source_ip)
            .await
        {
            Ok(steered) => steered,
            Err(err) => {
                let err = EngineError::from(err);
                self.emit(
                    EventKind::MediaFail,
                    vec![("stage".into(), "answer".into())],
                );
                self.send_b_ack().await;
                self.send_bye_to_b().await;
                let (code, reason) = err.sip_status();
                self.respond_a_invite(code, reason).await;
                self.state = CallState::Terminating;
                self.disposition = Some(SmolStr::new(err.end_reason()));
                return;
            }
        };
        self.emit(
            EventKind::MediaAlloc,
            vec![(
                "audio_port".into(),
                SmolStr::new(steered.audio_port.to_string()),
            )],
        );

        // Relay the 2xx on the A-leg and own its reliability from here: the
        // server INVITE transaction terminates once a 2xx is passed down.
        let (request, handle) = match (&self.a_invite_request, &self.a_invite_handle) {
            (Some(request), Some(handle)) => (request.clone(), handle.clone()),
            _ => return,
        };
        let a_tag = self
            .a_leg
            .as_ref()
            .map(|leg| leg.local_tag.clone())
            .unwrap_or_else(random_tag);
        let mut ok = with_sdp(
            response_for(&request, 200, "OK", Some(&a_tag)),
            steered.body(),
        );
        ok.headers.push(
            "Contact".into(),
            SmolStr::new(self.services.config.identity.contact_value()),
        );
        handle.send_final(ok.clone()).await;

        let t1 = self.services.config.timers.t1;
        self.two_xx = Some(TwoxxRetransmit {
            bytes: serialize_response(&ok),
            interval: t1,
            started: Instant::now(),
        });
        self.answered_at = Some(Instant::now());
        self.schedule(CallCommand::Retransmit2xx, t1);
        let ack_timeout = self.services.config.ack_timeout;
        self.schedule(CallCommand::AckTimeout, ack_timeout);

        if self.caller_cancelled {
            // CANCEL arrived after the B-leg answered: the caller sees the
            // 200 followed by a core-originated BYE.
            self.start_core_teardown("CALLER_CANCEL_POST_ANSWER").await;
        }
    }

    async fn on_b_failed(&mut self, response: Response) {
        let code = response.start.code;
        if self.state == CallState::Terminating {
            // 487 after our CANCEL, or any late failure: already resolved.
            self.finish_call().await;
            return;
        }
        self.respond_a_invite(code, &response.start.reason).await;
        self.services.media.release(&self.call_id).await;
        let reason = if code == 486 {
            SmolStr::new("BUSY")
        } else {
            SmolStr::new(format!("REJECTED_{}", code))
        };
        self.end_with_reason(&reason).await;
    }

    async fn fail_call(&mut self, err: EngineError) {
        if self.state == CallState::Terminating || self.state == CallState::Ended {
            self.finish_call().await;
            return;
        }
        let (code, reason) = err.sip_status();
        self.respond_a_invite(code, reason).await;
        self.services.media.release(&self.call_id).await;
        self.end_with_reason(err.end_reason()).await;
    }

    // ---- ACK / 2xx reliability -----------------------------------------

    async fn on_ack(&mut self, _request: Request) {
        let reinvite_ack = self
            .reinvite
            .as_ref()
            .map(|pending| pending.awaiting_ack)
            .unwrap_or(false);
        if reinvite_ack {
            self.reinvite = None;
            return;
        }
        if self.two_xx.take().is_some() {
            if let Some(a_leg) = &mut self.a_leg {
                a_leg.confirm();
            }
            self.send_b_ack().await;
            self.services.media.activate(&self.call_id).await;
            self.state = CallState::Connected;
            self.emit(EventKind::CallAnswer, vec![]);
            info!(call_id = %self.call_id, "call connected");
        }
        // Duplicate ACKs are absorbed silently.
    }

    /// End-to-end ACK on the B-leg for its 2xx, with a fresh branch.
    async fn send_b_ack(&mut self) {
        let identity = &self.services.config.identity;
        let via = SmolStr::new(identity.via_value(&generate_branch_id()));
        let contact = SmolStr::new(identity.contact_value());
        let (ack, ctx) = match (&self.b_leg, &self.b_ctx) {
            (Some(b_leg), Some(ctx)) => (
                b_leg.build_request(
                    Method::Ack,
                    self.b_invite_cseq,
                    via,
                    Some(contact),
                    None,
                    Bytes::new(),
                ),
                ctx.clone(),
            ),
            _ => return,
        };
        self.send_direct(&ack, &ctx).await;
    }

    async fn on_retransmit_2xx(&mut self) {
        let t2 = self.services.config.timers.t2;
        let give_up = self.services.config.timers.t1.saturating_mul(64);
        let expired = self
            .two_xx
            .as_ref()
            .map(|two_xx| two_xx.started.elapsed() >= give_up)
            .unwrap_or(false);
        if expired {
            // Timer H equivalent: no ACK is coming.
            self.on_ack_timeout().await;
            return;
        }
        let (bytes, next) = match &mut self.two_xx {
            Some(two_xx) => {
                two_xx.interval = (two_xx.interval * 2).min(t2);
                (two_xx.bytes.clone(), two_xx.interval)
            }
            None => return,
        };
        if let Some(ctx) = &self.a_ctx {
            let ctx = ctx.clone();
            if let Err(e) = self.services.dispatcher.dispatch(&ctx, bytes).await {
                warn!(call_id = %self.call_id, %e, "2xx retransmission failed");
            }
        }
        self.schedule(CallCommand::Retransmit2xx, next);
    }

    async fn on_ack_timeout(&mut self) {
        if self.two_xx.is_none() || self.state == CallState::Ended {
            return;
        }
        warn!(call_id = %self.call_id, "no ACK for relayed 2xx; tearing down");
        self.two_xx = None;
        self.send_bye_to_b().await;
        self.state = CallState::Terminating;
        self.disposition = Some(SmolStr::new(EngineError::AnswerTimeout.end_reason()));
    }

    async fn on_answer_timeout(&mut self) {
        if !matches!(self.state, CallState::Initiating | CallState::Ringing) {
            return;
        }
        warn!(call_id = %self.call_id, "answer timeout; cancelling B-leg");
        self.send_cancel_to_b().await;
        self.respond_a_invite(408, "Request Timeout").await;
        self.services.media.release(&self.call_id).await;
        self.end_with_reason("NO_ANSWER").await;
    }

    async fn on_stray_2xx(&mut self, response: Response) {
        // The B-leg retransmitting its 2xx means our ACK was lost.
        if cseq_method(&response.headers) == Some(Method::Invite)
            && matches!(self.state, CallState::Connected | CallState::Terminating)
        {
            self.send_b_ack().await;
        }
    }

    // ---- CANCEL ---------------------------------------------------------

    async fn on_cancel(&mut self, request: Request, handle: ServerTransactionHandle) {
        handle.send_final(response_for(&request, 200, "OK", None)).await;

        if self.two_xx.is_some() || self.state == CallState::Connected {
            // The B-leg already answered: the CANCEL lost the race. The
            // caller keeps its 200 and both legs get a core-originated BYE.
            self.caller_cancelled = true;
            self.start_core_teardown("CALLER_CANCEL_POST_ANSWER").await;
        } else if matches!(self.state, CallState::Initiating | CallState::Ringing) {
            self.caller_cancelled = true;
            self.send_cancel_to_b().await;
            self.respond_a_invite(487, "Request Terminated").await;
            self.state = CallState::Terminating;
            self.disposition = Some(SmolStr::new("CANCELLED"));
            // The task stays alive: if the B-leg answers anyway, the 2xx is
            // reconciled with ACK + BYE in on_b_answered.
        }
    }

    /// CANCEL towards the B-leg: same branch and CSeq number as its INVITE.
    async fn send_cancel_to_b(&mut self) {
        let (invite, ctx) = match (&self.b_invite_request, &self.b_ctx) {
            (Some(invite), Some(ctx)) => (invite.clone(), ctx.clone()),
            _ => return,
        };
        // Same Via (and branch) as the INVITE, CANCEL method and CSeq.
        let mut cancel = invite;
        cancel.start.method = Method::Cancel;
        cancel.body = Bytes::new();
        cancel.headers.remove_all("Content-Type");
        cancel.headers.set(
            "CSeq",
            SmolStr::new(format!("{} CANCEL", self.b_invite_cseq)),
        );

        let tu = Arc::new(CallClientUser {
            tx: self.tx.clone(),
        });
        if let Err(e) = self
            .services
            .transactions()
            .start_client_transaction(cancel, ctx, tu)
            .await
        {
            warn!(call_id = %self.call_id, %e, "failed to send CANCEL to B-leg");
        }
    }

    // ---- BYE ------------------------------------------------------------

    async fn on_bye(&mut self, request: Request, handle: ServerTransactionHandle) {
        handle.send_final(response_for(&request, 200, "OK", None)).await;
        if self.state == CallState::Ended {
            return;
        }
        let from_a = self.is_from_a(&request);
        if matches!(self.state, CallState::Initiating | CallState::Ringing) {
            // BYE before the call ever answered: the pending INVITE
            // transaction must not be left dangling.
            self.respond_a_invite(487, "Request Terminated").await;
        }
        self.two_xx = None;
        if self.disposition.is_none() {
            self.disposition = Some(SmolStr::new(if from_a {
                "NORMAL_CALLER_BYE"
            } else {
                "NORMAL_CALLEE_BYE"
            }));
        }
        self.state = CallState::Terminating;
        if from_a {
            self.send_bye_to_b().await;
        } else {
            self.send_bye_to_a().await;
        }
        if self.closing_byes.is_empty() {
            // Nothing left in flight (peer never materialized): close now.
            self.finish_call().await;
        }
    }

    async fn send_bye_to_b(&mut self) {
        let identity = &self.services.config.identity;
        let via = SmolStr::new(identity.via_value(&generate_branch_id()));
        let branch = branch_of(&via);
        let (bye, ctx) = match (&mut self.b_leg, &self.b_ctx) {
            (Some(b_leg), Some(ctx)) => {
                if b_leg.state == LegState::Terminated {
                    return;
                }
                b_leg.terminate();
                let cseq = b_leg.next_cseq();
                (
                    b_leg.build_request(Method::Bye, cseq, via, None, None, Bytes::new()),
                    ctx.clone(),
                )
            }
            _ => return,
        };
        self.start_closing_bye(bye, ctx, branch).await;
    }

    async fn send_bye_to_a(&mut self) {
        let identity = &self.services.config.identity;
        let via = SmolStr::new(identity.via_value(&generate_branch_id()));
        let branch = branch_of(&via);
        let (bye, ctx) = match (&mut self.a_leg, &self.a_ctx) {
            (Some(a_leg), Some(ctx)) => {
                if a_leg.state == LegState::Terminated {
                    return;
                }
                a_leg.terminate();
                let cseq = a_leg.next_cseq();
                (
                    a_leg.build_request(Method::Bye, cseq, via, None, None, Bytes::new()),
                    ctx.clone(),
                )
            }
            _ => return,
        };
        self.start_closing_bye(bye, ctx, branch).await;
    }

    async fn start_closing_bye(&mut self, bye: Request, ctx: TransportContext, branch: SmolStr) {
        let tu = Arc::new(CallClientUser {
            tx: self.tx.clone(),
        });
        match self
            .services
            .transactions()
            .start_client_transaction(bye, ctx, tu)
            .await
        {
            Ok(_) => self.closing_byes.push(branch),
            Err(e) => warn!(call_id = %self.call_id, %e, "failed to send BYE"),
        }
    }

    /// Core-originated teardown of both legs (post-answer CANCEL, timeout).
    async fn start_core_teardown(&mut self, reason: &str) {
        if self.disposition.is_none() {
            self.disposition = Some(SmolStr::new(reason));
        }
        self.two_xx = None;
        self.state = CallState::Terminating;
        self.send_bye_to_b().await;
        self.send_bye_to_a().await;
        if self.closing_byes.is_empty() {
            self.finish_call().await;
        }
    }

    // ---- re-INVITE and other mid-dialog requests ------------------------

    async fn on_reinvite(
        &mut self,
        mut request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    ) {
        if self.reinvite.is_some() {
            // Glare: one re-offer at a time.
            handle
                .send_final(response_for(&request, 491, "Request Pending", None))
                .await;
            return;
        }
        if self.state != CallState::Connected {
            handle
                .send_final(response_for(&request, 491, "Request Pending", None))
                .await;
            return;
        }

        let from_a = self.is_from_a(&request);
        self.services.nat.rewrite_contact(&mut request.headers, ctx.peer);
        if from_a {
            if let Some(a_leg) = &mut self.a_leg {
                a_leg.absorb_target_refresh(&request);
            }
        } else if let Some(b_leg) = &mut self.b_leg {
            b_leg.absorb_target_refresh(&request);
        }

        // Renegotiation reuses the relay session; only the peer address is
        // refreshed, unless the stream count changed.
        let body = match self.parse_sdp_body(&request.body) {
            Some(sdp) => {
                let (rewritten, _) = self.services.nat.rewrite_sdp(&sdp, ctx.peer);
                let from_tag = self
                    .a_leg
                    .as_ref()
                    .and_then(|leg| leg.remote_tag.clone())
                    .unwrap_or_else(random_tag);
                match self
                    .services
                    .media
                    .offer(&self.call_id, &from_tag, &rewritten, ctx.peer.ip())
                    .await
                {
                    Ok(steered) => Some(steered.body()),
                    Err(err) => {
                        let err = EngineError::from(err);
                        let (code, reason) = err.sip_status();
                        handle.send_final(response_for(&request, code, reason, None)).await;
                        return;
                    }
                }
            }
            None => None,
        };

        let identity = &self.services.config.identity;
        let via = SmolStr::new(identity.via_value(&generate_branch_id()));
        let branch = branch_of(&via);
        let contact = SmolStr::new(identity.contact_value());
        let forwarded = {
            let leg = if from_a {
                self.b_leg.as_mut()
            } else {
                self.a_leg.as_mut()
            };
            match leg {
                Some(leg) => {
                    let cseq = leg.next_cseq();
                    leg.build_request(
                        Method::Invite,
                        cseq,
                        via,
                        Some(contact),
                        body.as_ref().map(|_| SmolStr::new("application/sdp")),
                        body.map(Bytes::from).unwrap_or_default(),
                    )
                }
                None => return,
            }
        };
        let ctx_out = if from_a {
            self.b_ctx.clone()
        } else {
            self.a_ctx.clone()
        };
        let ctx_out = match ctx_out {
            Some(ctx) => ctx,
            None => return,
        };

        let tu = Arc::new(CallClientUser {
            tx: self.tx.clone(),
        });
        match self
            .services
            .transactions()
            .start_client_transaction(forwarded, ctx_out, tu)
            .await
        {
            Ok(_) => {
                self.reinvite = Some(PendingReinvite {
                    handle,
                    request,
                    client_branch: branch,
                    from_a,
                    awaiting_ack: false,
                });
            }
            Err(e) => {
                warn!(call_id = %self.call_id, %e, "failed to forward re-INVITE");
                handle
                    .send_final(response_for(&request, 500, "Server Internal Error", None))
                    .await;
            }
        }
    }

    async fn on_reinvite_event(&mut self, event: ClientTxEvent) {
        let pending = match &mut self.reinvite {
            Some(pending) => pending,
            None => return,
        };
        match event {
            ClientTxEvent::Provisional(_) => {}
            ClientTxEvent::Final(response) if response.is_success() => {
                let from_a = pending.from_a;
                let request = pending.request.clone();
                let handle = pending.handle.clone();

                // Absorb the refreshed answer into the relay.
                let body = match self.parse_sdp_body(&response.body) {
                    Some(sdp) => {
                        let answering_ctx = if from_a { &self.b_ctx } else { &self.a_ctx };
                        let source_ip = answering_ctx
                            .as_ref()
                            .map(|ctx| ctx.peer.ip())
                            .unwrap_or_else(|| "0.0.0.0".parse().unwrap());
                        let to_tag = self
                            .b_leg
                            .as_ref()
                            .and_then(|leg| leg.remote_tag.clone())
                            .unwrap_or_else(random_tag);
                        match self
                            .services
                            .media
                            .answer(&self.call_id, &to_tag, &sdp, source_ip)
                            .await
                        {
                            Ok(steered) => Some(steered.body()),
                            Err(err) => {
                                warn!(call_id = %self.call_id, %err, "re-offer answer failed");
                                None
                            }
                        }
                    }
                    None => None,
                };

                // ACK our own re-INVITE on the leg we offered to.
                self.ack_reinvite(from_a).await;

                let tag = if from_a {
                    self.a_leg.as_ref().map(|leg| leg.local_tag.clone())
                } else {
                    self.b_leg.as_ref().map(|leg| leg.local_tag.clone())
                };
                let mut ok = response_for(&request, 200, "OK", tag.as_deref());
                ok.headers.push(
                    "Contact".into(),
                    SmolStr::new(self.services.config.identity.contact_value()),
                );
                if let Some(body) = body {
                    ok = with_sdp(ok, body);
                }
                handle.send_final(ok).await;

                if let Some(pending) = &mut self.reinvite {
                    pending.awaiting_ack = true;
                }
            }
            ClientTxEvent::Final(response) => {
                let handle = pending.handle.clone();
                let request = pending.request.clone();
                self.reinvite = None;
                handle
                    .send_final(response_for(
                        &request,
                        response.start.code,
                        &response.start.reason,
                        None,
                    ))
                    .await;
            }
            ClientTxEvent::Terminated(TerminateReason::Completed) => {}
            ClientTxEvent::Terminated(_) => {
                let handle = pending.handle.clone();
                let request = pending.request.clone();
                self.reinvite = None;
                handle
                    .send_final(response_for(&request, 408, "Request Timeout", None))
                    .await;
            }
        }
    }

    async fn ack_reinvite(&mut self, offered_to_b: bool) {
        let identity = &self.services.config.identity;
        let via = SmolStr::new(identity.via_value(&generate_branch_id()));
        let contact = SmolStr::new(identity.contact_value());
        let (leg, ctx) = if offered_to_b {
            (self.b_leg.as_ref(), self.b_ctx.clone())
        } else {
            (self.a_leg.as_ref(), self.a_ctx.clone())
        };
        if let (Some(leg), Some(ctx)) = (leg, ctx) {
            let ack = leg.build_request(
                Method::Ack,
                leg.local_cseq,
                via,
                Some(contact),
                None,
                Bytes::new(),
            );
            self.send_direct(&ack, &ctx).await;
        }
    }

    async fn on_passthrough(&mut self, request: Request, handle: ServerTransactionHandle) {
        let from_a = self.is_from_a(&request);
        let identity = &self.services.config.identity;
        let via = SmolStr::new(identity.via_value(&generate_branch_id()));
        let branch = branch_of(&via);

        let forwarded = {
            let leg = if from_a {
                self.b_leg.as_mut()
            } else {
                self.a_leg.as_mut()
            };
            match leg {
                Some(leg) if leg.state != LegState::Terminated => {
                    let cseq = leg.next_cseq();
                    leg.build_request(
                        request.start.method.clone(),
                        cseq,
                        via,
                        None,
                        request.headers.get("Content-Type").cloned(),
                        request.body.clone(),
                    )
                }
                _ => {
                    handle
                        .send_final(response_for(
                            &request,
                            481,
                            "Call/Transaction Does Not Exist",
                            None,
                        ))
                        .await;
                    return;
                }
            }
        };
        let ctx = if from_a {
            self.b_ctx.clone()
        } else {
            self.a_ctx.clone()
        };
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => return,
        };

        let tu = Arc::new(CallClientUser {
            tx: self.tx.clone(),
        });
        match self
            .services
            .transactions()
            .start_client_transaction(forwarded, ctx, tu)
            .await
        {
            Ok(_) => {
                self.passthrough
                    .insert(branch, PendingPassthrough { handle, request });
            }
            Err(e) => {
                warn!(call_id = %self.call_id, %e, "failed to forward in-dialog request");
                handle
                    .send_final(response_for(&request, 500, "Server Internal Error", None))
                    .await;
            }
        }
    }

    async fn on_passthrough_event(&mut self, branch: SmolStr, event: ClientTxEvent) {
        match event {
            ClientTxEvent::Provisional(_) => {}
            ClientTxEvent::Final(response) => {
                if let Some(pending) = self.passthrough.remove(&branch) {
                    let mut relayed = response_for(
                        &pending.request,
                        response.start.code,
                        &response.start.reason,
                        None,
                    );
                    if !response.body.is_empty() {
                        if let Some(content_type) = response.headers.get("Content-Type") {
                            relayed
                                .headers
                                .push("Content-Type".into(), content_type.clone());
                        }
                        relayed.body = response.body.clone();
                    }
                    pending.handle.send_final(relayed).await;
                }
            }
            ClientTxEvent::Terminated(TerminateReason::Completed) => {}
            ClientTxEvent::Terminated(_) => {
                if let Some(pending) = self.passthrough.remove(&branch) {
                    pending
                        .handle
                        .send_final(response_for(
                            &pending.request,
                            408,
                            "Request Timeout",
                            None,
                        ))
                        .await;
                }
            }
        }
    }

    // ---- shared helpers -------------------------------------------------

    /// Final response on the A-leg INVITE transaction, with our tag.
    async fn respond_a_invite(&mut self, code: u16, reason: &str) {
        if let (Some(request), Some(handle)) = (&self.a_invite_request, &self.a_invite_handle) {
            let tag = self.a_leg.as_ref().map(|leg| leg.local_tag.clone());
            handle
                .send_final(response_for(request, code, reason, tag.as_deref()))
                .await;
        }
    }

    fn is_from_a(&self, request: &Request) -> bool {
        let from_tag = request
            .headers
            .get("From")
            .and_then(|from| tag_from_header(from))
            .map(SmolStr::new);
        match (&from_tag, &self.a_leg) {
            (Some(tag), Some(a_leg)) => a_leg.remote_tag.as_ref() == Some(tag),
            _ => true,
        }
    }

    fn parse_sdp_body(&self, body: &Bytes) -> Option<SessionDescription> {
        if body.is_empty() {
            return None;
        }
        let text = std::str::from_utf8(body).ok()?;
        SessionDescription::parse(text).ok()
    }

    async fn send_direct(&self, request: &Request, ctx: &TransportContext) {
        if let Err(e) = self
            .services
            .dispatcher
            .dispatch(ctx, serialize_request(request))
            .await
        {
            warn!(call_id = %self.call_id, %e, "direct send failed");
        }
    }

    fn schedule(&self, command: CallCommand, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command).await;
        });
    }

    fn emit(&self, kind: EventKind, attrs: Vec<(SmolStr, SmolStr)>) {
        self.services.events.publish(&self.call_id, kind, attrs);
    }

    async fn end_with_reason(&mut self, reason: &str) {
        self.disposition = Some(SmolStr::new(reason));
        self.finish_call().await;
    }

    async fn finish_call(&mut self) {
        if self.finished {
            return;
        }
        self.state = CallState::Ended;
        self.finished = true;
        self.two_xx = None;
        // The Ended handler sweeps any media session still standing.
        self.services.media.release(&self.call_id).await;

        let reason = self
            .disposition
            .clone()
            .unwrap_or_else(|| SmolStr::new("NORMAL"));
        let mut attrs = vec![(SmolStr::new("reason"), reason)];
        attrs.push((
            SmolStr::new("duration_ms"),
            SmolStr::new(self.received_at.elapsed().as_millis().to_string()),
        ));
        if let Some(answered_at) = self.answered_at {
            attrs.push((
                SmolStr::new("talk_ms"),
                SmolStr::new(answered_at.elapsed().as_millis().to_string()),
            ));
        }
        self.emit(EventKind::CallEnd, attrs);
        info!(call_id = %self.call_id, "call ended");
    }
}

/// Replaces (or adds) the `tag` parameter on a From/To header value.
fn replace_tag(value: &str, tag: &str) -> SmolStr {
    let mut parts = value.split(';');
    let mut rebuilt = String::new();
    if let Some(first) = parts.next() {
        rebuilt.push_str(first.trim_end());
    }
    for part in parts {
        if part.trim().to_ascii_lowercase().starts_with("tag=") {
            continue;
        }
        rebuilt.push(';');
        rebuilt.push_str(part);
    }
    rebuilt.push_str(";tag=");
    rebuilt.push_str(tag);
    SmolStr::new(rebuilt)
}

/// Pulls the branch parameter back out of a Via value we just built.
fn branch_of(via: &str) -> SmolStr {
    sluice_transaction::branch_from_via(via)
        .map(SmolStr::new)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_tag_swaps_existing_tag() {
        assert_eq!(
            replace_tag("<sip:a@h>;tag=old", "new").as_str(),
            "<sip:a@h>;tag=new"
        );
        assert_eq!(
            replace_tag("\"A\" <sip:a@h>;x=1;tag=old", "new").as_str(),
            "\"A\" <sip:a@h>;x=1;tag=new"
        );
        assert_eq!(replace_tag("<sip:a@h>", "t").as_str(), "<sip:a@h>;tag=t");
    }

    #[test]
    fn branch_of_round_trips() {
        let via = "SIP/2.0/UDP 198.51.100.1:5060;branch=z9hG4bKxyz";
        assert_eq!(branch_of(via).as_str(), "z9hG4bKxyz");
    }
}
