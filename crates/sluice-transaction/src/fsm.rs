// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pure transaction state machines.
//!
//! Each FSM consumes one event and returns the actions the runtime must
//! perform. No I/O, no clocks: retransmission intervals are tracked as
//! state, the manager owns the actual timers.

use bytes::Bytes;
use sluice_core::{Request, Response};
use sluice_parse::{serialize_request, serialize_response};

use crate::{
    timers::TransactionTimers, ClientInviteState, NonInviteState, ServerInviteState, Timer,
};

/// Why a transaction reached Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// Normal completion (final response handled, absorb timer elapsed).
    Completed,
    /// Timer B/F/H fired without the awaited message.
    Timeout,
    /// The transport reported a hard send failure.
    TransportError,
}

/// Events driving the client-side state machines.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(Timer),
    TransportError,
}

/// Actions emitted by the client-side state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Transmit(Bytes),
    /// Surface a response to the transaction user (exactly once per
    /// provisional / final).
    Deliver(Response),
    /// Build and transmit the hop-by-hop ACK for a non-2xx final.
    AckNon2xx(Response),
    Schedule {
        timer: Timer,
        duration: std::time::Duration,
    },
    Cancel(Timer),
    Terminate(TerminateReason),
}

/// Events driving the server-side state machines.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    SendProvisional(Response),
    SendFinal(Response),
    ReceiveAck,
    TimerFired(Timer),
    TransportError,
}

/// Actions emitted by the server-side state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit(Bytes),
    Schedule {
        timer: Timer,
        duration: std::time::Duration,
    },
    Cancel(Timer),
    Terminate(TerminateReason),
}

/// Client INVITE transaction per RFC 3261 §17.1.1.
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransactionTimers,
    retransmit_interval: std::time::Duration,
    last_request: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            retransmit_interval: timers.t1(),
            timers,
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientEvent::SendRequest(request)) => self.handle_send(request),
            (Calling | Proceeding, ClientEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![
                    ClientAction::Cancel(Timer::A),
                    ClientAction::Deliver(response),
                ]
            }
            (Calling | Proceeding, ClientEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            // Retransmitted finals in Completed are absorbed with a fresh ACK.
            (Completed, ClientEvent::ReceiveFinal(response)) => {
                vec![ClientAction::AckNon2xx(response)]
            }
            (Calling, ClientEvent::TimerFired(Timer::A)) => self.handle_retransmit(),
            (Calling | Proceeding, ClientEvent::TimerFired(Timer::B)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(Timer::A),
                    ClientAction::Terminate(TerminateReason::Timeout),
                ]
            }
            (Completed, ClientEvent::TimerFired(Timer::D)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminateReason::Completed)]
            }
            (_, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminateReason::TransportError)]
            }
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        let mut actions = vec![ClientAction::Transmit(bytes)];
        if self.timers.should_retransmit() {
            actions.push(ClientAction::Schedule {
                timer: Timer::A,
                duration: self.timers.duration(Timer::A),
            });
        }
        actions.push(ClientAction::Schedule {
            timer: Timer::B,
            duration: self.timers.duration(Timer::B),
        });
        actions
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        if response.is_success() {
            self.state = ClientInviteState::Terminated;
            vec![
                ClientAction::Cancel(Timer::A),
                ClientAction::Cancel(Timer::B),
                ClientAction::Deliver(response),
                ClientAction::Terminate(TerminateReason::Completed),
            ]
        } else {
            self.state = ClientInviteState::Completed;
            vec![
                ClientAction::Cancel(Timer::A),
                ClientAction::Cancel(Timer::B),
                ClientAction::Deliver(response.clone()),
                ClientAction::AckNon2xx(response),
                ClientAction::Schedule {
                    timer: Timer::D,
                    duration: self.timers.duration(Timer::D),
                },
            ]
        }
    }

    fn handle_retransmit(&mut self) -> Vec<ClientAction> {
        let bytes = match &self.last_request {
            Some(bytes) => bytes.clone(),
            None => return Vec::new(),
        };
        self.retransmit_interval = (self.retransmit_interval * 2).min(self.timers.t2());
        vec![
            ClientAction::Transmit(bytes),
            ClientAction::Schedule {
                timer: Timer::A,
                duration: self.retransmit_interval,
            },
        ]
    }
}

/// Client non-INVITE transaction per RFC 3261 §17.1.2.
pub struct ClientNonInviteFsm {
    pub state: NonInviteState,
    timers: TransactionTimers,
    retransmit_interval: std::time::Duration,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            state: NonInviteState::Trying,
            retransmit_interval: timers.t1(),
            timers,
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use NonInviteState::*;
        match (self.state, event) {
            (Trying, ClientEvent::SendRequest(request)) => {
                let bytes = serialize_request(&request);
                self.last_request = Some(bytes.clone());
                let mut actions = vec![ClientAction::Transmit(bytes)];
                if self.timers.should_retransmit() {
                    actions.push(ClientAction::Schedule {
                        timer: Timer::E,
                        duration: self.timers.duration(Timer::E),
                    });
                }
                actions.push(ClientAction::Schedule {
                    timer: Timer::F,
                    duration: self.timers.duration(Timer::F),
                });
                actions
            }
            (Trying | Proceeding, ClientEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![ClientAction::Deliver(response)]
            }
            (Trying | Proceeding, ClientEvent::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    ClientAction::Cancel(Timer::E),
                    ClientAction::Cancel(Timer::F),
                    ClientAction::Deliver(response),
                    ClientAction::Schedule {
                        timer: Timer::K,
                        duration: self.timers.duration(Timer::K),
                    },
                ]
            }
            (Trying | Proceeding, ClientEvent::TimerFired(Timer::E)) => {
                let bytes = match &self.last_request {
                    Some(bytes) => bytes.clone(),
                    None => return Vec::new(),
                };
                self.retransmit_interval = (self.retransmit_interval * 2).min(self.timers.t2());
                vec![
                    ClientAction::Transmit(bytes),
                    ClientAction::Schedule {
                        timer: Timer::E,
                        duration: self.retransmit_interval,
                    },
                ]
            }
            (Trying | Proceeding, ClientEvent::TimerFired(Timer::F)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(Timer::E),
                    ClientAction::Terminate(TerminateReason::Timeout),
                ]
            }
            (Completed, ClientEvent::TimerFired(Timer::K)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminateReason::Completed)]
            }
            (_, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminateReason::TransportError)]
            }
            _ => Vec::new(),
        }
    }
}

/// Server INVITE transaction per RFC 3261 §17.2.1.
///
/// A 2xx final terminates the transaction immediately: reliable 2xx
/// delivery belongs to the dialog layer, which retransmits the 2xx until
/// the ACK arrives.
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TransactionTimers,
    retransmit_interval: std::time::Duration,
    last_response: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            retransmit_interval: timers.t1(),
            timers,
            last_response: None,
            last_final: None,
        }
    }

    /// A retransmitted INVITE re-sends whatever we last sent, if anything.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        match &self.last_response {
            Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
            None => Vec::new(),
        }
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerEvent::SendProvisional(response)) => {
                let bytes = serialize_response(&response);
                self.last_response = Some(bytes.clone());
                vec![ServerAction::Transmit(bytes)]
            }
            (Proceeding, ServerEvent::SendFinal(response)) => self.handle_final(response),
            (Completed, ServerEvent::ReceiveAck) => {
                self.state = Confirmed;
                vec![
                    ServerAction::Cancel(Timer::G),
                    ServerAction::Cancel(Timer::H),
                    ServerAction::Schedule {
                        timer: Timer::I,
                        duration: self.timers.duration(Timer::I),
                    },
                ]
            }
            (Completed, ServerEvent::TimerFired(Timer::G)) => {
                let bytes = match &self.last_final {
                    Some(bytes) => bytes.clone(),
                    None => return Vec::new(),
                };
                self.retransmit_interval = (self.retransmit_interval * 2).min(self.timers.t2());
                vec![
                    ServerAction::Transmit(bytes),
                    ServerAction::Schedule {
                        timer: Timer::G,
                        duration: self.retransmit_interval,
                    },
                ]
            }
            (Completed, ServerEvent::TimerFired(Timer::H)) => {
                self.state = Terminated;
                vec![
                    ServerAction::Cancel(Timer::G),
                    ServerAction::Terminate(TerminateReason::Timeout),
                ]
            }
            (Confirmed, ServerEvent::TimerFired(Timer::I)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminateReason::Completed)]
            }
            (_, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminateReason::TransportError)]
            }
            _ => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = serialize_response(&response);
        self.last_response = Some(bytes.clone());
        if response.is_success() {
            self.state = ServerInviteState::Terminated;
            vec![
                ServerAction::Transmit(bytes),
                ServerAction::Terminate(TerminateReason::Completed),
            ]
        } else {
            self.state = ServerInviteState::Completed;
            self.last_final = Some(bytes.clone());
            let mut actions = vec![ServerAction::Transmit(bytes)];
            if self.timers.should_retransmit() {
                actions.push(ServerAction::Schedule {
                    timer: Timer::G,
                    duration: self.timers.duration(Timer::G),
                });
            }
            actions.push(ServerAction::Schedule {
                timer: Timer::H,
                duration: self.timers.duration(Timer::H),
            });
            actions
        }
    }
}

/// Server non-INVITE transaction per RFC 3261 §17.2.2.
pub struct ServerNonInviteFsm {
    pub state: NonInviteState,
    timers: TransactionTimers,
    last_response: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransactionTimers) -> Self {
        Self {
            state: NonInviteState::Trying,
            timers,
            last_response: None,
        }
    }

    /// Duplicates during Completed re-send the stored final response.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        if matches!(self.state, NonInviteState::Completed | NonInviteState::Proceeding) {
            if let Some(bytes) = &self.last_response {
                return vec![ServerAction::Transmit(bytes.clone())];
            }
        }
        Vec::new()
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use NonInviteState::*;
        match (self.state, event) {
            (Trying | Proceeding, ServerEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                let bytes = serialize_response(&response);
                self.last_response = Some(bytes.clone());
                vec![ServerAction::Transmit(bytes)]
            }
            (Trying | Proceeding, ServerEvent::SendFinal(response)) => {
                self.state = Completed;
                let bytes = serialize_response(&response);
                self.last_response = Some(bytes.clone());
                vec![
                    ServerAction::Transmit(bytes),
                    ServerAction::Schedule {
                        timer: Timer::J,
                        duration: self.timers.duration(Timer::J),
                    },
                ]
            }
            (Completed, ServerEvent::TimerFired(Timer::J)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminateReason::Completed)]
            }
            (_, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminateReason::TransportError)]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_core::{Headers, Method, RequestLine, SipUri, StatusLine};
    use sluice_transport::TransportKind;
    use smol_str::SmolStr;
    use std::time::Duration;

    fn udp_timers() -> TransactionTimers {
        TransactionTimers::new(TransportKind::Udp)
    }

    fn sample_request(method: Method) -> Request {
        let mut headers = Headers::new();
        headers.push("Via".into(), "SIP/2.0/UDP h;branch=z9hG4bKx".into());
        headers.push("CSeq".into(), SmolStr::new(format!("1 {}", method.as_str())));
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn sample_response(code: u16) -> Response {
        Response::new(
            StatusLine::new(code, SmolStr::new("Reason")),
            Headers::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn client_invite_2xx_terminates_after_single_delivery() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Deliver(r) if r.start.code == 200)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TerminateReason::Completed))));
        // No hop-by-hop ACK for 2xx; that is the dialog layer's end-to-end ACK.
        assert!(!actions.iter().any(|a| matches!(a, ClientAction::AckNon2xx(_))));
    }

    #[test]
    fn client_invite_non2xx_acks_and_absorbs_retransmits() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(sample_response(486)));
        assert_eq!(fsm.state, ClientInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::AckNon2xx(_))));
        assert!(actions.iter().any(
            |a| matches!(a, ClientAction::Schedule { timer: Timer::D, .. })
        ));

        // A retransmitted 486 re-ACKs without delivering again.
        let again = fsm.on_event(ClientEvent::ReceiveFinal(sample_response(486)));
        assert!(again.iter().any(|a| matches!(a, ClientAction::AckNon2xx(_))));
        assert!(!again.iter().any(|a| matches!(a, ClientAction::Deliver(_))));
    }

    #[test]
    fn client_invite_retransmits_with_backoff() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Invite)));

        let first = fsm.on_event(ClientEvent::TimerFired(Timer::A));
        let second = fsm.on_event(ClientEvent::TimerFired(Timer::A));
        let interval = |actions: &[ClientAction]| {
            actions.iter().find_map(|a| match a {
                ClientAction::Schedule { timer: Timer::A, duration } => Some(*duration),
                _ => None,
            })
        };
        assert_eq!(interval(&first), Some(Duration::from_secs(1)));
        assert_eq!(interval(&second), Some(Duration::from_secs(2)));
    }

    #[test]
    fn client_invite_timer_b_times_out() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientEvent::TimerFired(Timer::B));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TerminateReason::Timeout))));
    }

    #[test]
    fn provisional_stops_invite_retransmission() {
        let mut fsm = ClientInviteFsm::new(udp_timers());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Invite)));
        let actions = fsm.on_event(ClientEvent::ReceiveProvisional(sample_response(180)));
        assert_eq!(fsm.state, ClientInviteState::Proceeding);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Cancel(Timer::A))));
        // Timer A events in Proceeding do nothing.
        assert!(fsm.on_event(ClientEvent::TimerFired(Timer::A)).is_empty());
    }

    #[test]
    fn client_non_invite_full_flow() {
        let mut fsm = ClientNonInviteFsm::new(udp_timers());
        let actions = fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Bye)));
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Transmit(_))));

        fsm.on_event(ClientEvent::ReceiveProvisional(sample_response(100)));
        assert_eq!(fsm.state, NonInviteState::Proceeding);

        let actions = fsm.on_event(ClientEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state, NonInviteState::Completed);
        assert!(actions.iter().any(
            |a| matches!(a, ClientAction::Schedule { timer: Timer::K, .. })
        ));

        let actions = fsm.on_event(ClientEvent::TimerFired(Timer::K));
        assert_eq!(fsm.state, NonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TerminateReason::Completed))));
    }

    #[test]
    fn client_non_invite_timer_f_times_out() {
        let mut fsm = ClientNonInviteFsm::new(udp_timers());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Bye)));
        let actions = fsm.on_event(ClientEvent::TimerFired(Timer::F));
        assert_eq!(fsm.state, NonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate(TerminateReason::Timeout))));
    }

    #[test]
    fn server_invite_2xx_terminates_immediately() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        let actions = fsm.on_event(ServerEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(_))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TerminateReason::Completed))));
    }

    #[test]
    fn server_invite_non2xx_retransmits_until_ack() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerEvent::SendFinal(sample_response(486)));
        assert_eq!(fsm.state, ServerInviteState::Completed);

        let actions = fsm.on_event(ServerEvent::TimerFired(Timer::G));
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(_))));

        let actions = fsm.on_event(ServerEvent::ReceiveAck);
        assert_eq!(fsm.state, ServerInviteState::Confirmed);
        assert!(actions.iter().any(
            |a| matches!(a, ServerAction::Schedule { timer: Timer::I, .. })
        ));

        let actions = fsm.on_event(ServerEvent::TimerFired(Timer::I));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TerminateReason::Completed))));
    }

    #[test]
    fn server_invite_timer_h_without_ack_is_timeout() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        fsm.on_event(ServerEvent::SendFinal(sample_response(486)));
        let actions = fsm.on_event(ServerEvent::TimerFired(Timer::H));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TerminateReason::Timeout))));
    }

    #[test]
    fn server_invite_retransmit_resends_last_response() {
        let mut fsm = ServerInviteFsm::new(udp_timers());
        // Nothing sent yet: nothing to resend.
        assert!(fsm.on_retransmit().is_empty());

        fsm.on_event(ServerEvent::SendProvisional(sample_response(100)));
        assert!(fsm
            .on_retransmit()
            .iter()
            .any(|a| matches!(a, ServerAction::Transmit(_))));

        fsm.on_event(ServerEvent::SendFinal(sample_response(486)));
        assert!(fsm
            .on_retransmit()
            .iter()
            .any(|a| matches!(a, ServerAction::Transmit(_))));
    }

    #[test]
    fn server_non_invite_flow() {
        let mut fsm = ServerNonInviteFsm::new(udp_timers());
        let actions = fsm.on_event(ServerEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state, NonInviteState::Completed);
        assert!(actions.iter().any(
            |a| matches!(a, ServerAction::Schedule { timer: Timer::J, .. })
        ));
        assert!(fsm
            .on_retransmit()
            .iter()
            .any(|a| matches!(a, ServerAction::Transmit(_))));

        let actions = fsm.on_event(ServerEvent::TimerFired(Timer::J));
        assert_eq!(fsm.state, NonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerAction::Terminate(TerminateReason::Completed))));
    }
}
