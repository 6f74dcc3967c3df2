// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dialog leg state per RFC 3261 §12, shaped for B2BUA use.
//!
//! A leg holds everything needed to build the next in-dialog request
//! towards its peer: the dialog id triple, the From/To header values as
//! they appear from this leg's perspective, the remote target (Contact,
//! NAT-corrected), the route set, and both CSeq counters.

use std::net::SocketAddr;

use bytes::Bytes;
use sluice_core::{
    tag_from_header, uri_from_header, Headers, Method, Request, RequestLine, Response, SipUri,
};
use smol_str::SmolStr;

/// Dialog leg states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    /// 1xx-with-tag seen, no 2xx yet.
    Early,
    /// 2xx exchanged (and ACK'd for the UAS side).
    Confirmed,
    Terminated,
}

/// Which role this server plays on the leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    /// We answered this leg (the A-leg of a bridged call).
    Uas,
    /// We originated this leg (the B-leg).
    Uac,
}

/// Dialog identifier triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

/// One dialog leg of a bridged call.
#[derive(Debug, Clone)]
pub struct Leg {
    pub role: LegRole,
    pub state: LegState,
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: Option<SmolStr>,
    /// Header value identifying us on this leg (From for UAC, tagged To
    /// for UAS), reused verbatim on in-dialog requests.
    pub local_header: SmolStr,
    /// Header value identifying the peer, including their tag once known.
    pub remote_header: SmolStr,
    /// Where in-dialog requests go: the peer's NAT-corrected Contact.
    pub remote_target: SipUri,
    /// Route set from Record-Route, already in send order.
    pub route_set: Vec<SmolStr>,
    /// Transport address the peer was last reached at.
    pub remote_addr: SocketAddr,
    pub local_cseq: u32,
    pub remote_cseq: u32,
}

impl Leg {
    /// Builds the UAS-side leg from an inbound INVITE. The caller supplies
    /// the freshly minted local tag and the NAT-corrected contact.
    pub fn from_uas_invite(
        request: &Request,
        local_tag: SmolStr,
        remote_target: SipUri,
        remote_addr: SocketAddr,
    ) -> Option<Leg> {
        let call_id = request.headers.get("Call-ID")?.clone();
        let from = request.headers.get("From")?.clone();
        let to = request.headers.get("To")?.clone();
        let remote_tag = tag_from_header(&from).map(SmolStr::new)?;
        let remote_cseq = request_cseq(request)?;

        Some(Leg {
            role: LegRole::Uas,
            state: LegState::Early,
            call_id,
            local_header: SmolStr::new(format!("{};tag={}", to, local_tag)),
            local_tag,
            remote_tag: Some(remote_tag),
            remote_header: from,
            remote_target,
            route_set: Vec::new(),
            remote_addr,
            local_cseq: 0,
            remote_cseq,
        })
    }

    /// Builds the UAC-side leg for an outbound INVITE we are about to send.
    pub fn new_uac(
        call_id: SmolStr,
        local_header: SmolStr,
        local_tag: SmolStr,
        remote_header: SmolStr,
        remote_target: SipUri,
        remote_addr: SocketAddr,
        invite_cseq: u32,
    ) -> Leg {
        Leg {
            role: LegRole::Uac,
            state: LegState::Early,
            call_id,
            local_tag,
            remote_tag: None,
            local_header,
            remote_header,
            remote_target,
            route_set: Vec::new(),
            remote_addr,
            local_cseq: invite_cseq,
            remote_cseq: 0,
        }
    }

    /// Dialog id triple, once the remote tag is known.
    pub fn dialog_id(&self) -> Option<DialogId> {
        Some(DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone()?,
        })
    }

    /// Absorbs dialog state from a UAC response: remote tag, refreshed
    /// remote target from Contact, and the route set from Record-Route
    /// (reversed into send order).
    pub fn absorb_uac_response(&mut self, response: &Response) {
        if self.remote_tag.is_none() {
            if let Some(tag) = response.headers.get("To").and_then(|to| tag_from_header(to)) {
                self.remote_tag = Some(SmolStr::new(tag));
            }
        }
        if let Some(to) = response.headers.get("To") {
            self.remote_header = to.clone();
        }
        if let Some(contact) = response
            .headers
            .get("Contact")
            .and_then(|c| uri_from_header(c))
        {
            self.remote_target = contact;
        }
        let mut record_routes: Vec<SmolStr> = response
            .headers
            .get_all("Record-Route")
            .cloned()
            .collect();
        if !record_routes.is_empty() {
            record_routes.reverse();
            self.route_set = record_routes;
        }
    }

    /// Tracks a target refresh from an in-dialog request (re-INVITE /
    /// UPDATE Contact).
    pub fn absorb_target_refresh(&mut self, request: &Request) {
        if let Some(contact) = request
            .headers
            .get("Contact")
            .and_then(|c| uri_from_header(c))
        {
            self.remote_target = contact;
        }
    }

    pub fn confirm(&mut self) {
        if self.state == LegState::Early {
            self.state = LegState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = LegState::Terminated;
    }

    /// Next CSeq for a request we originate on this leg.
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq = self.local_cseq.saturating_add(1);
        self.local_cseq
    }

    /// Builds an in-dialog request towards the peer. The caller provides
    /// the Via value (fresh branch) and optionally a Contact; the CSeq is
    /// supplied explicitly so ACK can reuse the INVITE's number.
    pub fn build_request(
        &self,
        method: Method,
        cseq: u32,
        via: SmolStr,
        contact: Option<SmolStr>,
        content_type: Option<SmolStr>,
        body: Bytes,
    ) -> Request {
        let mut headers = Headers::new();
        headers.push("Via".into(), via);
        headers.push("Max-Forwards".into(), "70".into());
        headers.push("From".into(), self.local_header.clone());
        headers.push("To".into(), self.remote_header.clone());
        headers.push("Call-ID".into(), self.call_id.clone());
        headers.push(
            "CSeq".into(),
            SmolStr::new(format!("{} {}", cseq, method.as_str())),
        );
        for route in &self.route_set {
            headers.push("Route".into(), route.clone());
        }
        if let Some(contact) = contact {
            headers.push("Contact".into(), contact);
        }
        if let Some(content_type) = content_type {
            headers.push("Content-Type".into(), content_type);
        }
        Request::new(
            RequestLine::new(method, self.remote_target.clone()),
            headers,
            body,
        )
    }
}

fn request_cseq(request: &Request) -> Option<u32> {
    request
        .headers
        .get("CSeq")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}
