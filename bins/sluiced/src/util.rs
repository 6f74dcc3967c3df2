//! Message-building helpers shared by the handlers and the call engine.

use bytes::Bytes;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sluice_core::{with_tag, Headers, Request, Response, StatusLine};
use smol_str::SmolStr;

/// Builds a response to a request, echoing the dialog-identifying headers.
/// A `to_tag` is appended unless the To header already carries one.
pub fn response_for(request: &Request, code: u16, reason: &str, to_tag: Option<&str>) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via".into(), via.clone());
    }
    if let Some(from) = request.headers.get("From") {
        headers.push("From".into(), from.clone());
    }
    if let Some(to) = request.headers.get("To") {
        let to = match to_tag {
            Some(tag) => with_tag(to, tag),
            None => to.clone(),
        };
        headers.push("To".into(), to);
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        headers.push("Call-ID".into(), call_id.clone());
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.push("CSeq".into(), cseq.clone());
    }
    Response::new(
        StatusLine::new(code, SmolStr::new(reason)),
        headers,
        Bytes::new(),
    )
}

/// Attaches an SDP body (and Content-Type) to a response.
pub fn with_sdp(mut response: Response, body: String) -> Response {
    response
        .headers
        .push("Content-Type".into(), "application/sdp".into());
    response.body = Bytes::from(body);
    response
}

/// Random dialog tag.
pub fn random_tag() -> SmolStr {
    SmolStr::new(random_token(10))
}

pub fn random_token(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Decrements Max-Forwards in place. Returns `false` when the hop count is
/// exhausted and the request must be answered 483.
pub fn decrement_max_forwards(headers: &mut Headers) -> bool {
    let current = headers
        .get("Max-Forwards")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(70);
    if current == 0 {
        return false;
    }
    headers.set("Max-Forwards", SmolStr::new((current - 1).to_string()));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{Method, RequestLine, SipUri};

    fn request() -> Request {
        let mut headers = Headers::new();
        headers.push("Via".into(), "SIP/2.0/UDP a;branch=z9hG4bK1".into());
        headers.push("Via".into(), "SIP/2.0/UDP b;branch=z9hG4bK2".into());
        headers.push("From".into(), "<sip:a@h>;tag=f".into());
        headers.push("To".into(), "<sip:b@h>".into());
        headers.push("Call-ID".into(), "c1".into());
        headers.push("CSeq".into(), "3 INVITE".into());
        headers.push("Max-Forwards".into(), "70".into());
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:b@h").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn response_echoes_vias_in_order() {
        let response = response_for(&request(), 180, "Ringing", Some("t9"));
        let vias: Vec<_> = response
            .headers
            .get_all("Via")
            .map(|v| v.as_str())
            .collect();
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("branch=z9hG4bK1"));
        assert_eq!(
            response.headers.get("To").unwrap().as_str(),
            "<sip:b@h>;tag=t9"
        );
    }

    #[test]
    fn max_forwards_decrement_and_exhaustion() {
        let mut headers = request().headers;
        assert!(decrement_max_forwards(&mut headers));
        assert_eq!(headers.get("Max-Forwards").unwrap().as_str(), "69");

        headers.set("Max-Forwards", "0".into());
        assert!(!decrement_max_forwards(&mut headers));
    }

    #[test]
    fn sdp_attachment_sets_content_type() {
        let response = with_sdp(response_for(&request(), 200, "OK", None), "v=0\r\n".into());
        assert_eq!(
            response.headers.get("Content-Type").unwrap().as_str(),
            "application/sdp"
        );
        assert_eq!(response.body.as_ref(), b"v=0\r\n");
    }
}
