// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! Parses requests and responses from raw datagrams or framed TCP segments.
//! Serialization copies untouched headers through verbatim, in order, and
//! regenerates only Content-Length, so messages survive one hop byte-stable.
//!
//! # Example
//! ```
//! use sluice_parse::{parse_request, serialize_request};
//! use bytes::Bytes;
//! # let raw = b"OPTIONS sip:example.com SIP/2.0\r\nVia: SIP/2.0/UDP h;branch=z9hG4bKx\r\nMax-Forwards: 70\r\nTo: <sip:b@example.com>\r\nFrom: <sip:a@example.com>;tag=1\r\nCall-ID: abc\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(&Bytes::from_static(raw)).unwrap();
//! let serialized = serialize_request(&request);
//! ```

use bytes::{Bytes, BytesMut};
use sluice_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use smol_str::SmolStr;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest Content-Length the parser will honour. SIP bodies are SDP-sized;
/// anything bigger is treated as hostile framing.
const MAX_CONTENT_LENGTH: usize = 1024 * 1024;

/// Headers that must appear exactly once in a request.
const SINGLE_VALUED: [&str; 5] = ["From", "To", "Call-ID", "CSeq", "Max-Forwards"];

/// Parses a SIP request from a UDP datagram.
///
/// The datagram is assumed to be one whole message; a short body is
/// truncated to the declared Content-Length and surplus bytes are ignored.
pub fn parse_request(datagram: &Bytes) -> Option<Request> {
    parse_request_inner(datagram, false)
}

/// Parses a SIP request in strict mode, for framed stream transports.
///
/// The declared Content-Length must match the framed body exactly.
pub fn parse_request_strict(datagram: &Bytes) -> Option<Request> {
    parse_request_inner(datagram, true)
}

fn parse_request_inner(datagram: &Bytes, strict: bool) -> Option<Request> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let (method, uri) = parse_request_line(first)?;
    let headers = parse_headers(lines)?;

    for name in ["Via", "From", "To", "Call-ID", "CSeq", "Max-Forwards"] {
        if headers.get(name).is_none() {
            return None;
        }
    }
    for name in SINGLE_VALUED {
        if headers.get_all(name).count() > 1 {
            return None;
        }
    }
    if !cseq_matches(&headers, &method)? {
        return None;
    }

    let body = if strict {
        extract_body_strict(body_bytes, &headers)?
    } else {
        extract_body(body_bytes, &headers)?
    };

    Some(Request::new(RequestLine::new(method, uri), headers, body))
}

/// Parses a SIP response from a UDP datagram.
pub fn parse_response(datagram: &Bytes) -> Option<Response> {
    parse_response_inner(datagram, false)
}

/// Parses a SIP response in strict mode, for framed stream transports.
pub fn parse_response_strict(datagram: &Bytes) -> Option<Response> {
    parse_response_inner(datagram, true)
}

fn parse_response_inner(datagram: &Bytes, strict: bool) -> Option<Response> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let status = parse_status_line(first)?;
    let headers = parse_headers(lines)?;
    let body = if strict {
        extract_body_strict(body_bytes, &headers)?
    } else {
        extract_body(body_bytes, &headers)?
    };

    Some(Response::new(status, headers, body))
}

/// Serializes a SIP request, normalising the `Content-Length` header.
pub fn serialize_request(req: &Request) -> Bytes {
    let mut buf = String::new();
    use std::fmt::Write;

    let _ = write!(buf, "{} {} SIP/2.0\r\n", req.start.method.as_str(), req.start.uri);

    let mut has_max_forwards = false;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }
    if !has_max_forwards {
        buf.push_str("Max-Forwards: 70\r\n");
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", req.body.len());

    let mut out = BytesMut::with_capacity(buf.len() + req.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(req.body.as_ref());
    out.freeze()
}

/// Serializes a SIP response, normalising the `Content-Length` header.
pub fn serialize_response(res: &Response) -> Bytes {
    let mut buf = String::new();
    use std::fmt::Write;

    let _ = write!(buf, "SIP/2.0 {} {}\r\n", res.start.code, res.start.reason);
    for header in res.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", res.body.len());

    let mut out = BytesMut::with_capacity(buf.len() + res.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(res.body.as_ref());
    out.freeze()
}

/// Returns the first header value matching `name`, accepting compact forms.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a SmolStr> {
    headers.get(name)
}

/// Parses the `CSeq` header into its sequence number.
pub fn cseq_number(headers: &Headers) -> Option<u32> {
    headers.get("CSeq")?.split_whitespace().next()?.parse().ok()
}

/// Parses the `CSeq` header into its method token.
pub fn cseq_method(headers: &Headers) -> Option<Method> {
    let token = headers.get("CSeq")?.split_whitespace().nth(1)?;
    Some(Method::from_token(token))
}

/// Parses the `Expires` header as seconds.
pub fn expires_value(headers: &Headers) -> Option<u32> {
    headers.get("Expires")?.trim().parse().ok()
}

fn parse_request_line(line: &str) -> Option<(Method, SipUri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim()).ok()?;

    if !version_token.eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    let uri = SipUri::parse(uri_token)?;
    Some((Method::from_token(method_token), uri))
}

fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line.trim()).ok()?;
    if !(100..=699).contains(&code) {
        return None;
    }
    Some(StatusLine::new(code, SmolStr::new(reason.trim())))
}

/// Splits raw bytes into header text and body slice on the `\r\n\r\n` separator.
fn split_head_body(datagram: &Bytes) -> Option<(&str, &[u8])> {
    let data = datagram.as_ref();
    let delim = b"\r\n\r\n";

    if let Some(pos) = data.windows(delim.len()).position(|window| window == delim) {
        let head = std::str::from_utf8(&data[..pos]).ok()?;
        Some((head, &data[pos + delim.len()..]))
    } else {
        let head = std::str::from_utf8(data).ok()?;
        Some((head, &[]))
    }
}

/// Parses the header block. Folded continuation lines are rejected per
/// RFC 3261 §7.3.1 (deprecated syntax this server never emits).
fn parse_headers<'a, I>(lines: I) -> Option<Headers>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        let name = canonical_header_name(name.trim());
        headers.push(name, SmolStr::new(value.trim()));
    }
    Some(headers)
}

/// Expands RFC 3261 compact header forms to their canonical names.
fn canonical_header_name(name: &str) -> SmolStr {
    let canonical = match name.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "v" => "Via",
        "c" => "Content-Type",
        "k" => "Supported",
        "e" => "Content-Encoding",
        "s" => "Subject",
        _ => return SmolStr::new(name),
    };
    SmolStr::new(canonical)
}

/// Returns the body truncated to the declared Content-Length, or `None`
/// when the declaration exceeds what arrived.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Option<Bytes> {
    let declared = match declared_content_length(headers)? {
        Some(len) => len,
        None => body_bytes.len(),
    };
    if declared > body_bytes.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(&body_bytes[..declared]))
}

/// Strict variant: the declared length must match the framed body exactly.
fn extract_body_strict(body_bytes: &[u8], headers: &Headers) -> Option<Bytes> {
    let declared = declared_content_length(headers)?.unwrap_or(0);
    if declared != body_bytes.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(body_bytes))
}

/// Resolves the Content-Length headers into one declared value.
///
/// Outer `None` = malformed (unparseable, oversized, or conflicting values);
/// inner `None` = header absent.
fn declared_content_length(headers: &Headers) -> Option<Option<usize>> {
    let mut declared: Option<usize> = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value.trim().parse::<usize>().ok()?;
        if parsed > MAX_CONTENT_LENGTH {
            return None;
        }
        match declared {
            Some(existing) if existing != parsed => return None,
            _ => declared = Some(parsed),
        }
    }
    Some(declared)
}

fn cseq_matches(headers: &Headers, method: &Method) -> Option<bool> {
    let cseq = headers.get("CSeq")?;
    let mut parts = cseq.split_whitespace();
    let _number = parts.next()?.parse::<u32>().ok()?;
    let token = parts.next()?;
    Some(method.as_str() == token)
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}
