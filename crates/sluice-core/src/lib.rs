// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP message model shared by every Sluice crate.
//!
//! Keeps the wire-adjacent types (methods, URIs, headers, request/response
//! shells) free of I/O and parsing concerns; the parser lives in
//! `sluice-parse`.

pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod uri;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, StatusLine};
pub use name_addr::{contact_value, tag_from_header, uri_from_header, with_tag};
pub use uri::SipUri;
