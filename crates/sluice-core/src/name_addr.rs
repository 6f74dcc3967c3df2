// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Helpers for `name-addr` style header values (From, To, Contact, Route).

use smol_str::SmolStr;

use crate::uri::SipUri;

/// Extracts the URI from a name-addr or addr-spec header value.
///
/// Handles `"Alice" <sip:alice@example.com>;tag=x` as well as the bare
/// `sip:alice@example.com;tag=x` form, where trailing parameters belong to
/// the header rather than the URI.
pub fn uri_from_header(value: &str) -> Option<SipUri> {
    let trimmed = value.trim();
    if let Some(start) = trimmed.find('<') {
        let end = trimmed[start + 1..].find('>')?;
        SipUri::parse(&trimmed[start + 1..start + 1 + end])
    } else {
        SipUri::parse(trimmed.split(';').next()?.trim())
    }
}

/// Extracts the `tag` parameter from a From/To header value.
pub fn tag_from_header(value: &str) -> Option<&str> {
    value.split(';').skip(1).find_map(|part| {
        let (name, tag) = part.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("tag") {
            Some(tag.trim())
        } else {
            None
        }
    })
}

/// Returns the header value with a `tag` parameter appended, unless one is
/// already present.
pub fn with_tag(value: &str, tag: &str) -> SmolStr {
    if tag_from_header(value).is_some() {
        SmolStr::new(value)
    } else {
        SmolStr::new(format!("{};tag={}", value, tag))
    }
}

/// Builds a name-addr contact value from a URI.
pub fn contact_value(uri: &SipUri) -> SmolStr {
    SmolStr::new(format!("<{}>", uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_uri_from_bracketed_form() {
        let uri = uri_from_header("\"Alice\" <sip:alice@example.com:5062>;tag=88").unwrap();
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.port, Some(5062));
    }

    #[test]
    fn extracts_uri_from_bare_form() {
        let uri = uri_from_header("sip:bob@10.0.0.11;tag=42").unwrap();
        assert_eq!(uri.user.as_deref(), Some("bob"));
        // The ;tag belongs to the header, not the URI.
        assert!(uri.param("tag").is_none());
    }

    #[test]
    fn finds_tag_parameter() {
        assert_eq!(
            tag_from_header("<sip:a@h>;x=1;tag=abc123"),
            Some("abc123")
        );
        assert_eq!(tag_from_header("<sip:a@h>"), None);
    }

    #[test]
    fn with_tag_is_idempotent() {
        let tagged = with_tag("<sip:a@h>", "t1");
        assert_eq!(tagged.as_str(), "<sip:a@h>;tag=t1");
        assert_eq!(with_tag(tagged.as_str(), "t2").as_str(), tagged.as_str());
    }
}
