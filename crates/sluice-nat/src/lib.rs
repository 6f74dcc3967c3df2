// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server-side NAT traversal in the nathelper style: when the addresses a
//! UA advertises disagree with where its packets actually come from, the
//! Contact URI and the SDP connection lines are rewritten to the observed
//! source before the message travels further.

use std::net::{IpAddr, SocketAddr};

use sluice_core::{uri_from_header, Headers};
use sluice_sdp::SessionDescription;
use smol_str::SmolStr;
use tracing::debug;

/// A network in CIDR notation used to classify private addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/len` or `addr/len` for IPv6.
    pub fn parse(raw: &str) -> Option<Cidr> {
        let (addr, prefix) = raw.trim().split_once('/')?;
        let network: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return None;
        }
        Some(Cidr { network, prefix })
    }

    /// Prefix match against an address of the same family.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// RFC 1918 networks plus loopback, the default private set.
pub fn default_private_cidrs() -> Vec<Cidr> {
    ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "127.0.0.0/8"]
        .iter()
        .filter_map(|raw| Cidr::parse(raw))
        .collect()
}

/// Classifies message sources against the configured private networks and
/// applies the Contact/SDP rewrites.
#[derive(Debug, Clone)]
pub struct NatInspector {
    cidrs: Vec<Cidr>,
}

impl NatInspector {
    pub fn new(cidrs: Vec<Cidr>) -> Self {
        Self { cidrs }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_private_cidrs())
    }

    /// True when the address falls in a configured private network.
    pub fn is_private(&self, addr: IpAddr) -> bool {
        self.cidrs.iter().any(|cidr| cidr.contains(addr))
    }

    fn is_private_host(&self, host: &str) -> bool {
        host.parse::<IpAddr>()
            .map(|addr| self.is_private(addr))
            .unwrap_or(false)
    }

    /// NAT detection: the advertised host is private while the source is
    /// not, or the advertised host simply differs from the source.
    pub fn is_behind_nat(&self, advertised_host: &str, source: SocketAddr) -> bool {
        if self.is_private_host(advertised_host) && !self.is_private(source.ip()) {
            return true;
        }
        match advertised_host.parse::<IpAddr>() {
            Ok(addr) => addr != source.ip(),
            // A hostname can never equal the numeric source.
            Err(_) => true,
        }
    }

    /// Rewrites the Contact URI host:port to the observed source when the
    /// contact looks NAT'd. Display name and parameters survive; a wildcard
    /// Contact is left alone. Returns whether a rewrite happened.
    pub fn rewrite_contact(&self, headers: &mut Headers, source: SocketAddr) -> bool {
        let value = match headers.get("Contact") {
            Some(value) => value.clone(),
            None => return false,
        };
        if value.trim() == "*" {
            return false;
        }
        let uri = match uri_from_header(&value) {
            Some(uri) => uri,
            None => return false,
        };
        if !self.is_behind_nat(&uri.host, source) {
            return false;
        }

        let corrected = uri.with_authority(&source.ip().to_string(), source.port());
        let rewritten = rebuild_contact(&value, &corrected.to_string());
        debug!(from = %value, to = %rewritten, "contact rewritten to observed source");
        headers.set("Contact", rewritten);
        true
    }

    /// Rewrites SDP connection addresses that are private and differ from
    /// the source, leaving ports untouched. Pure: returns the new SDP and
    /// whether anything changed.
    pub fn rewrite_sdp(
        &self,
        sdp: &SessionDescription,
        source: SocketAddr,
    ) -> (SessionDescription, bool) {
        let source_ip = source.ip().to_string();
        let changed = std::cell::Cell::new(false);
        let rewritten = sdp.map_connection_addresses(|addr| {
            if addr != source_ip && self.is_private_host(addr) {
                changed.set(true);
                Some(source_ip.clone())
            } else {
                None
            }
        });
        (rewritten, changed.get())
    }
}

/// Rebuilds a Contact header value around a replacement URI, preserving
/// the display name and any header parameters after the closing bracket.
fn rebuild_contact(original: &str, new_uri: &str) -> SmolStr {
    let trimmed = original.trim();
    if let (Some(open), Some(close)) = (trimmed.find('<'), trimmed.rfind('>')) {
        let display = &trimmed[..open];
        let suffix = &trimmed[close + 1..];
        SmolStr::new(format!("{}<{}>{}", display, new_uri, suffix))
    } else {
        // Bare addr-spec: header parameters follow the first semicolon.
        match trimmed.split_once(';') {
            Some((_, params)) => SmolStr::new(format!("<{}>;{}", new_uri, params)),
            None => SmolStr::new(format!("<{}>", new_uri)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspector() -> NatInspector {
        NatInspector::with_defaults()
    }

    fn source(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn cidr_matching() {
        let net = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(net.contains("10.255.0.1".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));

        let tight = Cidr::parse("172.16.0.0/12").unwrap();
        assert!(tight.contains("172.31.255.255".parse().unwrap()));
        assert!(!tight.contains("172.32.0.1".parse().unwrap()));

        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("bogus").is_none());
    }

    #[test]
    fn detects_private_contact_behind_public_source() {
        assert!(inspector().is_behind_nat("192.168.1.100", source("203.0.113.7:41002")));
    }

    #[test]
    fn detects_mismatched_public_hosts() {
        assert!(inspector().is_behind_nat("198.51.100.2", source("203.0.113.7:5060")));
    }

    #[test]
    fn matching_source_is_not_nat() {
        assert!(!inspector().is_behind_nat("203.0.113.7", source("203.0.113.7:5060")));
    }

    #[test]
    fn rewrites_private_contact() {
        let mut headers = Headers::new();
        headers.push("Contact".into(), "<sip:1001@192.168.1.100:5060>".into());
        let rewritten = inspector().rewrite_contact(&mut headers, source("203.0.113.7:41002"));
        assert!(rewritten);
        assert_eq!(
            headers.get("Contact").unwrap().as_str(),
            "<sip:1001@203.0.113.7:41002>"
        );
    }

    #[test]
    fn preserves_display_name_and_params() {
        let mut headers = Headers::new();
        headers.push(
            "Contact".into(),
            "\"Ada\" <sip:1001@10.0.0.5:5062;ob>;expires=60".into(),
        );
        inspector().rewrite_contact(&mut headers, source("203.0.113.7:41002"));
        assert_eq!(
            headers.get("Contact").unwrap().as_str(),
            "\"Ada\" <sip:1001@203.0.113.7:41002;ob>;expires=60"
        );
    }

    #[test]
    fn leaves_wildcard_and_matching_contacts_alone() {
        let mut headers = Headers::new();
        headers.push("Contact".into(), "*".into());
        assert!(!inspector().rewrite_contact(&mut headers, source("203.0.113.7:1")));

        let mut headers = Headers::new();
        headers.push("Contact".into(), "<sip:1001@203.0.113.7:41002>".into());
        assert!(!inspector().rewrite_contact(&mut headers, source("203.0.113.7:41002")));
    }

    #[test]
    fn sdp_rewrite_targets_private_mismatched_addresses() {
        let sdp = SessionDescription::parse(
            "v=0\r\nc=IN IP4 192.168.1.100\r\nm=audio 40000 RTP/AVP 0\r\n",
        )
        .unwrap();
        let (rewritten, changed) = inspector().rewrite_sdp(&sdp, source("203.0.113.7:41002"));
        assert!(changed);
        assert!(rewritten.to_body().contains("c=IN IP4 203.0.113.7"));
        // Port stays as declared.
        assert!(rewritten.to_body().contains("m=audio 40000"));
    }

    #[test]
    fn sdp_rewrite_leaves_public_addresses() {
        let sdp = SessionDescription::parse(
            "v=0\r\nc=IN IP4 198.51.100.2\r\nm=audio 40000 RTP/AVP 0\r\n",
        )
        .unwrap();
        let (rewritten, changed) = inspector().rewrite_sdp(&sdp, source("203.0.113.7:41002"));
        assert!(!changed);
        assert_eq!(rewritten.to_body(), sdp.to_body());
    }
}
