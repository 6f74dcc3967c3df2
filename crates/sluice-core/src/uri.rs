// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use smol_str::SmolStr;

/// A parsed `sip:` URI.
///
/// The model keeps only the pieces the B2BUA routes on: user, host, port and
/// URI parameters. Headers embedded in the URI (`?subject=...`) are dropped
/// on parse; the engine never generates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    /// URI parameters in order of appearance, value-less params carry `None`.
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl SipUri {
    /// Parses a `sip:` URI. Returns `None` for other schemes or malformed input.
    pub fn parse(raw: &str) -> Option<SipUri> {
        let rest = raw.trim().strip_prefix("sip:")?;
        let rest = rest.split('?').next().unwrap_or(rest);

        let (userinfo, hostpart) = match rest.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, rest),
        };

        let mut segments = hostpart.split(';');
        let authority = segments.next()?;
        if authority.is_empty() {
            return None;
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !h.contains(':') => (h, Some(p.parse::<u16>().ok()?)),
            _ => (authority, None),
        };
        if host.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        for segment in segments {
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => {
                    params.push((SmolStr::new(name), Some(SmolStr::new(value))))
                }
                None => params.push((SmolStr::new(segment), None)),
            }
        }

        let user = userinfo.and_then(|u| {
            // Strip any password component; the engine never uses it.
            let user = u.split(':').next().unwrap_or(u);
            if user.is_empty() {
                None
            } else {
                Some(SmolStr::new(user))
            }
        });

        Some(SipUri {
            user,
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Returns the value of a URI parameter, if present.
    pub fn param(&self, name: &str) -> Option<&SmolStr> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_ref())
    }

    /// Port with the SIP default applied.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    /// Resolves the URI host:port into a socket address when the host is a
    /// numeric IP. Name resolution is a transport concern, not handled here.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.host.parse::<IpAddr>().ok()?;
        Some(SocketAddr::new(ip, self.port_or_default()))
    }

    /// Returns a copy of the URI with the authority replaced, keeping user
    /// and parameters. Used by the NAT helper to retarget contacts.
    pub fn with_authority(&self, host: &str, port: u16) -> SipUri {
        SipUri {
            user: self.user.clone(),
            host: SmolStr::new(host),
            port: Some(port),
            params: self.params.clone(),
        }
    }

    /// The `user@host` form used as a registrar AoR key. Parameters and
    /// ports are dropped so registration and lookup agree.
    pub fn aor(&self) -> SmolStr {
        match &self.user {
            Some(user) => SmolStr::new(format!("{}@{}", user, self.host.to_ascii_lowercase())),
            None => SmolStr::new(self.host.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = SipUri::parse("sip:alice@10.0.0.10:5070;transport=udp").unwrap();
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "10.0.0.10");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.param("transport").map(|v| v.as_str()), Some("udp"));
    }

    #[test]
    fn parses_hostonly_uri() {
        let uri = SipUri::parse("sip:example.com").unwrap();
        assert_eq!(uri.user, None);
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(SipUri::parse("tel:+15551234567").is_none());
        assert!(SipUri::parse("http://example.com").is_none());
    }

    #[test]
    fn display_round_trips() {
        let raw = "sip:bob@192.168.1.5:5062;transport=tcp;lr";
        let uri = SipUri::parse(raw).unwrap();
        assert_eq!(uri.to_string(), raw);
    }

    #[test]
    fn with_authority_keeps_user_and_params() {
        let uri = SipUri::parse("sip:1001@192.168.1.100:5060;ob").unwrap();
        let moved = uri.with_authority("203.0.113.7", 41002);
        assert_eq!(moved.to_string(), "sip:1001@203.0.113.7:41002;ob");
    }

    #[test]
    fn aor_is_user_at_lowercase_host() {
        let uri = SipUri::parse("sip:1001@Example.COM:5062;transport=udp").unwrap();
        assert_eq!(uri.aor().as_str(), "1001@example.com");
    }

    #[test]
    fn socket_addr_for_numeric_hosts_only() {
        assert!(SipUri::parse("sip:a@10.0.0.1").unwrap().socket_addr().is_some());
        assert!(SipUri::parse("sip:a@example.com")
            .unwrap()
            .socket_addr()
            .is_none());
    }
}
