// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Order-preserving SDP model.
//!
//! The B2BUA never negotiates media; it only retargets connection addresses
//! and media ports at the relay. Everything else must survive the hop
//! byte-identical, so the model keeps the original lines verbatim and
//! rewriting is a pure function producing a new description.

use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("empty SDP body")]
    Empty,
    #[error("SDP must start with a v= line")]
    MissingVersion,
    #[error("malformed {kind} line at line {line}")]
    MalformedLine { kind: &'static str, line: usize },
}

/// Media kinds the relay steers. Anything else is passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other,
}

/// One `m=` section: the media line plus everything until the next one.
#[derive(Debug, Clone)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub port: u16,
    /// RTP payload type tokens from the m= line, in order.
    pub formats: Vec<SmolStr>,
    /// `a=rtpmap` entries within the section as (payload, encoding) pairs.
    pub rtpmaps: Vec<(SmolStr, SmolStr)>,
    /// Section-level connection address, when a c= line appears here.
    pub connection: Option<SmolStr>,
    line_index: usize,
}

/// A parsed SDP body. Construction validates structure; the raw lines are
/// retained so serialization reproduces unmodified input exactly.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    lines: Vec<String>,
    session_connection: Option<SmolStr>,
    media: Vec<MediaSection>,
}

impl SessionDescription {
    /// Parses an SDP body. Lines may be `\r\n` or `\n` terminated.
    pub fn parse(body: &str) -> Result<SessionDescription, SdpError> {
        let lines: Vec<String> = body
            .split('\n')
            .map(|l| l.trim_end_matches('\r').to_owned())
            .filter(|l| !l.is_empty())
            .collect();
        Self::from_lines(lines)
    }

    fn from_lines(lines: Vec<String>) -> Result<SessionDescription, SdpError> {
        if lines.is_empty() {
            return Err(SdpError::Empty);
        }
        if !lines[0].starts_with("v=") {
            return Err(SdpError::MissingVersion);
        }

        let mut session_connection = None;
        let mut media: Vec<MediaSection> = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            if let Some(rest) = line.strip_prefix("c=") {
                let addr = parse_connection(rest)
                    .ok_or(SdpError::MalformedLine { kind: "c=", line: index })?;
                match media.last_mut() {
                    Some(section) => section.connection = Some(addr),
                    None => session_connection = Some(addr),
                }
            } else if let Some(rest) = line.strip_prefix("m=") {
                let section = parse_media(rest, index)
                    .ok_or(SdpError::MalformedLine { kind: "m=", line: index })?;
                media.push(section);
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if let Some(section) = media.last_mut() {
                    if let Some((payload, encoding)) = rest.split_once(' ') {
                        section
                            .rtpmaps
                            .push((SmolStr::new(payload.trim()), SmolStr::new(encoding.trim())));
                    }
                }
            }
        }

        Ok(SessionDescription {
            lines,
            session_connection,
            media,
        })
    }

    /// The session-level `c=` address, if present.
    pub fn session_connection(&self) -> Option<&str> {
        self.session_connection.as_deref()
    }

    /// All media sections in order of appearance.
    pub fn media(&self) -> &[MediaSection] {
        &self.media
    }

    /// First media section of the given kind.
    pub fn media_of(&self, kind: MediaKind) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.kind == kind)
    }

    /// The connection address governing a media kind: the section-level `c=`
    /// when present, otherwise the session-level one.
    pub fn connection_for(&self, kind: MediaKind) -> Option<&str> {
        let section = self.media_of(kind)?;
        section
            .connection
            .as_deref()
            .or(self.session_connection.as_deref())
    }

    /// Returns a copy with every `c=` connection address replaced by `addr`.
    /// Ports are untouched. Used when steering media through the relay.
    pub fn with_connection_address(&self, addr: &str) -> SessionDescription {
        self.map_connection_addresses(|_| Some(addr.to_owned()))
    }

    /// Returns a copy where each `c=` address is replaced by whatever the
    /// mapping returns for it; `None` keeps the original line byte-identical.
    /// This is the NAT-helper entry point.
    pub fn map_connection_addresses<F>(&self, mapping: F) -> SessionDescription
    where
        F: Fn(&str) -> Option<String>,
    {
        let lines = self
            .lines
            .iter()
            .map(|line| match line.strip_prefix("c=") {
                Some(rest) => match parse_connection(rest) {
                    Some(addr) => match mapping(addr.as_str()) {
                        Some(new_addr) => rewrite_connection_line(rest, &new_addr),
                        None => line.clone(),
                    },
                    None => line.clone(),
                },
                None => line.clone(),
            })
            .collect();
        // Structure was valid before and the rewrite touches only addresses.
        Self::from_lines(lines).expect("rewritten SDP remains structurally valid")
    }

    /// Returns a copy with the port of the first media section of `kind`
    /// replaced. All other fields of the m= line are preserved.
    pub fn with_media_port(&self, kind: MediaKind, port: u16) -> SessionDescription {
        let target = match self.media_of(kind) {
            Some(section) => section.line_index,
            None => return self.clone(),
        };
        let lines = self
            .lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                if index == target {
                    rewrite_media_port(line, port)
                } else {
                    line.clone()
                }
            })
            .collect();
        Self::from_lines(lines).expect("rewritten SDP remains structurally valid")
    }

    /// Serializes back to wire form with CRLF line endings.
    pub fn to_body(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

fn parse_connection(rest: &str) -> Option<SmolStr> {
    // c=<nettype> <addrtype> <connection-address>
    let mut parts = rest.split_whitespace();
    let net = parts.next()?;
    let addr_type = parts.next()?;
    let addr = parts.next()?;
    if net != "IN" || !(addr_type == "IP4" || addr_type == "IP6") {
        return None;
    }
    Some(SmolStr::new(addr))
}

fn rewrite_connection_line(rest: &str, new_addr: &str) -> String {
    let mut parts = rest.split_whitespace();
    let net = parts.next().unwrap_or("IN");
    let addr_type = parts.next().unwrap_or("IP4");
    let trailing: Vec<&str> = parts.skip(1).collect();
    let mut line = format!("c={} {} {}", net, addr_type, new_addr);
    for extra in trailing {
        line.push(' ');
        line.push_str(extra);
    }
    line
}

fn parse_media(rest: &str, line_index: usize) -> Option<MediaSection> {
    // m=<media> <port>[/<count>] <proto> <fmt>...
    let mut parts = rest.split_whitespace();
    let media = parts.next()?;
    let port_token = parts.next()?;
    let port = port_token
        .split('/')
        .next()?
        .parse::<u16>()
        .ok()?;
    let _proto = parts.next()?;
    let formats = parts.map(SmolStr::new).collect();

    let kind = match media {
        "audio" => MediaKind::Audio,
        "video" => MediaKind::Video,
        _ => MediaKind::Other,
    };

    Some(MediaSection {
        kind,
        port,
        formats,
        rtpmaps: Vec::new(),
        connection: None,
        line_index,
    })
}

fn rewrite_media_port(line: &str, port: u16) -> String {
    // Replace the second whitespace-separated token, keeping a possible
    // /count suffix and everything after it verbatim.
    let rest = match line.strip_prefix("m=") {
        Some(rest) => rest,
        None => return line.to_owned(),
    };
    let mut parts = rest.split(' ');
    let media = parts.next().unwrap_or("");
    let port_token = parts.next().unwrap_or("");
    let suffix = port_token
        .split_once('/')
        .map(|(_, count)| format!("/{}", count))
        .unwrap_or_default();
    let remainder: Vec<&str> = parts.collect();
    let mut out = format!("m={} {}{}", media, port, suffix);
    for token in remainder {
        out.push(' ');
        out.push_str(token);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1001 1 IN IP4 10.0.0.10\r\n\
s=call\r\n\
c=IN IP4 10.0.0.10\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0 8\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=sendrecv\r\n";

    const OFFER_AV: &str = "v=0\r\n\
o=- 1001 1 IN IP4 10.0.0.10\r\n\
s=call\r\n\
c=IN IP4 10.0.0.10\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
m=video 40002 RTP/AVP 96\r\n\
c=IN IP4 192.168.1.7\r\n\
a=rtpmap:96 H264/90000\r\n";

    #[test]
    fn parses_session_and_media() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.session_connection(), Some("10.0.0.10"));
        assert_eq!(sdp.media().len(), 1);
        let audio = sdp.media_of(MediaKind::Audio).unwrap();
        assert_eq!(audio.port, 40000);
        assert_eq!(audio.formats, vec![SmolStr::new("0"), SmolStr::new("8")]);
        assert_eq!(audio.rtpmaps.len(), 2);
        assert_eq!(audio.rtpmaps[0].1.as_str(), "PCMU/8000");
    }

    #[test]
    fn media_level_connection_overrides_session() {
        let sdp = SessionDescription::parse(OFFER_AV).unwrap();
        assert_eq!(sdp.connection_for(MediaKind::Audio), Some("10.0.0.10"));
        assert_eq!(sdp.connection_for(MediaKind::Video), Some("192.168.1.7"));
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.to_body(), OFFER);
    }

    #[test]
    fn rewrite_touches_only_target_lines() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        let steered = sdp
            .with_connection_address("198.51.100.1")
            .with_media_port(MediaKind::Audio, 35000);

        let original: Vec<&str> = OFFER.split("\r\n").collect();
        let rewritten = steered.to_body();
        let rewritten_lines: Vec<&str> = rewritten.split("\r\n").collect();
        assert_eq!(original.len(), rewritten_lines.len());
        for (before, after) in original.iter().zip(rewritten_lines.iter()) {
            if before.starts_with("c=") {
                assert_eq!(*after, "c=IN IP4 198.51.100.1");
            } else if before.starts_with("m=audio") {
                assert_eq!(*after, "m=audio 35000 RTP/AVP 0 8");
            } else {
                assert_eq!(before, after, "untouched line changed");
            }
        }
    }

    #[test]
    fn selective_connection_mapping() {
        let sdp = SessionDescription::parse(OFFER_AV).unwrap();
        // Only rewrite the private 192.168 address, leave 10.0.0.10 alone.
        let rewritten = sdp.map_connection_addresses(|addr| {
            if addr.starts_with("192.168.") {
                Some("203.0.113.7".to_owned())
            } else {
                None
            }
        });
        assert_eq!(rewritten.connection_for(MediaKind::Audio), Some("10.0.0.10"));
        assert_eq!(
            rewritten.connection_for(MediaKind::Video),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn video_port_rewrite_keeps_audio() {
        let sdp = SessionDescription::parse(OFFER_AV).unwrap();
        let steered = sdp.with_media_port(MediaKind::Video, 36000);
        assert_eq!(steered.media_of(MediaKind::Audio).unwrap().port, 40000);
        assert_eq!(steered.media_of(MediaKind::Video).unwrap().port, 36000);
    }

    #[test]
    fn port_count_suffix_is_preserved() {
        let body = "v=0\r\nm=audio 40000/2 RTP/AVP 0\r\n";
        let sdp = SessionDescription::parse(body).unwrap();
        let steered = sdp.with_media_port(MediaKind::Audio, 35000);
        assert!(steered.to_body().contains("m=audio 35000/2 RTP/AVP 0"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(SessionDescription::parse(""), Err(SdpError::Empty)));
        assert!(matches!(
            SessionDescription::parse("o=- 0 0\r\n"),
            Err(SdpError::MissingVersion)
        ));
        assert!(matches!(
            SessionDescription::parse("v=0\r\nm=audio notaport RTP/AVP 0\r\n"),
            Err(SdpError::MalformedLine { kind: "m=", .. })
        ));
        assert!(matches!(
            SessionDescription::parse("v=0\r\nc=bogus\r\n"),
            Err(SdpError::MalformedLine { kind: "c=", .. })
        ));
    }
}
