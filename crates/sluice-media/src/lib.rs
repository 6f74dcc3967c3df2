// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Media session lifecycle, one relay session per Call-ID.
//!
//! Drives the rtpproxy client in lock-step with dialog state: offer at
//! INVITE time, answer at 200 OK time, update on renegotiation, delete on
//! call end. Audio always; a parallel video stream is allocated when the
//! offer carries an `m=video` section, correlated by the same Call-ID and
//! tags under a distinct stream identifier.
//!
//! Commands for one Call-ID are serialized behind a per-session mutex;
//! sessions for different Call-IDs proceed independently.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use sluice_rtpp::{RtppClient, RtppError};
use sluice_sdp::{MediaKind, SessionDescription};
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Stream identifier suffix for the parallel video relay session.
const VIDEO_STREAM_SUFFIX: &str = "~video";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no live media session for call {0}")]
    NoSession(SmolStr),
    #[error("SDP carries no audio section")]
    NoAudio,
    #[error(transparent)]
    Relay(#[from] RtppError),
}

impl MediaError {
    /// True when the relay itself is unreachable (503 territory, as
    /// opposed to a per-session 488).
    pub fn backend_unavailable(&self) -> bool {
        matches!(
            self,
            MediaError::Relay(RtppError::BackendUnavailable { .. })
                | MediaError::Relay(RtppError::Socket(_))
        )
    }
}

/// Relay session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    OfferCreated,
    AnswerCreated,
    Active,
    Deleted,
}

/// One steered stream: the relay ports handed out at offer and answer time.
#[derive(Debug, Clone, Copy, Default)]
struct StreamPorts {
    offer: Option<u16>,
    answer: Option<u16>,
}

struct MediaSession {
    from_tag: SmolStr,
    to_tag: Option<SmolStr>,
    state: MediaState,
    audio: StreamPorts,
    video: Option<StreamPorts>,
    /// Caller media address: signalling source IP + SDP-declared port.
    a_peer: Option<SocketAddr>,
    /// Callee media address, learned the same way from the answer.
    b_peer: Option<SocketAddr>,
}

impl MediaSession {
    fn new(from_tag: SmolStr) -> Self {
        Self {
            from_tag,
            to_tag: None,
            state: MediaState::OfferCreated,
            audio: StreamPorts::default(),
            video: None,
            a_peer: None,
            b_peer: None,
        }
    }
}

/// SDP steered at the relay plus the ports it now advertises.
#[derive(Debug, Clone)]
pub struct SteeredSdp {
    pub sdp: SessionDescription,
    pub audio_port: u16,
    pub video_port: Option<u16>,
}

impl SteeredSdp {
    pub fn body(&self) -> String {
        self.sdp.to_body()
    }
}

/// Owns every relay session, keyed by Call-ID.
#[derive(Clone)]
pub struct MediaSessionManager {
    client: RtppClient,
    advertised_host: SmolStr,
    sessions: Arc<DashMap<SmolStr, Arc<Mutex<MediaSession>>>>,
}

impl MediaSessionManager {
    pub fn new(client: RtppClient, advertised_host: &str) -> Self {
        Self {
            client,
            advertised_host: SmolStr::new(advertised_host),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Current state for a Call-ID, if a session exists.
    pub fn state_of(&self, call_id: &str) -> Option<MediaState> {
        let session = self.sessions.get(call_id)?.clone();
        session.try_lock().ok().map(|guard| guard.state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Learned peer media addresses (A-leg, B-leg) for a session.
    pub fn peer_addrs(&self, call_id: &str) -> Option<(Option<SocketAddr>, Option<SocketAddr>)> {
        let session = self.sessions.get(call_id)?.clone();
        session
            .try_lock()
            .ok()
            .map(|guard| (guard.a_peer, guard.b_peer))
    }

    /// Offer stage: allocates relay ports for the caller's SDP (first
    /// INVITE) or re-points the existing session (re-INVITE), returning the
    /// SDP to forward to the callee.
    pub async fn offer(
        &self,
        call_id: &str,
        from_tag: &str,
        sdp: &SessionDescription,
        source_ip: IpAddr,
    ) -> Result<SteeredSdp, MediaError> {
        let audio = sdp.media_of(MediaKind::Audio).ok_or(MediaError::NoAudio)?;
        let a_peer = SocketAddr::new(source_ip, audio.port);

        let session = self
            .sessions
            .entry(SmolStr::new(call_id))
            .or_insert_with(|| Arc::new(Mutex::new(MediaSession::new(SmolStr::new(from_tag)))))
            .clone();
        let mut guard = session.lock().await;
        if guard.state == MediaState::Deleted {
            return Err(MediaError::NoSession(SmolStr::new(call_id)));
        }

        let audio_port = match guard.audio.offer {
            Some(port) => {
                // Renegotiation reuses the session: one update with the
                // refreshed peer address, no new allocation.
                if let Some(to_tag) = guard.to_tag.clone() {
                    self.client
                        .update(call_id, &guard.from_tag.clone(), &to_tag, a_peer)
                        .await?;
                }
                debug!(call_id, port, "re-offer reuses relay session");
                port
            }
            None => {
                let port = self.client.offer(call_id, from_tag).await?;
                info!(call_id, port, "relay offer allocated");
                guard.audio.offer = Some(port);
                port
            }
        };
        guard.a_peer = Some(a_peer);

        let mut steered = sdp
            .with_connection_address(&self.advertised_host)
            .with_media_port(MediaKind::Audio, audio_port);

        let mut video_port = None;
        if sdp.media_of(MediaKind::Video).is_some() {
            let stream_id = video_stream_id(call_id);
            let port = match guard.video.map(|v| v.offer) {
                Some(Some(port)) => port,
                _ => {
                    // The stream count grew: allocate the video relay now.
                    let port = self.client.offer(&stream_id, from_tag).await?;
                    info!(call_id, port, "relay video offer allocated");
                    let mut ports = guard.video.unwrap_or_default();
                    ports.offer = Some(port);
                    guard.video = Some(ports);
                    port
                }
            };
            steered = steered.with_media_port(MediaKind::Video, port);
            video_port = Some(port);
        }

        Ok(SteeredSdp {
            sdp: steered,
            audio_port,
            video_port,
        })
    }

    /// Answer stage: completes the relay session with the callee's tag and
    /// SDP, returning the SDP to forward back to the caller. Transitions
    /// the session to Active.
    pub async fn answer(
        &self,
        call_id: &str,
        to_tag: &str,
        sdp: &SessionDescription,
        source_ip: IpAddr,
    ) -> Result<SteeredSdp, MediaError> {
        let audio = sdp.media_of(MediaKind::Audio).ok_or(MediaError::NoAudio)?;
        let b_peer = SocketAddr::new(source_ip, audio.port);

        let session = self
            .sessions
            .get(call_id)
            .ok_or_else(|| MediaError::NoSession(SmolStr::new(call_id)))?
            .clone();
        let mut guard = session.lock().await;
        if guard.state == MediaState::Deleted {
            return Err(MediaError::NoSession(SmolStr::new(call_id)));
        }
        let from_tag = guard.from_tag.clone();

        let audio_port = match guard.audio.answer {
            Some(port) => {
                self.client
                    .update(call_id, &from_tag, to_tag, b_peer)
                    .await?;
                debug!(call_id, port, "re-answer reuses relay session");
                port
            }
            None => {
                let port = self.client.answer(call_id, &from_tag, to_tag).await?;
                info!(call_id, port, "relay answer allocated");
                guard.audio.answer = Some(port);
                port
            }
        };
        guard.to_tag = Some(SmolStr::new(to_tag));
        guard.b_peer = Some(b_peer);

        let mut steered = sdp
            .with_connection_address(&self.advertised_host)
            .with_media_port(MediaKind::Audio, audio_port);

        let mut video_port = None;
        if sdp.media_of(MediaKind::Video).is_some() {
            if let Some(mut ports) = guard.video {
                let stream_id = video_stream_id(call_id);
                let port = match ports.answer {
                    Some(port) => port,
                    None => {
                        let port = self.client.answer(&stream_id, &from_tag, to_tag).await?;
                        ports.answer = Some(port);
                        guard.video = Some(ports);
                        port
                    }
                };
                steered = steered.with_media_port(MediaKind::Video, port);
                video_port = Some(port);
            }
        }

        if guard.state == MediaState::OfferCreated {
            guard.state = MediaState::AnswerCreated;
        }

        Ok(SteeredSdp {
            sdp: steered,
            audio_port,
            video_port,
        })
    }

    /// Marks the session Active once the dialog confirms (ACK seen). The
    /// answer must have completed first; anything else is a no-op.
    pub async fn activate(&self, call_id: &str) {
        if let Some(session) = self.sessions.get(call_id).map(|s| s.clone()) {
            let mut guard = session.lock().await;
            if guard.state == MediaState::AnswerCreated {
                guard.state = MediaState::Active;
            }
        }
    }

    /// Tears down the relay session. Idempotent and best-effort: a failed
    /// or timed-out delete is logged and the local state is purged anyway,
    /// so dialog termination is never blocked on the relay.
    pub async fn release(&self, call_id: &str) {
        let session = match self.sessions.remove(call_id) {
            Some((_, session)) => session,
            None => return,
        };
        let mut guard = session.lock().await;
        if guard.state == MediaState::Deleted {
            return;
        }
        guard.state = MediaState::Deleted;

        let from_tag = guard.from_tag.clone();
        let to_tag = guard.to_tag.clone().unwrap_or_else(|| SmolStr::new(""));
        if let Err(e) = self.client.delete(call_id, &from_tag, &to_tag).await {
            warn!(call_id, %e, "relay delete failed; continuing teardown");
        }
        if guard.video.is_some() {
            let stream_id = video_stream_id(call_id);
            if let Err(e) = self.client.delete(&stream_id, &from_tag, &to_tag).await {
                warn!(call_id, %e, "relay video delete failed; continuing teardown");
            }
        }
        info!(call_id, "media session released");
    }
}

fn video_stream_id(call_id: &str) -> String {
    format!("{}{}", call_id, VIDEO_STREAM_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_rtpp::ControlAddress;
    use std::net::SocketAddr as StdSocketAddr;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const OFFER_AUDIO: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.10\r\n\
s=call\r\n\
c=IN IP4 10.0.0.10\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

    const OFFER_AV: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.10\r\n\
s=call\r\n\
c=IN IP4 10.0.0.10\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0\r\n\
m=video 40002 RTP/AVP 96\r\n";

    /// Fake rtpproxy allocating sequential ports; `D` replies `0`.
    async fn fake_relay() -> StdSocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let next_port = AtomicU16::new(35000);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let line = String::from_utf8_lossy(&buf[..n]).trim().to_owned();
                let cookie = line[1..].split_whitespace().next().unwrap_or("").to_owned();
                let result = match line.chars().next() {
                    Some('V') => next_port.fetch_add(2, Ordering::SeqCst).to_string(),
                    Some('U') => "35000".to_owned(),
                    Some('D') => "0".to_owned(),
                    _ => "E1".to_owned(),
                };
                let reply = format!("{} {}\n", cookie, result);
                let _ = socket.send_to(reply.as_bytes(), peer).await;
            }
        });
        addr
    }

    async fn manager() -> MediaSessionManager {
        let relay = fake_relay().await;
        let client = RtppClient::connect_with_policy(
            &ControlAddress::Udp(relay),
            Duration::from_millis(200),
            2,
        )
        .await
        .unwrap();
        MediaSessionManager::new(client, "198.51.100.1")
    }

    fn source() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[tokio::test]
    async fn offer_steers_sdp_at_the_relay() {
        let manager = manager().await;
        let sdp = SessionDescription::parse(OFFER_AUDIO).unwrap();
        let steered = manager.offer("call-1", "ft", &sdp, source()).await.unwrap();

        assert_eq!(steered.audio_port, 35000);
        let body = steered.body();
        assert!(body.contains("c=IN IP4 198.51.100.1"));
        assert!(body.contains("m=audio 35000 RTP/AVP 0"));
        // Untouched attribute survives byte-for-byte.
        assert!(body.contains("a=rtpmap:0 PCMU/8000"));
        assert_eq!(manager.state_of("call-1"), Some(MediaState::OfferCreated));
        // Peer address rule: signalling source IP + SDP-declared port.
        let (a_peer, b_peer) = manager.peer_addrs("call-1").unwrap();
        assert_eq!(a_peer, Some("203.0.113.7:40000".parse().unwrap()));
        assert_eq!(b_peer, None);
    }

    #[tokio::test]
    async fn answer_activates_the_session() {
        let manager = manager().await;
        let offer = SessionDescription::parse(OFFER_AUDIO).unwrap();
        manager.offer("call-1", "ft", &offer, source()).await.unwrap();

        let answer = SessionDescription::parse(
            "v=0\r\nc=IN IP4 10.0.0.11\r\nm=audio 50000 RTP/AVP 0\r\n",
        )
        .unwrap();
        let steered = manager
            .answer("call-1", "tt", &answer, "10.0.0.11".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(steered.audio_port, 35002);
        assert!(steered.body().contains("m=audio 35002"));
        assert_eq!(manager.state_of("call-1"), Some(MediaState::AnswerCreated));

        manager.activate("call-1").await;
        assert_eq!(manager.state_of("call-1"), Some(MediaState::Active));
        // Activation without a completed answer is a no-op.
        manager.activate("call-1").await;
        assert_eq!(manager.state_of("call-1"), Some(MediaState::Active));
    }

    #[tokio::test]
    async fn video_offer_allocates_parallel_stream() {
        let manager = manager().await;
        let sdp = SessionDescription::parse(OFFER_AV).unwrap();
        let steered = manager.offer("call-av", "ft", &sdp, source()).await.unwrap();
        assert_eq!(steered.audio_port, 35000);
        assert_eq!(steered.video_port, Some(35002));
        let body = steered.body();
        assert!(body.contains("m=audio 35000"));
        assert!(body.contains("m=video 35002"));
    }

    #[tokio::test]
    async fn reoffer_reuses_allocated_ports() {
        let manager = manager().await;
        let sdp = SessionDescription::parse(OFFER_AUDIO).unwrap();
        let first = manager.offer("call-1", "ft", &sdp, source()).await.unwrap();
        let answer = SessionDescription::parse(
            "v=0\r\nc=IN IP4 10.0.0.11\r\nm=audio 50000 RTP/AVP 0\r\n",
        )
        .unwrap();
        manager
            .answer("call-1", "tt", &answer, "10.0.0.11".parse().unwrap())
            .await
            .unwrap();

        // Renegotiation: same ports come back, no fresh allocation.
        let second = manager.offer("call-1", "ft", &sdp, source()).await.unwrap();
        assert_eq!(second.audio_port, first.audio_port);
        assert_eq!(manager.state_of("call-1"), Some(MediaState::AnswerCreated));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = manager().await;
        let sdp = SessionDescription::parse(OFFER_AUDIO).unwrap();
        manager.offer("call-1", "ft", &sdp, source()).await.unwrap();
        assert_eq!(manager.session_count(), 1);

        manager.release("call-1").await;
        assert_eq!(manager.session_count(), 0);
        // Second release is a no-op.
        manager.release("call-1").await;

        // A deleted session cannot be revived by an answer.
        let answer = SessionDescription::parse(
            "v=0\r\nc=IN IP4 10.0.0.11\r\nm=audio 50000 RTP/AVP 0\r\n",
        )
        .unwrap();
        assert!(matches!(
            manager
                .answer("call-1", "tt", &answer, "10.0.0.11".parse().unwrap())
                .await,
            Err(MediaError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn offer_without_audio_is_rejected() {
        let manager = manager().await;
        let sdp = SessionDescription::parse("v=0\r\nm=video 40002 RTP/AVP 96\r\n").unwrap();
        assert!(matches!(
            manager.offer("call-1", "ft", &sdp, source()).await,
            Err(MediaError::NoAudio)
        ));
    }

    #[tokio::test]
    async fn unreachable_relay_reports_backend_unavailable() {
        // Point at a socket nobody answers on.
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);
        let client = RtppClient::connect_with_policy(
            &ControlAddress::Udp(addr),
            Duration::from_millis(30),
            2,
        )
        .await
        .unwrap();
        let manager = MediaSessionManager::new(client, "198.51.100.1");
        let sdp = SessionDescription::parse(OFFER_AUDIO).unwrap();
        let err = manager
            .offer("call-1", "ft", &sdp, source())
            .await
            .unwrap_err();
        assert!(err.backend_unavailable());
    }
}
