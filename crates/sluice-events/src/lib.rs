// sluice-rs - The Sluice SIP B2BUA
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Publish-and-forget lifecycle events for out-of-core consumers (CDR
//! writer, console, packet capture).
//!
//! Built on a tokio broadcast channel: publishing never blocks, and a slow
//! subscriber drops events rather than back-pressuring the call engine.
//! Per publisher, events for one Call-ID are published in order.

use std::time::{SystemTime, UNIX_EPOCH};

use smol_str::SmolStr;
use tokio::sync::broadcast;
use tracing::trace;

/// Event kinds visible to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RegisterOk,
    RegisterFail,
    CallStart,
    CallRing,
    CallAnswer,
    CallEnd,
    MediaAlloc,
    MediaFail,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RegisterOk => "REGISTER_OK",
            EventKind::RegisterFail => "REGISTER_FAIL",
            EventKind::CallStart => "CALL_START",
            EventKind::CallRing => "CALL_RING",
            EventKind::CallAnswer => "CALL_ANSWER",
            EventKind::CallEnd => "CALL_END",
            EventKind::MediaAlloc => "MEDIA_ALLOC",
            EventKind::MediaFail => "MEDIA_FAIL",
        }
    }
}

/// A tagged lifecycle record.
#[derive(Debug, Clone)]
pub struct Event {
    pub call_id: SmolStr,
    pub timestamp_unix_ms: u64,
    pub kind: EventKind,
    /// Role-specific fields, e.g. `("reason", "MEDIA_UNAVAILABLE")`.
    pub attrs: Vec<(SmolStr, SmolStr)>,
}

impl Event {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Broadcast bus handle; clone freely.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a consumer. Consumers that lag past the channel capacity
    /// miss events (`RecvError::Lagged`) and simply continue.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event; a bus without subscribers swallows it.
    pub fn publish(&self, call_id: &str, kind: EventKind, attrs: Vec<(SmolStr, SmolStr)>) {
        let event = Event {
            call_id: SmolStr::new(call_id),
            timestamp_unix_ms: unix_millis(),
            kind,
            attrs,
        };
        trace!(call_id = %event.call_id, kind = kind.as_str(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
