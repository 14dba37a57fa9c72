//! Typed publish/subscribe bus coupling the host subsystems
//!
//! The event set is closed: every coupling between pairing, session
//! lifecycle, RTSP negotiation and the media services goes through one of
//! the variants below. Dispatch is synchronous on the publisher's thread,
//! in handler registration order, and a panicking handler never prevents
//! delivery to the handlers after it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::pairing::PairSignal;
use crate::session::StreamSession;
use crate::streaming::{AudioSessionParams, VideoSessionParams};

/// Request for an intra-coded frame on the next frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdrRequest {
    pub session_id: u64,
}

/// Stop media pipelines but keep devices and the runner alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseStream {
    pub session_id: u64,
}

/// Restart media pipelines with the last negotiated parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeStream {
    pub session_id: u64,
}

/// Terminal event for a session; no event for this id follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopStream {
    pub session_id: u64,
}

/// First traffic seen on one of the session's media ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPing {
    pub session_id: u64,
    pub channel: PingChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingChannel {
    Video,
    Audio,
}

/// The closed set of events carried by the bus.
///
/// Payloads are reference-counted and immutable; handlers may retain them
/// past the dispatch call.
#[derive(Clone)]
pub enum Event {
    PairSignal(Arc<PairSignal>),
    StreamSession(Arc<StreamSession>),
    VideoSession(Arc<VideoSessionParams>),
    AudioSession(Arc<AudioSessionParams>),
    IdrRequest(IdrRequest),
    PauseStream(PauseStream),
    ResumeStream(ResumeStream),
    StopStream(StopStream),
    RtpPing(RtpPing),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PairSignal(_) => EventKind::PairSignal,
            Event::StreamSession(_) => EventKind::StreamSession,
            Event::VideoSession(_) => EventKind::VideoSession,
            Event::AudioSession(_) => EventKind::AudioSession,
            Event::IdrRequest(_) => EventKind::IdrRequest,
            Event::PauseStream(_) => EventKind::PauseStream,
            Event::ResumeStream(_) => EventKind::ResumeStream,
            Event::StopStream(_) => EventKind::StopStream,
            Event::RtpPing(_) => EventKind::RtpPing,
        }
    }

    /// Session id carried by session-scoped events, if any.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            Event::PairSignal(_) => None,
            Event::StreamSession(s) => Some(s.session_id),
            Event::VideoSession(v) => Some(v.session_id),
            Event::AudioSession(a) => Some(a.session_id),
            Event::IdrRequest(e) => Some(e.session_id),
            Event::PauseStream(e) => Some(e.session_id),
            Event::ResumeStream(e) => Some(e.session_id),
            Event::StopStream(e) => Some(e.session_id),
            Event::RtpPing(e) => Some(e.session_id),
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.session_id() {
            Some(id) => write!(f, "{:?}(session {})", self.kind(), id),
            None => write!(f, "{:?}", self.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PairSignal,
    StreamSession,
    VideoSession,
    AudioSession,
    IdrRequest,
    PauseStream,
    ResumeStream,
    StopStream,
    RtpPing,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventKind, Vec<HandlerEntry>>,
    next_id: u64,
}

/// Synchronous typed event bus.
///
/// The registry lock is held for the whole of `publish`, which is what
/// makes unsubscription immediate: once a [`Subscription`] is dropped the
/// handler can no longer be mid-delivery. The corollary is that handlers
/// must not publish or (un)subscribe from inside a handler; they forward
/// work to channels instead.
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Deliver `event` to every handler registered for its kind, in
    /// registration order. A panicking handler is logged and skipped.
    pub fn publish(&self, event: Event) {
        let registry = self.registry.lock();
        let Some(entries) = registry.handlers.get(&event.kind()) else {
            trace!(?event, "no subscribers");
            return;
        };
        for entry in entries {
            let result = catch_unwind(AssertUnwindSafe(|| (entry.handler)(&event)));
            if result.is_err() {
                error!(?event, handler = entry.id, "event handler panicked");
            }
        }
    }

    /// Register `handler` for events of `kind`. The handler stays
    /// registered until the returned guard is dropped.
    #[must_use]
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.entry(kind).or_default().push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }
}

/// Guard for one handler registration; unregisters on drop.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock();
            if let Some(entries) = registry.handlers.get_mut(&self.kind) {
                entries.retain(|e| e.id != self.id);
            }
        }
    }
}
