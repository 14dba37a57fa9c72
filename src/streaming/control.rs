//! Control sub-session
//!
//! Tracks per-session control state for the lifetime of a stream and
//! translates client control actions (stream recovery, pause, quit) into
//! session-gated events. The wire transport for control messages lives
//! outside this crate; this is the policy layer it calls into.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::events::{
    Event, EventBus, EventKind, IdrRequest, PauseStream, PingChannel, RtpPing, Subscription,
};
use crate::session::SessionRegistry;

#[derive(Debug, Default)]
struct ControlPeer {
    video_ping: Option<Instant>,
    audio_ping: Option<Instant>,
}

pub struct ControlService {
    registry: Arc<SessionRegistry>,
    peers: DashMap<u64, ControlPeer>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ControlService {
    pub fn spawn(bus: &EventBus, registry: Arc<SessionRegistry>) -> Arc<Self> {
        let service = Arc::new(Self {
            registry,
            peers: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        let on_start = {
            let service = service.clone();
            bus.subscribe(EventKind::StreamSession, move |event| {
                if let Event::StreamSession(session) = event {
                    service.peers.insert(session.session_id, ControlPeer::default());
                }
            })
        };
        let on_ping = {
            let service = service.clone();
            bus.subscribe(EventKind::RtpPing, move |event| {
                if let Event::RtpPing(ping) = event {
                    service.on_ping(*ping);
                }
            })
        };
        let on_stop = {
            let service = service.clone();
            bus.subscribe(EventKind::StopStream, move |event| {
                if let Event::StopStream(stop) = event {
                    if service.peers.remove(&stop.session_id).is_some() {
                        info!(session_id = stop.session_id, "control channel closed");
                    }
                }
            })
        };
        service
            .subscriptions
            .lock()
            .extend([on_start, on_ping, on_stop]);
        service
    }

    fn on_ping(&self, ping: RtpPing) {
        let Some(mut peer) = self.peers.get_mut(&ping.session_id) else {
            return;
        };
        let slot = match ping.channel {
            PingChannel::Video => &mut peer.video_ping,
            PingChannel::Audio => &mut peer.audio_ping,
        };
        if slot.is_none() {
            debug!(session_id = ping.session_id, channel = ?ping.channel, "first media ping");
        }
        *slot = Some(Instant::now());
    }

    /// Client asked for stream recovery.
    pub fn request_idr(&self, session_id: u64) {
        self.registry
            .publish_for(Event::IdrRequest(IdrRequest { session_id }));
    }

    /// Client went away without quitting the app.
    pub fn pause(&self, session_id: u64) {
        self.registry
            .publish_for(Event::PauseStream(PauseStream { session_id }));
    }

    /// Client quit the app.
    pub fn stop(&self, session_id: u64) {
        self.registry.stop(session_id);
    }

    /// Whether media traffic has been seen on both stream ports.
    pub fn media_established(&self, session_id: u64) -> bool {
        self.peers
            .get(&session_id)
            .map(|p| p.video_ping.is_some() && p.audio_ping.is_some())
            .unwrap_or(false)
    }
}
