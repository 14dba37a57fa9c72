//! Session registry: lifecycle owner for every [`StreamSession`]
//!
//! Launch resolves the paired client and the app, allocates the id, the
//! audio encryption material and a pair of UDP ports, then announces the
//! session on the bus. Stop is terminal: the registry drops its entry
//! before the stop event reaches anyone else, so no event for that id can
//! be delivered past it.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use openssl::x509::X509;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::crypto;
use crate::error::{Result, ServerError};
use crate::events::{Event, EventBus, EventKind, StopStream, Subscription};
use crate::input::PlugQueue;

use super::{AudioCrypto, DisplayMode, StreamSession};

/// Pool of UDP ports for video/audio streams.
pub struct PortPool {
    free: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortPool {
    pub fn new(range: std::ops::Range<u16>) -> Self {
        Self {
            free: Arc::new(Mutex::new(range.collect())),
        }
    }

    /// Take one video and one audio port. Ports that no longer bind are
    /// skipped but kept for later retry.
    fn allocate_pair(&self) -> Result<PortLease> {
        let mut free = self.free.lock();
        let candidates: Vec<u16> = free.iter().copied().collect();
        let mut picked = Vec::with_capacity(2);
        for port in candidates {
            if picked.len() == 2 {
                break;
            }
            if probe_udp(port) {
                free.remove(&port);
                picked.push(port);
            }
        }
        if picked.len() < 2 {
            for port in picked {
                free.insert(port);
            }
            return Err(ServerError::ResourceExhausted {
                resource: "udp stream ports".into(),
            });
        }
        Ok(PortLease {
            pool: self.free.clone(),
            video: picked[0],
            audio: picked[1],
        })
    }
}

/// Two ports held for the lifetime of a session; returned to the pool
/// when the session is fully dropped.
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<Mutex<BTreeSet<u16>>>,
    pub video: u16,
    pub audio: u16,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut free = self.pool.lock();
        free.insert(self.video);
        free.insert(self.audio);
    }
}

fn probe_udp(port: u16) -> bool {
    let Ok(socket) = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) else {
        return false;
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into()).is_ok()
}

/// Everything `/launch` learned from the wire.
pub struct LaunchRequest {
    pub app_id: String,
    pub client_cert: X509,
    pub client_ip: IpAddr,
    pub display_mode: DisplayMode,
    pub audio_channel_count: u8,
    /// Audio encryption key from the `rikey` parameter; generated fresh
    /// when the client does not provide one.
    pub aes_key: Option<[u8; 16]>,
    pub aes_iv: Option<[u8; 16]>,
}

pub struct SessionRegistry {
    bus: Arc<EventBus>,
    store: Arc<ConfigStore>,
    sessions: Arc<DashMap<u64, Arc<StreamSession>>>,
    next_id: AtomicU64,
    ports: PortPool,
    _stop_sub: Subscription,
}

impl SessionRegistry {
    /// Must be constructed before any other bus subscriber so the entry
    /// drop runs first when a stop event is dispatched.
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<ConfigStore>,
        port_range: std::ops::Range<u16>,
    ) -> Arc<Self> {
        let sessions: Arc<DashMap<u64, Arc<StreamSession>>> = Arc::new(DashMap::new());
        let stop_sub = {
            let sessions = sessions.clone();
            bus.subscribe(EventKind::StopStream, move |event| {
                if let Event::StopStream(stop) = event {
                    if sessions.remove(&stop.session_id).is_some() {
                        debug!(session_id = stop.session_id, "registry entry dropped");
                    }
                }
            })
        };
        Arc::new(Self {
            bus,
            store,
            sessions,
            next_id: AtomicU64::new(1),
            ports: PortPool::new(port_range),
            _stop_sub: stop_sub,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Create a session for a paired client and announce it on the bus.
    pub fn launch(&self, request: LaunchRequest) -> Result<Arc<StreamSession>> {
        let client = self
            .store
            .get_client_via_ssl(&request.client_cert)
            .ok_or_else(|| ServerError::Unauthorized("certificate is not paired".into()))?;
        let app = self.store.get_app_by_id(&request.app_id)?;

        let session_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let aes_key = match request.aes_key {
            Some(key) => key,
            None => crypto::random_bytes()?,
        };
        let aes_iv = match request.aes_iv {
            Some(iv) => iv,
            None => crypto::random_bytes()?,
        };
        let lease = self.ports.allocate_pair()?;

        let app_state_folder = client.app_state_folder.clone();
        std::fs::create_dir_all(&app_state_folder)?;

        let mut env: std::collections::HashMap<String, String> = app.env.clone();
        env.insert("HOME".into(), app_state_folder.display().to_string());
        env.insert(
            "XDG_RUNTIME_DIR".into(),
            app_state_folder.display().to_string(),
        );

        let session = Arc::new(StreamSession {
            session_id,
            client_ip: request.client_ip,
            display_mode: request.display_mode,
            audio_channel_count: request.audio_channel_count,
            audio_crypto: Mutex::new(AudioCrypto {
                key: aes_key,
                iv: aes_iv,
            }),
            video_port: lease.video,
            audio_port: lease.audio,
            app,
            app_state_folder,
            run_uid: client.run_uid,
            run_gid: client.run_gid,
            env,
            plug_queue: Arc::new(PlugQueue::default()),
            wayland_display: once_cell::sync::OnceCell::new(),
            joypads: DashMap::new(),
            mouse: once_cell::sync::OnceCell::new(),
            keyboard: once_cell::sync::OnceCell::new(),
            pen: once_cell::sync::OnceCell::new(),
            touch: once_cell::sync::OnceCell::new(),
            bus: self.bus.clone(),
            _ports: lease,
        });

        self.sessions.insert(session_id, session.clone());
        info!(
            session_id,
            client_ip = %request.client_ip,
            app = %session.app.title,
            video_port = session.video_port,
            audio_port = session.audio_port,
            "session launched"
        );
        self.bus.publish(Event::StreamSession(session.clone()));
        Ok(session)
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<StreamSession>> {
        self.sessions.get(&session_id).map(|s| s.value().clone())
    }

    /// Active session for a client address, used by RTSP and the HTTPS
    /// resume/cancel endpoints to find their session.
    pub fn session_for_ip(&self, ip: IpAddr) -> Option<Arc<StreamSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.client_ip == ip)
            .map(|entry| entry.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Publish a session-scoped event only while the session is alive;
    /// anything after the terminal stop is silently dropped.
    pub fn publish_for(&self, event: Event) {
        match event.session_id() {
            Some(id) if self.sessions.contains_key(&id) => self.bus.publish(event),
            Some(id) => debug!(session_id = id, ?event, "event after stop, dropped"),
            None => self.bus.publish(event),
        }
    }

    /// Terminal stop: the registry entry is removed before the event is
    /// dispatched, so no later event for this id can be delivered.
    pub fn stop(&self, session_id: u64) {
        if self.sessions.remove(&session_id).is_some() {
            info!(session_id, "session stopping");
            self.bus.publish(Event::StopStream(StopStream { session_id }));
        } else {
            debug!(session_id, "stop for unknown session ignored");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), "stopping all sessions");
        }
        for id in ids {
            self.stop(id);
        }
    }
}
