//! Virtual display for streaming sessions
//!
//! Apps flagged `start_virtual_compositor` get a headless compositor of
//! their own instead of scraping a real output. The compositor itself
//! (Wayland globals, GPU surfaces) sits behind [`VirtualDisplayFactory`];
//! this module owns the policy: create it at session start, install the
//! socket into the session's write-once cell so the runner exports
//! `WAYLAND_DISPLAY`, and tear it down with the session.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, ServerError};
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::session::{DisplayMode, StreamSession};

/// A running virtual compositor.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    /// Wayland socket name clients of the compositor connect to.
    pub wayland_socket: String,
    pub mode: DisplayMode,
}

/// Platform capability that creates and destroys virtual compositors.
pub trait VirtualDisplayFactory: Send + Sync {
    fn create(&self, session_id: u64, mode: DisplayMode) -> Result<DisplayHandle>;
    fn destroy(&self, display: &DisplayHandle) -> Result<()>;
}

/// Factory used when no compositor backend is wired in; such sessions
/// run against whatever display the app finds on its own.
pub struct DisabledDisplayFactory;

impl VirtualDisplayFactory for DisabledDisplayFactory {
    fn create(&self, _session_id: u64, _mode: DisplayMode) -> Result<DisplayHandle> {
        Err(ServerError::NotFound(
            "no virtual display backend".into(),
        ))
    }

    fn destroy(&self, _display: &DisplayHandle) -> Result<()> {
        Ok(())
    }
}

/// Owns virtual display lifecycle per session.
pub struct DisplayService {
    factory: Arc<dyn VirtualDisplayFactory>,
    created: DashMap<u64, DisplayHandle>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DisplayService {
    /// Register on the bus. Must be constructed before the runner service
    /// so the compositor socket is visible when the runner starts.
    pub fn spawn(bus: &EventBus, factory: Arc<dyn VirtualDisplayFactory>) -> Arc<Self> {
        let service = Arc::new(Self {
            factory,
            created: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        let on_start = {
            let service = service.clone();
            bus.subscribe(EventKind::StreamSession, move |event| {
                if let Event::StreamSession(session) = event {
                    service.on_session_start(session);
                }
            })
        };
        let on_stop = {
            let service = service.clone();
            bus.subscribe(EventKind::StopStream, move |event| {
                if let Event::StopStream(stop) = event {
                    service.on_session_stop(stop.session_id);
                }
            })
        };
        service.subscriptions.lock().extend([on_start, on_stop]);
        service
    }

    fn on_session_start(&self, session: &Arc<StreamSession>) {
        if !session.app.start_virtual_compositor {
            return;
        }
        match self.factory.create(session.session_id, session.display_mode) {
            Ok(handle) => {
                if !session.set_wayland_display(handle.wayland_socket.as_str()) {
                    // another installer won the write-once cell
                    let _ = self.factory.destroy(&handle);
                    return;
                }
                info!(
                    session_id = session.session_id,
                    socket = %handle.wayland_socket,
                    "virtual display up"
                );
                self.created.insert(session.session_id, handle);
            }
            Err(e) => {
                warn!(session_id = session.session_id, error = %e, "virtual display skipped");
            }
        }
    }

    fn on_session_stop(&self, session_id: u64) {
        if let Some((_, handle)) = self.created.remove(&session_id) {
            if let Err(e) = self.factory.destroy(&handle) {
                warn!(session_id, socket = %handle.wayland_socket, error = %e, "display teardown failed");
            } else {
                info!(session_id, "virtual display torn down");
            }
        }
    }
}
