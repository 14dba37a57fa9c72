//! Virtual input devices for streaming sessions
//!
//! The kernel-facing side (uinput, udev) sits behind
//! [`VirtualDeviceFactory`]; this module owns the policy: one device per
//! kind per session installed into the session's write-once cells,
//! joypads keyed by controller number, and every attachment mirrored into
//! the session's plug queue for the runner to apply in its namespace.

pub mod plug;

pub use plug::{PlugAction, PlugEvent, PlugQueue, DEFAULT_PLUG_QUEUE_CAPACITY};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::JoypadType;
use crate::error::{Result, ServerError};
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::session::{Joypad, StreamSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Mouse,
    Keyboard,
    Pen,
    Touch,
    Joypad,
}

/// A created virtual device: its node plus the udev metadata the guest
/// needs to make it appear identical in its own namespace.
#[derive(Debug, Clone)]
pub struct InputDeviceHandle {
    pub kind: DeviceKind,
    pub node: PathBuf,
    pub udev_env: HashMap<String, String>,
    pub hw_db_entries: Vec<String>,
}

/// Platform capability that creates and destroys virtual devices.
pub trait VirtualDeviceFactory: Send + Sync {
    fn create(&self, kind: DeviceKind, session_id: u64) -> Result<InputDeviceHandle>;
    fn destroy(&self, device: &InputDeviceHandle) -> Result<()>;
}

/// Factory used when no platform backend is wired in; sessions then run
/// without virtual input.
pub struct DisabledDeviceFactory;

impl VirtualDeviceFactory for DisabledDeviceFactory {
    fn create(&self, kind: DeviceKind, _session_id: u64) -> Result<InputDeviceHandle> {
        Err(ServerError::NotFound(format!(
            "no virtual input backend for {kind:?}"
        )))
    }

    fn destroy(&self, _device: &InputDeviceHandle) -> Result<()> {
        Ok(())
    }
}

/// Owns device lifecycle per session.
pub struct InputService {
    factory: Arc<dyn VirtualDeviceFactory>,
    created: DashMap<u64, Vec<InputDeviceHandle>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl InputService {
    /// Register on the bus. Must be constructed before the runner service
    /// so freshly created devices are visible when the runner starts.
    pub fn spawn(bus: &EventBus, factory: Arc<dyn VirtualDeviceFactory>) -> Arc<Self> {
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
        self.created.insert(session.session_id, Vec::new());
        // Mouse and keyboard are part of every session; pen, touch and
        // joypads appear on first use.
        for kind in [DeviceKind::Mouse, DeviceKind::Keyboard] {
            if let Err(e) = self.ensure_device(session, kind) {
                warn!(session_id = session.session_id, ?kind, error = %e, "device setup skipped");
            }
        }
    }

    fn on_session_stop(&self, session_id: u64) {
        if let Some((_, devices)) = self.created.remove(&session_id) {
            for device in devices {
                if let Err(e) = self.factory.destroy(&device) {
                    warn!(session_id, node = %device.node.display(), error = %e, "device teardown failed");
                }
            }
            info!(session_id, "input devices destroyed");
        }
    }

    /// Install a device of `kind` into the session on first use. The
    /// session cell is write-once: a concurrent first writer wins and the
    /// loser's device is destroyed again.
    pub fn ensure_device(
        &self,
        session: &StreamSession,
        kind: DeviceKind,
    ) -> Result<InputDeviceHandle> {
        if kind == DeviceKind::Joypad {
            return Err(ServerError::NotFound(
                "joypads attach by controller number".into(),
            ));
        }
        if let Some(existing) = session.input_device(kind) {
            return Ok(existing);
        }
        let device = self.factory.create(kind, session.session_id)?;
        match session.install_input_device(device.clone()) {
            Ok(()) => {
                debug!(session_id = session.session_id, ?kind, node = %device.node.display(), "device installed");
                self.record(session, &device);
                self.push_plug(session, PlugAction::Add, device.clone());
                Ok(device)
            }
            Err(raced) => {
                let _ = self.factory.destroy(&device);
                Ok(raced)
            }
        }
    }

    /// Attach a joypad for `controller_number`; replaces any previous pad
    /// on the same slot (last writer wins per key).
    pub fn add_joypad(
        &self,
        session: &StreamSession,
        controller_number: u8,
        joypad_type: JoypadType,
    ) -> Result<()> {
        let device = self.factory.create(DeviceKind::Joypad, session.session_id)?;
        self.record(session, &device);
        if let Some(previous) = session.joypads.insert(
            controller_number,
            Joypad {
                controller_number,
                joypad_type,
                device: device.clone(),
            },
        ) {
            let _ = self.factory.destroy(&previous.device);
        }
        self.push_plug(session, PlugAction::Add, device);
        info!(session_id = session.session_id, controller_number, "joypad attached");
        Ok(())
    }

    pub fn remove_joypad(&self, session: &StreamSession, controller_number: u8) {
        if let Some((_, pad)) = session.joypads.remove(&controller_number) {
            self.push_plug(session, PlugAction::Remove, pad.device.clone());
            let _ = self.factory.destroy(&pad.device);
            info!(session_id = session.session_id, controller_number, "joypad detached");
        }
    }

    fn record(&self, session: &StreamSession, device: &InputDeviceHandle) {
        self.created
            .entry(session.session_id)
            .or_default()
            .push(device.clone());
    }

    fn push_plug(&self, session: &StreamSession, action: PlugAction, device: InputDeviceHandle) {
        if let Err(e) = session.plug_queue.try_push(PlugEvent { action, device }) {
            warn!(session_id = session.session_id, error = %e, "plug event lost");
        }
    }
}
