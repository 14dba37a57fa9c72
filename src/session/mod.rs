//! Runtime state of one active remote-play connection
//!
//! A [`StreamSession`] is created by the registry on launch, shared with
//! every subsystem through the event bus, and torn down when the terminal
//! stop event for its id fires. The session id is monotonically allocated
//! and never reused; the UDP port lease is returned to the pool only when
//! the last subsystem drops its reference.

mod registry;

pub use registry::{LaunchRequest, PortPool, SessionRegistry};

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::{App, JoypadType};
use crate::events::EventBus;
use crate::input::{DeviceKind, InputDeviceHandle, PlugQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

impl DisplayMode {
    /// Nominal duration of one frame at the negotiated refresh rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_rate.max(1)
    }
}

/// A joypad currently attached to a session.
#[derive(Debug, Clone)]
pub struct Joypad {
    pub controller_number: u8,
    pub joypad_type: JoypadType,
    pub device: InputDeviceHandle,
}

/// AES-128-GCM material protecting the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCrypto {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

pub struct StreamSession {
    pub session_id: u64,
    pub client_ip: IpAddr,
    pub display_mode: DisplayMode,
    pub audio_channel_count: u8,
    /// Replaced when the client resumes with a fresh key.
    audio_crypto: Mutex<AudioCrypto>,
    pub video_port: u16,
    pub audio_port: u16,
    pub app: Arc<App>,
    pub app_state_folder: PathBuf,
    pub run_uid: u32,
    pub run_gid: u32,
    /// Base environment handed to the runner.
    pub env: HashMap<String, String>,
    pub plug_queue: Arc<PlugQueue>,
    pub joypads: DashMap<u8, Joypad>,

    // Set once the virtual compositor is up; stable until session end.
    wayland_display: OnceCell<String>,

    mouse: OnceCell<InputDeviceHandle>,
    keyboard: OnceCell<InputDeviceHandle>,
    pen: OnceCell<InputDeviceHandle>,
    touch: OnceCell<InputDeviceHandle>,

    bus: Arc<EventBus>,
    // Freed when the last reference to the session drops.
    _ports: registry::PortLease,
}

impl StreamSession {
    /// The bus every subsystem of this session publishes on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn audio_crypto(&self) -> AudioCrypto {
        *self.audio_crypto.lock()
    }

    pub fn set_audio_crypto(&self, crypto: AudioCrypto) {
        *self.audio_crypto.lock() = crypto;
    }

    /// Wayland socket of the session's virtual compositor, if one is up.
    pub fn wayland_display(&self) -> Option<&str> {
        self.wayland_display.get().map(String::as_str)
    }

    /// Write-once install of the compositor socket; `false` when a first
    /// writer already won.
    pub fn set_wayland_display(&self, socket: impl Into<String>) -> bool {
        self.wayland_display.set(socket.into()).is_ok()
    }

    fn cell(&self, kind: DeviceKind) -> Option<&OnceCell<InputDeviceHandle>> {
        match kind {
            DeviceKind::Mouse => Some(&self.mouse),
            DeviceKind::Keyboard => Some(&self.keyboard),
            DeviceKind::Pen => Some(&self.pen),
            DeviceKind::Touch => Some(&self.touch),
            DeviceKind::Joypad => None,
        }
    }

    /// Currently installed device of `kind`, if any. Joypads live in
    /// [`StreamSession::joypads`].
    pub fn input_device(&self, kind: DeviceKind) -> Option<InputDeviceHandle> {
        self.cell(kind).and_then(|c| c.get().cloned())
    }

    /// Write-once install; on a lost race the already installed device is
    /// returned as the error value.
    pub fn install_input_device(
        &self,
        device: InputDeviceHandle,
    ) -> std::result::Result<(), InputDeviceHandle> {
        let Some(cell) = self.cell(device.kind) else {
            debug_assert!(false, "joypads go through the joypad map");
            return Ok(());
        };
        cell.set(device).map_err(|_| {
            cell.get()
                .cloned()
                .unwrap_or_else(|| unreachable!("cell is set"))
        })
    }

    /// Device nodes the runner exposes to the app at start.
    pub fn input_device_nodes(&self) -> Vec<PathBuf> {
        let mut nodes: Vec<PathBuf> = [&self.mouse, &self.keyboard, &self.pen, &self.touch]
            .into_iter()
            .filter_map(|c| c.get().map(|d| d.node.clone()))
            .collect();
        for pad in self.joypads.iter() {
            nodes.push(pad.device.node.clone());
        }
        nodes
    }

    pub fn frame_interval(&self) -> Duration {
        self.display_mode.frame_interval()
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_id", &self.session_id)
            .field("client_ip", &self.client_ip)
            .field("app", &self.app.id)
            .field("video_port", &self.video_port)
            .field("audio_port", &self.audio_port)
            .finish_non_exhaustive()
    }
}
