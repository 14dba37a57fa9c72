//! Application runners
//!
//! A [`Runner`] starts the app a session is streaming, keeps applying
//! device hotplug events from the session's plug queue into its namespace,
//! and stops cooperatively: cancellation asks for a graceful exit and
//! escalates to a kill after [`STOP_GRACE`].

pub mod command;
pub mod container;

pub use command::CommandRunner;
pub use container::ContainerRunner;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::input::{PlugEvent, PlugQueue};
use crate::session::{SessionRegistry, StreamSession};

/// Grace period between a cooperative stop request and a forced kill.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Guest-side mount point of the session state folder.
pub const GUEST_STATE_DIR: &str = "/home/player";

/// Everything a runner variant receives for one session.
pub struct RunContext {
    pub session_id: u64,
    pub app_state_folder: PathBuf,
    pub plug_queue: Arc<PlugQueue>,
    pub input_devices: Vec<PathBuf>,
    pub mounts: Vec<(PathBuf, PathBuf)>,
    pub env: HashMap<String, String>,
    pub render_node: PathBuf,
    pub run_uid: u32,
    pub run_gid: u32,
}

impl RunContext {
    pub fn from_session(session: &StreamSession) -> Self {
        let mut env = session.env.clone();
        if let Some(display) = session.wayland_display() {
            env.insert("WAYLAND_DISPLAY".into(), display.to_owned());
        }
        Self {
            session_id: session.session_id,
            app_state_folder: session.app_state_folder.clone(),
            plug_queue: session.plug_queue.clone(),
            input_devices: session.input_device_nodes(),
            mounts: vec![(
                session.app_state_folder.clone(),
                PathBuf::from(GUEST_STATE_DIR),
            )],
            env,
            render_node: session.app.render_node.clone(),
            run_uid: session.run_uid,
            run_gid: session.run_gid,
        }
    }
}

#[async_trait]
pub trait Execute {
    /// Run the app to completion. Returns `Ok` on a clean exit or a
    /// cooperative stop, an error when the app could not start or died.
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<()>;
}

/// How a configured app is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Runner {
    Command(CommandRunner),
    Container(ContainerRunner),
}

impl Runner {
    pub async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
        match self {
            Runner::Command(runner) => runner.run(ctx, cancel).await,
            Runner::Container(runner) => runner.run(ctx, cancel).await,
        }
    }
}

/// Bridge from the blocking plug queue into an async channel. The pump
/// thread exits once `cancel` fires or the receiver is dropped.
pub(crate) fn spawn_plug_pump(
    queue: Arc<PlugQueue>,
    cancel: CancellationToken,
) -> mpsc::Receiver<PlugEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            if let Some(event) = queue.pop_with_timeout(Duration::from_millis(250)) {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
        }
    });
    rx
}

enum Supervise {
    Start(Arc<StreamSession>),
    Stop(u64),
}

/// Starts a runner per session and cancels it on the session's stop.
pub struct RunnerService {
    cancels: Arc<DashMap<u64, CancellationToken>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RunnerService {
    pub fn spawn(bus: &EventBus, registry: Arc<SessionRegistry>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            cancels: Arc::new(DashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let on_start = {
            let tx = tx.clone();
            bus.subscribe(EventKind::StreamSession, move |event| {
                if let Event::StreamSession(session) = event {
                    let _ = tx.send(Supervise::Start(session.clone()));
                }
            })
        };
        let on_stop = {
            let tx = tx.clone();
            bus.subscribe(EventKind::StopStream, move |event| {
                if let Event::StopStream(stop) = event {
                    let _ = tx.send(Supervise::Stop(stop.session_id));
                }
            })
        };
        service.subscriptions.lock().extend([on_start, on_stop]);

        let cancels = service.cancels.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Supervise::Start(session) => {
                        let token = CancellationToken::new();
                        cancels.insert(session.session_id, token.clone());
                        let cancels = cancels.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            let session_id = session.session_id;
                            let ctx = RunContext::from_session(&session);
                            match session.app.runner.run(&ctx, &token).await {
                                Ok(()) => info!(session_id, "application finished"),
                                Err(e) => error!(session_id, error = %e, "runner failed"),
                            }
                            cancels.remove(&session_id);
                            // Normal exit, crash and start failure all end
                            // the session; a no-op if stop arrived first.
                            registry.stop(session_id);
                        });
                    }
                    Supervise::Stop(session_id) => {
                        if let Some((_, token)) = cancels.remove(&session_id) {
                            warn!(session_id, "cancelling runner");
                            token.cancel();
                        }
                    }
                }
            }
        });

        service
    }
}
