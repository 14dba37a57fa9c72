//! Child-process runner
//!
//! Runs the app through `/bin/sh -c` with the session environment, its
//! stdio redirected into the session state folder. Hotplug events are
//! applied by re-owning the device node for the session user; the nodes
//! are already visible in a shared namespace.

use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};
use crate::input::{PlugAction, PlugEvent};

use super::{spawn_plug_pump, Execute, RunContext, STOP_GRACE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRunner {
    pub command: String,
}

#[async_trait]
impl Execute for CommandRunner {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let stdout = std::fs::File::create(ctx.app_state_folder.join("app.out"))?;
        let stderr = std::fs::File::create(ctx.app_state_folder.join("app.err"))?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env_clear()
            .envs(&ctx.env)
            .current_dir(&ctx.app_state_folder)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RunnerError::StartFailed {
            what: "command",
            reason: e.to_string(),
        })?;
        let pid = child.id().map(|raw| Pid::from_raw(raw as i32));
        info!(
            session_id = ctx.session_id,
            pid = child.id(),
            command = %self.command,
            "application started"
        );

        let pump_cancel = cancel.child_token();
        let mut plugs = spawn_plug_pump(ctx.plug_queue.clone(), pump_cancel.clone());

        // Cooperative stop: SIGTERM on cancellation, SIGKILL once the
        // grace period runs out. Signals go through the raw pid so the
        // wait branch keeps exclusive use of the child handle.
        let mut stopping = false;
        let mut kill_at: Option<Instant> = None;
        let far_future = Instant::now() + STOP_GRACE * 1000;

        let result = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    break if stopping || status.success() {
                        info!(session_id = ctx.session_id, "application stopped");
                        Ok(())
                    } else {
                        Err(RunnerError::UnexpectedExit {
                            status: i64::from(status.code().unwrap_or(-1)),
                        }
                        .into())
                    };
                }
                _ = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    kill_at = Some(Instant::now() + STOP_GRACE);
                    if let Some(pid) = pid {
                        let _ = kill(pid, Signal::SIGTERM);
                    }
                }
                _ = tokio::time::sleep_until(kill_at.unwrap_or(far_future)), if kill_at.is_some() => {
                    warn!(session_id = ctx.session_id, "grace period expired, killing application");
                    kill_at = None;
                    if let Some(pid) = pid {
                        let _ = kill(pid, Signal::SIGKILL);
                    }
                }
                Some(event) = plugs.recv() => {
                    if let Err(e) = apply_in_namespace(ctx, &event) {
                        warn!(session_id = ctx.session_id, error = %e, "hotplug apply failed");
                    }
                }
            }
        };
        pump_cancel.cancel();
        result
    }
}

fn apply_in_namespace(ctx: &RunContext, event: &PlugEvent) -> Result<()> {
    match event.action {
        PlugAction::Add => {
            chown(
                event.device.node.as_path(),
                Some(Uid::from_raw(ctx.run_uid)),
                Some(Gid::from_raw(ctx.run_gid)),
            )
            .map_err(|e| {
                RunnerError::DeviceAttach(format!("chown {}: {e}", event.device.node.display()))
            })?;
            debug!(
                session_id = ctx.session_id,
                node = %event.device.node.display(),
                "device handed to session user"
            );
        }
        PlugAction::Remove => {
            debug!(
                session_id = ctx.session_id,
                node = %event.device.node.display(),
                "device removed"
            );
        }
    }
    Ok(())
}
