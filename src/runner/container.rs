//! Container runner
//!
//! Starts the app as a Docker container with the session state folder and
//! device nodes mounted in, the render node attached, and the session
//! environment injected. Hotplug events are replayed inside the container
//! namespace with `mknod`, which is idempotent for a fixed major/minor.

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::models::{DeviceMapping, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};
use crate::input::{PlugAction, PlugEvent};

use super::{spawn_plug_pump, Execute, RunContext, GUEST_STATE_DIR, STOP_GRACE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRunner {
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Extra `KEY=value` entries on top of the session environment.
    #[serde(default)]
    pub env: Vec<String>,
    /// Extra `host:guest` bind mounts.
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Extra device nodes beyond the session's input devices.
    #[serde(default)]
    pub devices: Vec<String>,
}

#[async_trait]
impl Execute for ContainerRunner {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let docker = Docker::connect_with_local_defaults().map_err(RunnerError::Container)?;
        let name = format!(
            "{}_{}",
            self.name.as_deref().unwrap_or("moonhost"),
            ctx.session_id
        );

        let mut binds: Vec<String> = self.mounts.clone();
        for (host, guest) in &ctx.mounts {
            binds.push(format!("{}:{}", host.display(), guest.display()));
        }

        let mut devices: Vec<DeviceMapping> = ctx
            .input_devices
            .iter()
            .map(|node| device_mapping(&node.display().to_string()))
            .collect();
        devices.push(device_mapping(&ctx.render_node.display().to_string()));
        devices.extend(self.devices.iter().map(|d| device_mapping(d)));

        let mut env: Vec<String> = ctx.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push(format!("HOME={GUEST_STATE_DIR}"));
        env.push(format!("PUID={}", ctx.run_uid));
        env.push(format!("PGID={}", ctx.run_gid));
        env.extend(self.env.iter().cloned());

        let host_config = HostConfig {
            binds: Some(binds),
            devices: Some(devices),
            ..Default::default()
        };
        let mut labels = std::collections::HashMap::new();
        labels.insert("moonhost.session_id".to_string(), ctx.session_id.to_string());
        let config = Config {
            image: Some(self.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            labels: Some(labels),
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RunnerError::StartFailed {
                what: "container",
                reason: e.to_string(),
            })?;
        docker
            .start_container(&name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| RunnerError::StartFailed {
                what: "container",
                reason: e.to_string(),
            })?;
        info!(session_id = ctx.session_id, container = %name, image = %self.image, "container started");

        let pump_cancel = cancel.child_token();
        let mut plugs = spawn_plug_pump(ctx.plug_queue.clone(), pump_cancel.clone());
        let mut wait = docker.wait_container(&name, None::<bollard::query_parameters::WaitContainerOptions>);

        let result = loop {
            tokio::select! {
                exit = wait.next() => {
                    break match exit {
                        Some(Ok(body)) if body.status_code == 0 => Ok(()),
                        Some(Ok(body)) => Err(RunnerError::UnexpectedExit {
                            status: body.status_code,
                        }
                        .into()),
                        Some(Err(e)) => Err(RunnerError::Container(e).into()),
                        None => Err(RunnerError::UnexpectedExit { status: -1 }.into()),
                    };
                }
                _ = cancel.cancelled() => {
                    let options = bollard::query_parameters::StopContainerOptions {
                        t: Some(STOP_GRACE.as_secs() as i32),
                        signal: None,
                    };
                    if let Err(e) = docker.stop_container(&name, Some(options)).await {
                        warn!(container = %name, error = %e, "container stop failed");
                    }
                    break Ok(());
                }
                Some(event) = plugs.recv() => {
                    if let Err(e) = apply_in_container(&docker, &name, ctx, &event).await {
                        warn!(session_id = ctx.session_id, error = %e, "hotplug apply failed");
                    }
                }
            }
        };
        pump_cancel.cancel();

        let remove = bollard::query_parameters::RemoveContainerOptions {
            force: true,
            v: true,
            link: false,
        };
        if let Err(e) = docker.remove_container(&name, Some(remove)).await {
            warn!(container = %name, error = %e, "container remove failed");
        }
        result
    }
}

fn device_mapping(node: &str) -> DeviceMapping {
    DeviceMapping {
        path_on_host: Some(node.to_string()),
        path_in_container: Some(node.to_string()),
        cgroup_permissions: Some("rwm".to_string()),
    }
}

/// Recreate (or remove) the device node inside the container namespace.
async fn apply_in_container(
    docker: &Docker,
    name: &str,
    ctx: &RunContext,
    event: &PlugEvent,
) -> Result<()> {
    let env = &event.device.udev_env;
    let (Some(devname), Some(major), Some(minor)) =
        (env.get("DEVNAME"), env.get("MAJOR"), env.get("MINOR"))
    else {
        debug!(node = %event.device.node.display(), "no device numbers, skipping guest attach");
        return Ok(());
    };

    let script = match event.action {
        PlugAction::Add => format!(
            "mkdir -p $(dirname {devname}) && mknod -m 0660 {devname} c {major} {minor}; chown {}:{} {devname}",
            ctx.run_uid, ctx.run_gid
        ),
        PlugAction::Remove => format!("rm -f {devname}"),
    };

    let exec = docker
        .create_exec(
            name,
            CreateExecOptions {
                cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
                user: Some("root".to_string()),
                attach_stdout: Some(false),
                attach_stderr: Some(false),
                ..Default::default()
            },
        )
        .await
        .map_err(RunnerError::Container)?;
    docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(RunnerError::Container)?;
    debug!(container = %name, device = %devname, "device replayed in container");
    Ok(())
}
