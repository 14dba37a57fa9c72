//! Virtual display lifecycle: creation on launch, env export, teardown

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use moonhost_server::display::{DisplayHandle, DisplayService, VirtualDisplayFactory};
use moonhost_server::error::Result;
use moonhost_server::runner::RunContext;
use moonhost_server::session::DisplayMode;

#[derive(Default)]
struct StubCompositor {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl VirtualDisplayFactory for StubCompositor {
    fn create(&self, session_id: u64, mode: DisplayMode) -> Result<DisplayHandle> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(DisplayHandle {
            wayland_socket: format!("wayland-headless-{session_id}"),
            mode,
        })
    }

    fn destroy(&self, _display: &DisplayHandle) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 3, 3, last))
}

#[test]
fn compositor_app_gets_a_display_and_the_runner_env() {
    let env = test_env(50800..50820);
    let compositor = Arc::new(StubCompositor::default());
    let _service = DisplayService::spawn(&env.bus, compositor.clone());

    let session = env
        .registry
        .launch(env.launch_request("2", ip(1)))
        .unwrap();

    let socket = format!("wayland-headless-{}", session.session_id);
    assert_eq!(session.wayland_display(), Some(socket.as_str()));
    assert_eq!(compositor.created.load(Ordering::SeqCst), 1);

    let ctx = RunContext::from_session(&session);
    assert_eq!(ctx.env.get("WAYLAND_DISPLAY"), Some(&socket));
}

#[test]
fn plain_app_runs_without_a_virtual_display() {
    let env = test_env(50820..50840);
    let compositor = Arc::new(StubCompositor::default());
    let _service = DisplayService::spawn(&env.bus, compositor.clone());

    let session = env
        .registry
        .launch(env.launch_request("1", ip(2)))
        .unwrap();

    assert_eq!(session.wayland_display(), None);
    assert_eq!(compositor.created.load(Ordering::SeqCst), 0);
    let ctx = RunContext::from_session(&session);
    assert!(!ctx.env.contains_key("WAYLAND_DISPLAY"));
}

#[test]
fn stop_tears_the_display_down() {
    let env = test_env(50840..50860);
    let compositor = Arc::new(StubCompositor::default());
    let _service = DisplayService::spawn(&env.bus, compositor.clone());

    let session = env
        .registry
        .launch(env.launch_request("2", ip(3)))
        .unwrap();
    assert_eq!(compositor.destroyed.load(Ordering::SeqCst), 0);

    env.registry.stop(session.session_id);
    assert_eq!(compositor.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn wayland_cell_is_write_once() {
    let env = test_env(50860..50880);
    let compositor = Arc::new(StubCompositor::default());
    let _service = DisplayService::spawn(&env.bus, compositor.clone());

    let session = env
        .registry
        .launch(env.launch_request("2", ip(4)))
        .unwrap();

    let installed = session.wayland_display().unwrap().to_owned();
    assert!(!session.set_wayland_display("wayland-late"));
    assert_eq!(session.wayland_display(), Some(installed.as_str()));
}
