//! Virtual device policy: write-once cells, joypad slots, plug events

mod common;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use moonhost_server::config::JoypadType;
use moonhost_server::error::Result;
use moonhost_server::input::{
    DeviceKind, InputDeviceHandle, InputService, PlugAction, VirtualDeviceFactory,
};

#[derive(Default)]
struct StubFactory {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl VirtualDeviceFactory for StubFactory {
    fn create(&self, kind: DeviceKind, session_id: u64) -> Result<InputDeviceHandle> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let mut udev_env = HashMap::new();
        udev_env.insert("DEVNAME".into(), format!("/dev/input/event{n}"));
        udev_env.insert("MAJOR".into(), "13".into());
        udev_env.insert("MINOR".into(), (64 + n).to_string());
        Ok(InputDeviceHandle {
            kind,
            node: PathBuf::from(format!("/dev/input/event{n}")),
            udev_env,
            hw_db_entries: if kind == DeviceKind::Joypad {
                vec![format!("session-{session_id}-pad")]
            } else {
                Vec::new()
            },
        })
    }

    fn destroy(&self, _device: &InputDeviceHandle) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 2, 2, last))
}

#[test]
fn mouse_and_keyboard_exist_from_session_start() {
    let env = test_env(50700..50720);
    let factory = Arc::new(StubFactory::default());
    let _service = InputService::spawn(&env.bus, factory.clone());

    let session = env
        .registry
        .launch(env.launch_request("1", ip(1)))
        .unwrap();

    assert!(session.input_device(DeviceKind::Mouse).is_some());
    assert!(session.input_device(DeviceKind::Keyboard).is_some());
    assert!(session.input_device(DeviceKind::Pen).is_none());

    // both attachments were mirrored into the plug queue
    let mut plugged = Vec::new();
    while let Some(event) = session.plug_queue.pop_with_timeout(Duration::from_millis(1)) {
        assert_eq!(event.action, PlugAction::Add);
        plugged.push(event.device.kind);
    }
    assert_eq!(plugged, vec![DeviceKind::Mouse, DeviceKind::Keyboard]);
}

#[test]
fn device_cells_are_write_once() {
    let env = test_env(50720..50740);
    let factory = Arc::new(StubFactory::default());
    let service = InputService::spawn(&env.bus, factory.clone());

    let session = env
        .registry
        .launch(env.launch_request("1", ip(2)))
        .unwrap();

    let first = service.ensure_device(&session, DeviceKind::Pen).unwrap();
    let second = service.ensure_device(&session, DeviceKind::Pen).unwrap();
    assert_eq!(first.node, second.node);
    assert_eq!(
        session.input_device(DeviceKind::Pen).unwrap().node,
        first.node
    );
}

#[test]
fn joypad_slots_are_last_writer_wins() {
    let env = test_env(50740..50760);
    let factory = Arc::new(StubFactory::default());
    let service = InputService::spawn(&env.bus, factory.clone());

    let session = env
        .registry
        .launch(env.launch_request("1", ip(3)))
        .unwrap();

    service
        .add_joypad(&session, 0, JoypadType::Xbox)
        .unwrap();
    let destroyed_before = factory.destroyed.load(Ordering::SeqCst);
    service
        .add_joypad(&session, 0, JoypadType::Nintendo)
        .unwrap();

    assert_eq!(session.joypads.len(), 1);
    assert_eq!(
        session.joypads.get(&0).unwrap().joypad_type,
        JoypadType::Nintendo
    );
    // the replaced pad's device was torn down
    assert_eq!(
        factory.destroyed.load(Ordering::SeqCst),
        destroyed_before + 1
    );

    service.remove_joypad(&session, 0);
    assert!(session.joypads.is_empty());
}

#[test]
fn stop_destroys_every_created_device() {
    let env = test_env(50760..50780);
    let factory = Arc::new(StubFactory::default());
    let service = InputService::spawn(&env.bus, factory.clone());

    let session = env
        .registry
        .launch(env.launch_request("1", ip(4)))
        .unwrap();
    service.ensure_device(&session, DeviceKind::Touch).unwrap();
    service.add_joypad(&session, 0, JoypadType::Auto).unwrap();

    let created = factory.created.load(Ordering::SeqCst);
    env.registry.stop(session.session_id);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), created);
}
