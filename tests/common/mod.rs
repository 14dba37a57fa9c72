//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openssl::x509::X509;
use tempfile::TempDir;

use moonhost_server::config::identity::HostIdentity;
use moonhost_server::config::{ConfigStore, PairedClient};
use moonhost_server::events::EventBus;
use moonhost_server::session::{DisplayMode, LaunchRequest, SessionRegistry};

pub struct TestEnv {
    pub dir: TempDir,
    pub state_file: PathBuf,
    pub store: Arc<ConfigStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<SessionRegistry>,
    /// Identity of the one pre-paired client.
    pub client: HostIdentity,
}

impl TestEnv {
    pub fn client_cert(&self) -> X509 {
        X509::from_pem(self.client.cert_pem().as_bytes()).unwrap()
    }

    pub fn launch_request(&self, app_id: &str, client_ip: IpAddr) -> LaunchRequest {
        LaunchRequest {
            app_id: app_id.to_owned(),
            client_cert: self.client_cert(),
            client_ip,
            display_mode: DisplayMode {
                width: 1920,
                height: 1080,
                refresh_rate: 60,
            },
            audio_channel_count: 2,
            aes_key: Some([9u8; 16]),
            aes_iv: Some([7u8; 16]),
        }
    }
}

/// A state file with one desktop app, authored the way a user would.
pub fn write_state_file(dir: &Path, host: &HostIdentity) -> PathBuf {
    let path = dir.join("state.json");
    let state = serde_json::json!({
        "hostname": "test-host",
        "uuid": "8a9417e8-9d9c-4a37-a75c-2e3bd821e100",
        "support_hevc": true,
        "support_av1": false,
        "host_cert": host.cert_pem(),
        "host_key": host.key_pem(),
        "paired_clients": [],
        "apps": [
            {
                "id": "1",
                "title": "Desktop",
                "h264_pipeline": "x264enc bitrate={bitrate} ! udpsink port={port}",
                "hevc_pipeline": "x265enc bitrate={bitrate} ! udpsink port={port}",
                "opus_pipeline": "opusenc ! udpsink port={port}",
                "runner": { "type": "command", "command": "sleep 600" }
            },
            {
                "id": "2",
                "title": "Headless Game",
                "h264_pipeline": "x264enc bitrate={bitrate} ! udpsink port={port}",
                "opus_pipeline": "opusenc ! udpsink port={port}",
                "start_virtual_compositor": true,
                "runner": { "type": "command", "command": "sleep 600" }
            }
        ],
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&state).unwrap()).unwrap();
    path
}

/// Store plus registry with one app and one paired client.
pub fn test_env(port_range: std::ops::Range<u16>) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let host = HostIdentity::generate("test-host").unwrap();
    let state_file = write_state_file(dir.path(), &host);
    let store = Arc::new(ConfigStore::load_or_default(&state_file).unwrap());

    let client = HostIdentity::generate("moonlight-client").unwrap();
    store
        .pair(PairedClient {
            client_id: "client-1".into(),
            client_cert: client.cert_pem().to_owned(),
            app_state_folder: dir.path().join("client-1"),
            run_uid: 1000,
            run_gid: 1000,
        })
        .unwrap();

    let bus = Arc::new(EventBus::new());
    let registry = SessionRegistry::new(bus.clone(), store.clone(), port_range);
    TestEnv {
        dir,
        state_file,
        store,
        bus,
        registry,
        client,
    }
}

pub fn fresh_client_cert(name: &str) -> (PairedClient, X509) {
    let identity = HostIdentity::generate(name).unwrap();
    let cert = X509::from_pem(identity.cert_pem().as_bytes()).unwrap();
    (
        PairedClient {
            client_id: name.to_owned(),
            client_cert: identity.cert_pem().to_owned(),
            app_state_folder: std::env::temp_dir().join(name),
            run_uid: 1000,
            run_gid: 1000,
        },
        cert,
    )
}
