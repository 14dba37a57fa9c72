//! Persistent host configuration: paired clients and the app catalog
//!
//! Readers take lock-free snapshots through an atomically swappable cell;
//! writers serialize on a persistence lock, rewrite the state file
//! atomically (write-temp + rename) and only then install the new
//! snapshot. A persistence failure therefore leaves the in-memory state
//! untouched.

pub mod identity;

mod apps;

pub use apps::{App, JoypadType, VideoCodec};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use openssl::x509::{X509Ref, X509};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto;
use crate::error::{PairingError, Result, ServerError};
use identity::HostIdentity;

/// One paired Moonlight client.
///
/// Identity is certificate verification equality, never PEM comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedClient {
    pub client_id: String,
    pub client_cert: String,
    pub app_state_folder: PathBuf,
    pub run_uid: u32,
    pub run_gid: u32,
}

/// On-disk shape of the state file.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    hostname: String,
    uuid: String,
    #[serde(default = "default_hevc")]
    support_hevc: bool,
    #[serde(default)]
    support_av1: bool,
    host_cert: String,
    host_key: String,
    #[serde(default)]
    paired_clients: Vec<PairedClient>,
    #[serde(default)]
    apps: Vec<App>,
}

fn default_hevc() -> bool {
    true
}

struct ClientEntry {
    record: Arc<PairedClient>,
    cert: X509,
}

/// Immutable view of the configuration at one point in time.
pub struct ConfigSnapshot {
    pub hostname: String,
    pub uuid: String,
    pub support_hevc: bool,
    pub support_av1: bool,
    pub identity: Arc<HostIdentity>,
    clients: Vec<ClientEntry>,
    apps: Vec<Arc<App>>,
}

impl ConfigSnapshot {
    fn from_persisted(state: PersistedState) -> Result<Self> {
        let identity = Arc::new(HostIdentity::from_pem(&state.host_cert, &state.host_key)?);
        let mut clients = Vec::with_capacity(state.paired_clients.len());
        for record in state.paired_clients {
            let cert = X509::from_pem(record.client_cert.as_bytes())?;
            clients.push(ClientEntry {
                record: Arc::new(record),
                cert,
            });
        }
        Ok(Self {
            hostname: state.hostname,
            uuid: state.uuid,
            support_hevc: state.support_hevc,
            support_av1: state.support_av1,
            identity,
            clients,
            apps: state.apps.into_iter().map(Arc::new).collect(),
        })
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            hostname: self.hostname.clone(),
            uuid: self.uuid.clone(),
            support_hevc: self.support_hevc,
            support_av1: self.support_av1,
            host_cert: self.identity.cert_pem().to_owned(),
            host_key: self.identity.key_pem().to_owned(),
            paired_clients: self.clients.iter().map(|c| (*c.record).clone()).collect(),
            apps: self.apps.iter().map(|a| (**a).clone()).collect(),
        }
    }

    pub fn paired_clients(&self) -> impl Iterator<Item = &Arc<PairedClient>> {
        self.clients.iter().map(|c| &c.record)
    }

    pub fn apps(&self) -> &[Arc<App>] {
        &self.apps
    }

    /// First stored client, in insertion order, whose certificate the
    /// presented certificate verifies against.
    pub fn get_client_via_ssl(&self, cert: &X509Ref) -> Option<Arc<PairedClient>> {
        self.clients
            .iter()
            .find(|entry| crypto::certs_match(cert, &entry.cert))
            .map(|entry| entry.record.clone())
    }

    pub fn get_app_by_id(&self, id: &str) -> Result<Arc<App>> {
        self.apps
            .iter()
            .find(|app| app.id == id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("app {id}")))
    }

    /// Video codecs this host will negotiate.
    pub fn supported_codecs(&self) -> Vec<VideoCodec> {
        let mut codecs = vec![VideoCodec::H264];
        if self.support_hevc {
            codecs.push(VideoCodec::Hevc);
        }
        if self.support_av1 {
            codecs.push(VideoCodec::Av1);
        }
        codecs
    }
}

/// Shared, atomically updatable configuration store.
pub struct ConfigStore {
    path: PathBuf,
    snapshot: ArcSwap<ConfigSnapshot>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Parse the persisted state, or generate and persist a fresh default
    /// (new uuid, new RSA keypair and self-signed certificate, HEVC on,
    /// AV1 off, nothing paired). A corrupt state file is fatal.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let state: PersistedState = serde_json::from_str(&raw)?;
            debug!(path = %path.display(), "loaded host state");
            ConfigSnapshot::from_persisted(state)?
        } else {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "moonhost".to_owned());
            info!(%hostname, "no state file, generating host identity");
            let identity = Arc::new(HostIdentity::generate(&hostname)?);
            let snapshot = ConfigSnapshot {
                hostname,
                uuid: Uuid::new_v4().to_string(),
                support_hevc: true,
                support_av1: false,
                identity,
                clients: Vec::new(),
                apps: Vec::new(),
            };
            persist_atomic(&path, &snapshot.to_persisted())?;
            snapshot
        };
        Ok(Self {
            path,
            snapshot: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    /// Current consistent snapshot; never blocks writers.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// Insert a freshly paired client and persist. Certificates that
    /// verify against an already stored client are rejected.
    pub fn pair(&self, client: PairedClient) -> Result<()> {
        let cert = X509::from_pem(client.client_cert.as_bytes())?;
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();
        if current.get_client_via_ssl(&cert).is_some() {
            return Err(PairingError::AlreadyPaired.into());
        }

        let client_id = client.client_id.clone();
        let mut clients: Vec<ClientEntry> = current
            .clients
            .iter()
            .map(|c| ClientEntry {
                record: c.record.clone(),
                cert: c.cert.clone(),
            })
            .collect();
        clients.push(ClientEntry {
            record: Arc::new(client),
            cert,
        });
        let next = ConfigSnapshot {
            hostname: current.hostname.clone(),
            uuid: current.uuid.clone(),
            support_hevc: current.support_hevc,
            support_av1: current.support_av1,
            identity: current.identity.clone(),
            clients,
            apps: current.apps.clone(),
        };
        self.commit(next)?;
        info!(client_id, "client paired");
        Ok(())
    }

    /// Remove every stored client the given certificate verifies against.
    pub fn unpair(&self, cert: &X509Ref) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();
        let clients: Vec<ClientEntry> = current
            .clients
            .iter()
            .filter(|entry| !crypto::certs_match(cert, &entry.cert))
            .map(|c| ClientEntry {
                record: c.record.clone(),
                cert: c.cert.clone(),
            })
            .collect();
        if clients.len() == current.clients.len() {
            return Err(ServerError::Unauthorized("certificate is not paired".into()));
        }
        let removed = current.clients.len() - clients.len();
        let next = ConfigSnapshot {
            hostname: current.hostname.clone(),
            uuid: current.uuid.clone(),
            support_hevc: current.support_hevc,
            support_av1: current.support_av1,
            identity: current.identity.clone(),
            clients,
            apps: current.apps.clone(),
        };
        self.commit(next)?;
        info!(removed, "client unpaired");
        Ok(())
    }

    pub fn get_client_via_ssl(&self, cert: &X509Ref) -> Option<Arc<PairedClient>> {
        self.snapshot().get_client_via_ssl(cert)
    }

    pub fn get_app_by_id(&self, id: &str) -> Result<Arc<App>> {
        self.snapshot().get_app_by_id(id)
    }

    /// Persist first, swap the snapshot only on success.
    fn commit(&self, next: ConfigSnapshot) -> Result<()> {
        persist_atomic(&self.path, &next.to_persisted())
            .map_err(|e| ServerError::Transient(format!("state persist failed: {e}")))?;
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

fn persist_atomic(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
