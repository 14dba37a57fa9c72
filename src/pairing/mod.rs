//! Moonlight 4-phase pairing handshake
//!
//! Each phase arrives as its own HTTP request. In-flight state is keyed
//! by the client address plus its certificate fingerprint, lives ~30
//! seconds, and is evicted on any terminal transition: success, any
//! verification failure, out-of-order phases, or timeout. The PIN is
//! delivered out of band through a [`PairSignal`] published on the bus;
//! whatever UI or CLI is attached fulfills the promise exactly once.
//!
//! Only phase one carries the certificate on the wire; later phases are
//! matched to their exchange by client address plus the phase they can
//! legally arrive in. Clients sharing an address therefore pair
//! concurrently as long as they are not sitting in the same phase; that
//! one ambiguous case is refused without touching either exchange.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use openssl::x509::X509;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigStore, PairedClient};
use crate::crypto;
use crate::error::{PairingError, ProtocolError, Result};
use crate::events::{Event, EventBus};

/// How long an incomplete exchange may sit between phases.
pub const PAIRING_TTL: Duration = Duration::from_secs(30);

/// How long phase one waits for the user to type the PIN.
pub const PIN_WAIT: Duration = Duration::from_secs(60);

const DEFAULT_RUN_UID: u32 = 1000;
const DEFAULT_RUN_GID: u32 = 1000;

/// A pairing attempt waiting for its PIN.
///
/// Single-fulfillment: the first `fulfill` wins, later calls return
/// `false`.
pub struct PairSignal {
    pub client_ip: IpAddr,
    pub host_ip: IpAddr,
    pin: Mutex<Option<oneshot::Sender<String>>>,
}

impl PairSignal {
    pub fn fulfill(&self, pin: String) -> bool {
        match self.pin.lock().take() {
            Some(tx) => tx.send(pin).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for PairSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairSignal")
            .field("client_ip", &self.client_ip)
            .field("host_ip", &self.host_ip)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ClientChallenge,
    ServerChallengeResp,
    ClientPairingSecret,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::ClientChallenge => "clientchallenge",
            Phase::ServerChallengeResp => "serverchallengeresp",
            Phase::ClientPairingSecret => "clientpairingsecret",
        }
    }
}

struct PairState {
    phase: Phase,
    client_cert: X509,
    aes_key: [u8; 16],
    server_challenge: Option<[u8; 16]>,
    client_hash: Option<[u8; 32]>,
    created: Instant,
}

/// Client address plus certificate fingerprint.
type ExchangeKey = (IpAddr, String);

pub struct PairingManager {
    bus: Arc<EventBus>,
    store: Arc<ConfigStore>,
    host_ip: IpAddr,
    client_state_dir: PathBuf,
    exchanges: DashMap<ExchangeKey, PairState>,
}

impl PairingManager {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<ConfigStore>,
        host_ip: IpAddr,
        client_state_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            host_ip,
            client_state_dir,
            exchanges: DashMap::new(),
        })
    }

    /// Periodic eviction of exchanges that never completed.
    pub fn spawn_expirer(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                manager.evict_expired();
            }
        });
    }

    fn evict_expired(&self) {
        self.exchanges.retain(|(ip, _), state| {
            let keep = state.created.elapsed() < PAIRING_TTL;
            if !keep {
                warn!(client_ip = %ip, "pairing attempt expired");
            }
            keep
        });
    }

    /// Phase 1: announce the attempt, wait (bounded) for the PIN, derive
    /// the exchange key and hand back the host certificate.
    pub async fn server_cert(
        &self,
        client_ip: IpAddr,
        salt_hex: &str,
        client_cert_pem: &str,
    ) -> Result<String> {
        let salt: [u8; 16] = decode_hex_array(salt_hex, "salt")?;
        let client_cert = X509::from_pem(client_cert_pem.as_bytes())
            .map_err(|_| PairingError::Malformed("client certificate".into()))?;
        let cert_hash = crypto::cert_fingerprint(&client_cert)?;

        let (tx, rx) = oneshot::channel();
        self.bus.publish(Event::PairSignal(Arc::new(PairSignal {
            client_ip,
            host_ip: self.host_ip,
            pin: Mutex::new(Some(tx)),
        })));
        info!(%client_ip, "pairing requested, waiting for PIN");

        let pin = timeout(PIN_WAIT, rx)
            .await
            .map_err(|_| PairingError::PinTimeout)?
            .map_err(|_| PairingError::PinTimeout)?;

        let digest = crypto::sha256(&[&salt, pin.trim().as_bytes()]);
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(&digest[..16]);

        // same certificate retrying from the same address restarts its
        // own exchange; other exchanges from that address are untouched
        if self
            .exchanges
            .insert(
                (client_ip, cert_hash),
                PairState {
                    phase: Phase::ClientChallenge,
                    client_cert,
                    aes_key,
                    server_challenge: None,
                    client_hash: None,
                    created: Instant::now(),
                },
            )
            .is_some()
        {
            debug!(%client_ip, "pairing attempt restarted");
        }

        let snapshot = self.store.snapshot();
        Ok(hex::encode(snapshot.identity.cert_pem()))
    }

    /// Phase 2: answer the client challenge with our own.
    pub async fn client_challenge(&self, client_ip: IpAddr, challenge_hex: &str) -> Result<String> {
        let payload = decode_hex(challenge_hex, "clientchallenge")?;
        let (key, mut state) = self.take_state(client_ip, Phase::ClientChallenge)?;

        let challenge = crypto::aes_ecb_decrypt(&state.aes_key, &payload)
            .map_err(|_| PairingError::BadChallenge)?;
        if challenge.len() != 16 {
            return Err(PairingError::BadChallenge.into());
        }

        let server_challenge = crypto::random_bytes::<16>()?;
        let snapshot = self.store.snapshot();
        let host_cert_sig = crypto::cert_signature(snapshot.identity.cert());
        let server_hash = crypto::sha256(&[&challenge, &host_cert_sig, &server_challenge]);

        let mut plain = Vec::with_capacity(48);
        plain.extend_from_slice(&server_hash);
        plain.extend_from_slice(&server_challenge);
        let response = crypto::aes_ecb_encrypt(&state.aes_key, &plain)?;

        state.server_challenge = Some(server_challenge);
        state.phase = Phase::ServerChallengeResp;
        self.exchanges.insert(key, state);
        Ok(hex::encode(response))
    }

    /// Phase 3: record the client's hash, answer with our secret and its
    /// signature.
    pub async fn server_challenge_resp(
        &self,
        client_ip: IpAddr,
        response_hex: &str,
    ) -> Result<String> {
        let payload = decode_hex(response_hex, "serverchallengeresp")?;
        let (key, mut state) = self.take_state(client_ip, Phase::ServerChallengeResp)?;

        let decrypted = crypto::aes_ecb_decrypt(&state.aes_key, &payload)
            .map_err(|_| PairingError::BadChallenge)?;
        if decrypted.len() != 32 {
            return Err(PairingError::BadChallenge.into());
        }
        let mut client_hash = [0u8; 32];
        client_hash.copy_from_slice(&decrypted);

        let server_secret = crypto::random_bytes::<16>()?;
        let snapshot = self.store.snapshot();
        let signature = crypto::sign_sha256(snapshot.identity.key(), &server_secret)?;

        let mut plain = Vec::with_capacity(16 + signature.len());
        plain.extend_from_slice(&server_secret);
        plain.extend_from_slice(&signature);
        let response = crypto::aes_ecb_encrypt(&state.aes_key, &plain)?;

        state.client_hash = Some(client_hash);
        state.phase = Phase::ClientPairingSecret;
        self.exchanges.insert(key, state);
        Ok(hex::encode(response))
    }

    /// Phase 4: verify the client's secret and signature; on success the
    /// client becomes a paired client. Returns whether pairing succeeded;
    /// the exchange state is gone either way.
    pub async fn client_pairing_secret(&self, client_ip: IpAddr, secret_hex: &str) -> Result<bool> {
        let payload = decode_hex(secret_hex, "clientpairingsecret")?;
        let ((_, cert_hash), state) = self.take_state(client_ip, Phase::ClientPairingSecret)?;

        if payload.len() <= 16 {
            return Err(PairingError::Malformed("pairing secret too short".into()).into());
        }
        let (client_secret, signature) = payload.split_at(16);

        if !crypto::verify_sha256(&state.client_cert, client_secret, signature) {
            warn!(%client_ip, "pairing rejected: bad client signature");
            return Ok(false);
        }

        let (Some(server_challenge), Some(client_hash)) =
            (state.server_challenge, state.client_hash)
        else {
            return Err(PairingError::PhaseMismatch {
                expected: Phase::ClientPairingSecret.name(),
                got: "incomplete exchange",
            }
            .into());
        };
        let client_cert_sig = crypto::cert_signature(&state.client_cert);
        let expected = crypto::sha256(&[&server_challenge, &client_cert_sig, client_secret]);
        if expected != client_hash {
            warn!(%client_ip, "pairing rejected: secret hash mismatch");
            return Ok(false);
        }

        let record = PairedClient {
            client_id: Uuid::new_v4().to_string(),
            client_cert: String::from_utf8_lossy(&state.client_cert.to_pem()?).into_owned(),
            app_state_folder: self
                .client_state_dir
                .join(&cert_hash[..16.min(cert_hash.len())]),
            run_uid: DEFAULT_RUN_UID,
            run_gid: DEFAULT_RUN_GID,
        };
        self.store.pair(record)?;
        info!(%client_ip, "pairing complete");
        Ok(true)
    }

    /// Remove the exchange this request belongs to; the caller reinserts
    /// it only when its phase completed successfully.
    ///
    /// Later phases carry no certificate, so the exchange is located by
    /// address and by the phase the request can legally arrive in. Two
    /// exchanges from one address sitting in the same phase cannot be
    /// told apart; that request is refused and both exchanges are left
    /// for their owners (or the TTL).
    fn take_state(&self, client_ip: IpAddr, expected: Phase) -> Result<(ExchangeKey, PairState)> {
        let mut candidates: Vec<ExchangeKey> = self
            .exchanges
            .iter()
            .filter(|entry| {
                entry.key().0 == client_ip
                    && entry.phase == expected
                    && entry.created.elapsed() < PAIRING_TTL
            })
            .map(|entry| entry.key().clone())
            .collect();
        match candidates.len() {
            1 => {
                let key = candidates.remove(0);
                self.exchanges
                    .remove(&key)
                    .ok_or_else(|| {
                        PairingError::NoSuchExchange {
                            client: client_ip.to_string(),
                        }
                        .into()
                    })
            }
            0 => {
                // a lone exchange in the wrong phase is an out-of-order
                // request; terminate it
                let stale: Vec<ExchangeKey> = self
                    .exchanges
                    .iter()
                    .filter(|entry| {
                        entry.key().0 == client_ip && entry.created.elapsed() < PAIRING_TTL
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                if let [key] = stale.as_slice() {
                    if let Some((_, state)) = self.exchanges.remove(key) {
                        return Err(PairingError::PhaseMismatch {
                            expected: expected.name(),
                            got: state.phase.name(),
                        }
                        .into());
                    }
                }
                Err(PairingError::NoSuchExchange {
                    client: client_ip.to_string(),
                }
                .into())
            }
            _ => Err(PairingError::AmbiguousExchange {
                client: client_ip.to_string(),
            }
            .into()),
        }
    }
}

fn decode_hex(value: &str, param: &'static str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|_| ProtocolError::BadHex(param).into())
}

fn decode_hex_array<const N: usize>(value: &str, param: &'static str) -> Result<[u8; N]> {
    let bytes = decode_hex(value, param)?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::BadHex(param).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::identity::HostIdentity;
    use crate::events::EventKind;
    use crate::error::ServerError;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    struct TestClient {
        identity: HostIdentity,
        salt: [u8; 16],
        aes_key: [u8; 16],
        challenge: [u8; 16],
        secret: [u8; 16],
    }

    impl TestClient {
        fn new(pin: &str) -> Self {
            let identity = HostIdentity::generate("moonlight-client").unwrap();
            let salt = crypto::random_bytes().unwrap();
            let digest = crypto::sha256(&[&salt, pin.as_bytes()]);
            let mut aes_key = [0u8; 16];
            aes_key.copy_from_slice(&digest[..16]);
            Self {
                identity,
                salt,
                aes_key,
                challenge: crypto::random_bytes().unwrap(),
                secret: crypto::random_bytes().unwrap(),
            }
        }
    }

    fn test_manager(
        pin: &'static str,
        dir: &tempfile::TempDir,
    ) -> (Arc<PairingManager>, Arc<ConfigStore>, Arc<EventBus>, Vec<crate::events::Subscription>) {
        let bus = Arc::new(EventBus::new());
        let store =
            Arc::new(ConfigStore::load_or_default(dir.path().join("state.json")).unwrap());
        let manager = PairingManager::new(
            bus.clone(),
            store.clone(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            dir.path().join("clients"),
        );
        // stand-in for the UI that learns the PIN from the user
        let sub = bus.subscribe(EventKind::PairSignal, move |event| {
            if let Event::PairSignal(signal) = event {
                assert!(signal.fulfill(pin.to_string()));
            }
        });
        (manager, store, bus, vec![sub])
    }

    /// Drive all four phases as a Moonlight client would. `keys_agree` is
    /// false when the test deliberately mismatches the PIN, in which case
    /// the client-side consistency checks are meaningless noise.
    async fn run_exchange(
        manager: &PairingManager,
        client: &TestClient,
        keys_agree: bool,
    ) -> Result<bool> {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

        let cert_hex = manager
            .server_cert(
                ip,
                &hex::encode(client.salt),
                &String::from_utf8_lossy(&client.identity.cert().to_pem().unwrap()),
            )
            .await?;
        let host_cert =
            X509::from_pem(&hex::decode(cert_hex).unwrap()).expect("host cert parses");

        let enc_challenge = crypto::aes_ecb_encrypt(&client.aes_key, &client.challenge).unwrap();
        let phase2 = manager.client_challenge(ip, &hex::encode(enc_challenge)).await?;
        let phase2_plain =
            crypto::aes_ecb_decrypt(&client.aes_key, &hex::decode(phase2).unwrap()).unwrap();
        let (server_hash, server_challenge) = phase2_plain.split_at(32);

        // the client folds its own cert signature and secret into a hash
        let client_cert_sig = crypto::cert_signature(client.identity.cert());
        let client_hash =
            crypto::sha256(&[server_challenge, &client_cert_sig, &client.secret]);
        let enc_hash = crypto::aes_ecb_encrypt(&client.aes_key, &client_hash).unwrap();
        let phase3 = manager.server_challenge_resp(ip, &hex::encode(enc_hash)).await?;
        let phase3_plain =
            crypto::aes_ecb_decrypt(&client.aes_key, &hex::decode(phase3).unwrap()).unwrap();
        let (server_secret, server_sig) = phase3_plain.split_at(16);

        if keys_agree {
            // client-side checks mirror ours
            assert!(crypto::verify_sha256(&host_cert, server_secret, server_sig));
            let host_cert_sig = crypto::cert_signature(&host_cert);
            let expected_server_hash =
                crypto::sha256(&[&client.challenge, &host_cert_sig, server_challenge]);
            assert_eq!(server_hash, expected_server_hash);
        }

        let mut phase4 = client.secret.to_vec();
        phase4.extend(crypto::sign_sha256(client.identity.key(), &client.secret).unwrap());
        manager.client_pairing_secret(ip, &hex::encode(phase4)).await
    }

    #[tokio::test]
    async fn successful_exchange_pairs_the_client() {
        let dir = tempdir().unwrap();
        let (manager, store, _bus, _subs) = test_manager("1234", &dir);
        let client = TestClient::new("1234");

        assert!(run_exchange(&manager, &client, true).await.unwrap());
        assert!(store.get_client_via_ssl(client.identity.cert()).is_some());
        assert!(manager.exchanges.is_empty());
    }

    #[tokio::test]
    async fn wrong_pin_fails_verification_and_pairs_nothing() {
        let dir = tempdir().unwrap();
        // host learns 9999 while the client derives its key from 1234
        let (manager, store, _bus, _subs) = test_manager("9999", &dir);
        let client = TestClient::new("1234");

        assert!(!run_exchange(&manager, &client, false).await.unwrap());
        assert!(store.get_client_via_ssl(client.identity.cert()).is_none());
        assert!(manager.exchanges.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_phase_terminates_the_exchange() {
        let dir = tempdir().unwrap();
        let (manager, _store, _bus, _subs) = test_manager("1234", &dir);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

        let err = manager
            .client_challenge(ip, &hex::encode([0u8; 16]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Pairing(PairingError::NoSuchExchange { .. })
        ));
    }

    async fn phase1(manager: &PairingManager, client: &TestClient, ip: IpAddr) {
        manager
            .server_cert(
                ip,
                &hex::encode(client.salt),
                &String::from_utf8_lossy(&client.identity.cert().to_pem().unwrap()),
            )
            .await
            .unwrap();
    }

    async fn phase2(manager: &PairingManager, client: &TestClient, ip: IpAddr) -> Vec<u8> {
        let enc = crypto::aes_ecb_encrypt(&client.aes_key, &client.challenge).unwrap();
        let reply = manager
            .client_challenge(ip, &hex::encode(enc))
            .await
            .unwrap();
        crypto::aes_ecb_decrypt(&client.aes_key, &hex::decode(reply).unwrap()).unwrap()
    }

    async fn phase3(manager: &PairingManager, client: &TestClient, ip: IpAddr, challenge: &[u8]) {
        let cert_sig = crypto::cert_signature(client.identity.cert());
        let hash = crypto::sha256(&[challenge, &cert_sig, &client.secret]);
        let enc = crypto::aes_ecb_encrypt(&client.aes_key, &hash).unwrap();
        manager
            .server_challenge_resp(ip, &hex::encode(enc))
            .await
            .unwrap();
    }

    async fn phase4(manager: &PairingManager, client: &TestClient, ip: IpAddr) -> bool {
        let mut payload = client.secret.to_vec();
        payload.extend(crypto::sign_sha256(client.identity.key(), &client.secret).unwrap());
        manager
            .client_pairing_secret(ip, &hex::encode(payload))
            .await
            .unwrap()
    }

    /// Two clients behind one address interleave their exchanges; phases
    /// never collide, so both complete.
    #[tokio::test]
    async fn clients_sharing_an_address_pair_concurrently() {
        let dir = tempdir().unwrap();
        let (manager, store, _bus, _subs) = test_manager("1234", &dir);
        let nat_ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));
        let alice = TestClient::new("1234");
        let bob = TestClient::new("1234");

        phase1(&manager, &alice, nat_ip).await;
        let alice_reply = phase2(&manager, &alice, nat_ip).await;
        phase1(&manager, &bob, nat_ip).await;
        assert_eq!(manager.exchanges.len(), 2);

        phase3(&manager, &alice, nat_ip, &alice_reply[32..]).await;
        let bob_reply = phase2(&manager, &bob, nat_ip).await;
        assert!(phase4(&manager, &alice, nat_ip).await);
        phase3(&manager, &bob, nat_ip, &bob_reply[32..]).await;
        assert!(phase4(&manager, &bob, nat_ip).await);

        assert!(store.get_client_via_ssl(alice.identity.cert()).is_some());
        assert!(store.get_client_via_ssl(bob.identity.cert()).is_some());
        assert!(manager.exchanges.is_empty());
    }

    /// Two same-address exchanges in the same phase cannot be told apart;
    /// the request is refused and neither exchange is clobbered.
    #[tokio::test]
    async fn same_phase_collision_is_refused_without_eviction() {
        let dir = tempdir().unwrap();
        let (manager, _store, _bus, _subs) = test_manager("1234", &dir);
        let nat_ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 2));
        let alice = TestClient::new("1234");
        let bob = TestClient::new("1234");

        phase1(&manager, &alice, nat_ip).await;
        phase1(&manager, &bob, nat_ip).await;
        assert_eq!(manager.exchanges.len(), 2);

        let enc = crypto::aes_ecb_encrypt(&alice.aes_key, &alice.challenge).unwrap();
        let err = manager
            .client_challenge(nat_ip, &hex::encode(enc))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Pairing(PairingError::AmbiguousExchange { .. })
        ));
        assert_eq!(manager.exchanges.len(), 2);
    }
}
