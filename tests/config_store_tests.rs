//! Config store behavior under pairing, reloads and concurrency

mod common;

use common::*;
use moonhost_server::config::identity::HostIdentity;
use moonhost_server::config::ConfigStore;
use proptest::prelude::*;

#[test]
fn pair_lookup_unpair_cycle() {
    let env = test_env(50200..50210);
    let (record, cert) = fresh_client_cert("cycle-client");

    env.store.pair(record).unwrap();
    assert_eq!(
        env.store.get_client_via_ssl(&cert).unwrap().client_id,
        "cycle-client"
    );

    env.store.unpair(&cert).unwrap();
    assert!(env.store.get_client_via_ssl(&cert).is_none());
}

#[test]
fn lookup_returns_first_match_in_insertion_order() {
    let env = test_env(50210..50220);
    let (first, cert_a) = fresh_client_cert("order-a");
    let (second, cert_b) = fresh_client_cert("order-b");
    env.store.pair(first).unwrap();
    env.store.pair(second).unwrap();

    assert_eq!(env.store.get_client_via_ssl(&cert_a).unwrap().client_id, "order-a");
    assert_eq!(env.store.get_client_via_ssl(&cert_b).unwrap().client_id, "order-b");

    let ids: Vec<String> = env
        .store
        .snapshot()
        .paired_clients()
        .map(|c| c.client_id.clone())
        .collect();
    assert_eq!(ids, vec!["client-1", "order-a", "order-b"]);
}

#[test]
fn reload_round_trips_the_full_config() {
    let env = test_env(50220..50230);
    let before = env.store.snapshot();

    let reloaded = ConfigStore::load_or_default(&env.state_file).unwrap();
    let after = reloaded.snapshot();

    assert_eq!(before.hostname, after.hostname);
    assert_eq!(before.uuid, after.uuid);
    assert_eq!(before.support_hevc, after.support_hevc);
    assert_eq!(before.support_av1, after.support_av1);
    assert_eq!(before.identity.cert_pem(), after.identity.cert_pem());
    let ids =
        |s: &moonhost_server::config::ConfigSnapshot| -> Vec<String> {
            s.paired_clients().map(|c| c.client_id.clone()).collect()
        };
    assert_eq!(ids(&before), ids(&after));
    assert_eq!(
        before.apps().iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
        after.apps().iter().map(|a| a.id.clone()).collect::<Vec<_>>()
    );
}

/// Concurrent pairs and unpairs on distinct certificates end in the same
/// state as any serial ordering: every paired-and-not-unpaired cert
/// present, every unpaired cert gone.
#[test]
fn concurrent_pair_and_unpair_commute() {
    let env = test_env(50230..50240);
    let store = env.store.clone();

    let kept: Vec<_> = (0..3).map(|i| fresh_client_cert(&format!("kept-{i}"))).collect();
    let dropped: Vec<_> = (0..3)
        .map(|i| fresh_client_cert(&format!("dropped-{i}")))
        .collect();
    for (record, _) in &dropped {
        store.pair(record.clone()).unwrap();
    }

    let mut handles = Vec::new();
    for (record, _) in &kept {
        let store = store.clone();
        let record = record.clone();
        handles.push(std::thread::spawn(move || store.pair(record).unwrap()));
    }
    for (_, cert) in &dropped {
        let store = store.clone();
        let cert = cert.clone();
        handles.push(std::thread::spawn(move || store.unpair(&cert).unwrap()));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for (_, cert) in &kept {
        assert!(store.get_client_via_ssl(cert).is_some());
    }
    for (_, cert) in &dropped {
        assert!(store.get_client_via_ssl(cert).is_none());
    }

    // the persisted file reflects the same final state
    let reloaded = ConfigStore::load_or_default(&env.state_file).unwrap();
    for (_, cert) in &kept {
        assert!(reloaded.get_client_via_ssl(cert).is_some());
    }
    for (_, cert) in &dropped {
        assert!(reloaded.get_client_via_ssl(cert).is_none());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Persist-then-load preserves arbitrary app catalogs.
    #[test]
    fn state_file_round_trips_app_catalogs(
        apps in proptest::collection::vec(("[a-z0-9]{1,8}", "[ -~]{1,24}"), 0..5)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let host = HostIdentity::generate("prop-host").unwrap();
        let app_values: Vec<serde_json::Value> = apps
            .iter()
            .enumerate()
            .map(|(i, (id, title))| {
                serde_json::json!({
                    "id": format!("{id}-{i}"),
                    "title": title,
                    "h264_pipeline": "x264enc",
                    "opus_pipeline": "opusenc",
                    "runner": { "type": "command", "command": "true" }
                })
            })
            .collect();
        let state = serde_json::json!({
            "hostname": "prop-host",
            "uuid": "26c1c1f8-0000-4000-8000-000000000000",
            "host_cert": host.cert_pem(),
            "host_key": host.key_pem(),
            "apps": app_values,
        });
        let path = dir.path().join("state.json");
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let store = ConfigStore::load_or_default(&path).unwrap();
        // mutate once so the store itself rewrites the file
        let (record, cert) = fresh_client_cert("prop-client");
        store.pair(record).unwrap();

        let reloaded = ConfigStore::load_or_default(&path).unwrap();
        let loaded_ids: Vec<String> =
            reloaded.snapshot().apps().iter().map(|a| a.id.clone()).collect();
        let expected_ids: Vec<String> = apps
            .iter()
            .enumerate()
            .map(|(i, (id, _))| format!("{id}-{i}"))
            .collect();
        prop_assert_eq!(loaded_ids, expected_ids);
        prop_assert!(reloaded.get_client_via_ssl(&cert).is_some());
    }
}

#[test]
fn unrelated_cert_never_authenticates() {
    let env = test_env(50240..50250);
    let stranger = HostIdentity::generate("stranger").unwrap();
    let cert = openssl::x509::X509::from_pem(stranger.cert_pem().as_bytes()).unwrap();
    assert!(env.store.get_client_via_ssl(&cert).is_none());
    assert!(env.store.unpair(&cert).is_err());
}
