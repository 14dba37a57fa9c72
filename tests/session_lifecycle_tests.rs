//! Session registry lifecycle: launch, stop, event gating, id allocation

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use moonhost_server::config::identity::HostIdentity;
use moonhost_server::error::ServerError;
use moonhost_server::events::{Event, EventKind, IdrRequest, PauseStream};

fn client_ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 1, 1, last))
}

#[test]
fn launch_resolves_client_and_app() {
    let env = test_env(50300..50320);
    let session = env
        .registry
        .launch(env.launch_request("1", client_ip(1)))
        .unwrap();

    assert_eq!(session.app.title, "Desktop");
    assert_ne!(session.video_port, session.audio_port);
    assert_eq!(session.audio_crypto().key, [9u8; 16]);
    assert!(env.registry.get(session.session_id).is_some());
    assert_eq!(
        env.registry.session_for_ip(client_ip(1)).unwrap().session_id,
        session.session_id
    );
}

#[test]
fn launch_with_unpaired_cert_is_unauthorized() {
    let env = test_env(50320..50340);
    let stranger = HostIdentity::generate("stranger").unwrap();
    let mut request = env.launch_request("1", client_ip(2));
    request.client_cert =
        openssl::x509::X509::from_pem(stranger.cert_pem().as_bytes()).unwrap();

    assert!(matches!(
        env.registry.launch(request),
        Err(ServerError::Unauthorized(_))
    ));
}

#[test]
fn launch_with_unknown_app_is_not_found() {
    let env = test_env(50340..50360);
    assert!(matches!(
        env.registry.launch(env.launch_request("42", client_ip(3))),
        Err(ServerError::NotFound(_))
    ));
}

#[test]
fn session_ids_are_never_reused() {
    let env = test_env(50360..50380);
    let mut seen = std::collections::HashSet::new();
    for round in 0..20 {
        let session = env
            .registry
            .launch(env.launch_request("1", client_ip(4)))
            .unwrap();
        assert!(
            seen.insert(session.session_id),
            "id {} reused in round {round}",
            session.session_id
        );
        env.registry.stop(session.session_id);
    }
}

#[test]
fn no_events_for_a_session_after_stop() {
    let env = test_env(50380..50400);
    let session = env
        .registry
        .launch(env.launch_request("1", client_ip(5)))
        .unwrap();
    let session_id = session.session_id;

    env.registry.stop(session_id);

    // a subscriber registered after the stop must never hear from it
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let _sub = env.bus.subscribe(EventKind::PauseStream, move |event| {
        if event.session_id() == Some(session_id) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let counter = delivered.clone();
    let _sub2 = env.bus.subscribe(EventKind::IdrRequest, move |event| {
        if event.session_id() == Some(session_id) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    env.registry
        .publish_for(Event::PauseStream(PauseStream { session_id }));
    env.registry
        .publish_for(Event::IdrRequest(IdrRequest { session_id }));
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}

#[test]
fn stop_is_idempotent_and_emits_once() {
    let env = test_env(50400..50420);
    let session = env
        .registry
        .launch(env.launch_request("1", client_ip(6)))
        .unwrap();
    let session_id = session.session_id;

    let stops = Arc::new(AtomicUsize::new(0));
    let counter = stops.clone();
    let _sub = env.bus.subscribe(EventKind::StopStream, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    env.registry.stop(session_id);
    env.registry.stop(session_id);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn ports_return_to_the_pool_after_the_session_drops() {
    let env = test_env(50420..50423); // room for exactly one pair at a time
    let first = env
        .registry
        .launch(env.launch_request("1", client_ip(7)))
        .unwrap();
    let first_ports = (first.video_port, first.audio_port);

    // both ports are leased; a second launch cannot get a pair
    assert!(matches!(
        env.registry.launch(env.launch_request("1", client_ip(8))),
        Err(ServerError::ResourceExhausted { .. })
    ));

    env.registry.stop(first.session_id);
    drop(first);

    let second = env
        .registry
        .launch(env.launch_request("1", client_ip(9)))
        .unwrap();
    assert_eq!((second.video_port, second.audio_port), first_ports);
}

#[test]
fn stop_during_launch_suppresses_media_session_events() {
    let env = test_env(50424..50440);
    let session = env
        .registry
        .launch(env.launch_request("1", client_ip(10)))
        .unwrap();

    // stop immediately after creation, before any negotiation happened
    env.registry.stop(session.session_id);

    let media_events = Arc::new(AtomicUsize::new(0));
    let mut subs = Vec::new();
    for kind in [EventKind::VideoSession, EventKind::AudioSession] {
        let counter = media_events.clone();
        subs.push(env.bus.subscribe(kind, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // a late negotiator result is dropped by the session gate
    let video = moonhost_server::streaming::VideoSessionParams {
        session_id: session.session_id,
        port: session.video_port,
        display_mode: session.display_mode,
        codec: moonhost_server::config::VideoCodec::H264,
        pipeline: "x264enc".into(),
        bitrate_kbps: 10_000,
        packet_size: 1024,
        fec_percentage: 20,
        min_required_fec_packets: 2,
        slices_per_frame: 1,
        color_range: moonhost_server::streaming::ColorRange::Limited,
        color_space: moonhost_server::streaming::ColorSpace::Bt709,
    };
    env.registry
        .publish_for(Event::VideoSession(Arc::new(video)));
    assert_eq!(media_events.load(Ordering::SeqCst), 0);
}
