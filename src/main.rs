use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use moonhost_server::config::ConfigStore;
use moonhost_server::display::{DisabledDisplayFactory, DisplayService};
use moonhost_server::events::{Event, EventBus, EventKind};
use moonhost_server::input::{DisabledDeviceFactory, InputService};
use moonhost_server::network::{self, Endpoints};
use moonhost_server::pairing::PairingManager;
use moonhost_server::rtsp::RtspServer;
use moonhost_server::runner::RunnerService;
use moonhost_server::session::SessionRegistry;
use moonhost_server::streaming::{ControlService, PipelineFactory, StreamService};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn pipeline_factory() -> Arc<dyn PipelineFactory> {
    #[cfg(feature = "gstreamer")]
    {
        match moonhost_server::streaming::gst::GstPipelineFactory::init() {
            Ok(factory) => return Arc::new(factory),
            Err(e) => warn!(error = %e, "gstreamer unavailable, media pipelines disabled"),
        }
    }
    Arc::new(moonhost_server::streaming::NullPipelineFactory)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenv::dotenv().ok();

    let state_file = env_or("MOONHOST_STATE_FILE", PathBuf::from("moonhost.json"));
    let host_ip = env_or("MOONHOST_HOST_IP", IpAddr::from([127, 0, 0, 1]));
    let http_port: u16 = env_or("MOONHOST_HTTP_PORT", 47989);
    let https_port: u16 = env_or("MOONHOST_HTTPS_PORT", 47984);
    let rtsp_port: u16 = env_or("MOONHOST_RTSP_PORT", 48010);
    let stream_port_first: u16 = env_or("MOONHOST_STREAM_PORT_FIRST", 48100);
    let stream_port_count: u16 = env_or("MOONHOST_STREAM_PORT_COUNT", 100);

    info!(state_file = %state_file.display(), "starting moonhost server");

    let store = Arc::new(ConfigStore::load_or_default(&state_file)?);
    let bus = Arc::new(EventBus::new());

    // Registration order matters: the registry subscribes first so its
    // entry drop precedes every other stop handler.
    let registry = SessionRegistry::new(
        bus.clone(),
        store.clone(),
        stream_port_first..stream_port_first.saturating_add(stream_port_count),
    );
    let _input = InputService::spawn(&bus, Arc::new(DisabledDeviceFactory));
    let _display = DisplayService::spawn(&bus, Arc::new(DisabledDisplayFactory));
    let _streams = StreamService::spawn(&bus, pipeline_factory());
    let _control = ControlService::spawn(&bus, registry.clone());
    let _runner = RunnerService::spawn(&bus, registry.clone());

    // Fixed-PIN acceptance for headless setups; interactive front-ends
    // subscribe to the same signal instead.
    let _pin_sub = bus.subscribe(EventKind::PairSignal, |event| {
        if let Event::PairSignal(signal) = event {
            match std::env::var("MOONHOST_PAIR_PIN") {
                Ok(pin) => {
                    signal.fulfill(pin);
                }
                Err(_) => warn!(
                    client_ip = %signal.client_ip,
                    "pairing requested; set MOONHOST_PAIR_PIN to accept headlessly"
                ),
            }
        }
    });

    let data_dir = state_file
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let pairing = PairingManager::new(
        bus.clone(),
        store.clone(),
        host_ip,
        data_dir.join("clients"),
    );
    pairing.spawn_expirer();

    let endpoints = Endpoints::new(
        store.clone(),
        registry.clone(),
        pairing,
        host_ip,
        http_port,
        https_port,
        rtsp_port,
    );
    let acceptor = network::tls::build_acceptor(&store.snapshot().identity)?;

    {
        let endpoints = endpoints.clone();
        tokio::spawn(async move {
            if let Err(e) = network::serve_http(endpoints, http_port).await {
                error!(error = %e, "HTTP endpoint terminated");
            }
        });
    }
    {
        let endpoints = endpoints.clone();
        tokio::spawn(async move {
            if let Err(e) = network::serve_https(endpoints, https_port, acceptor).await {
                error!(error = %e, "HTTPS endpoint terminated");
            }
        });
    }
    {
        let rtsp = RtspServer::new(registry.clone(), store.clone(), rtsp_port);
        tokio::spawn(async move {
            if let Err(e) = rtsp.run().await {
                error!(error = %e, "RTSP negotiator terminated");
            }
        });
    }

    info!("server ready");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.stop_all();

    Ok(())
}
