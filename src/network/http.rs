//! GameStream HTTP(S) endpoints
//!
//! `/pair` and `/serverinfo` answer on the plain port; `/applist`,
//! `/launch`, `/resume`, `/cancel` and `/unpair` require the paired
//! client certificate from the TLS handshake. Responses are the XML
//! bodies Moonlight expects; errors map onto the numeric status codes of
//! the protocol (401/404/503).

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use openssl::x509::X509;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, PairedClient};
use crate::error::{ProtocolError, Result, ServerError};
use crate::events::{Event, ResumeStream};
use crate::pairing::PairingManager;
use crate::session::{AudioCrypto, DisplayMode, LaunchRequest, SessionRegistry};

use super::{query_params, tls, xml};

const APP_VERSION: &str = "7.1.431.0";
const GFE_VERSION: &str = "3.23.0.74";

pub struct Endpoints {
    store: Arc<ConfigStore>,
    registry: Arc<SessionRegistry>,
    pairing: Arc<PairingManager>,
    host_ip: IpAddr,
    http_port: u16,
    https_port: u16,
    rtsp_port: u16,
}

impl Endpoints {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<SessionRegistry>,
        pairing: Arc<PairingManager>,
        host_ip: IpAddr,
        http_port: u16,
        https_port: u16,
        rtsp_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            pairing,
            host_ip,
            http_port,
            https_port,
            rtsp_port,
        })
    }

    pub async fn handle(
        &self,
        request: Request<Body>,
        peer_ip: IpAddr,
        client_cert: Option<&X509>,
    ) -> Response<Body> {
        let path = request.uri().path().to_owned();
        let params = query_params(request.uri());
        debug!(%peer_ip, %path, "request");

        let result = match path.as_str() {
            "/serverinfo" => self.serverinfo(peer_ip, client_cert),
            "/pair" => self.pair(peer_ip, &params).await,
            "/unpair" => self.unpair(client_cert),
            "/applist" => self.applist(client_cert),
            "/launch" => self.launch(peer_ip, client_cert, &params),
            "/resume" => self.resume(peer_ip, client_cert, &params),
            "/cancel" => self.cancel(peer_ip, client_cert),
            _ => Err(ServerError::NotFound(format!("no route {path}"))),
        };

        match result {
            Ok(body) => xml_response(200, body),
            Err(e) => {
                warn!(%peer_ip, %path, error = %e, "request failed");
                let status = e.http_status();
                xml_response(status, xml::root_error(status, &e.to_string()))
            }
        }
    }

    fn serverinfo(&self, peer_ip: IpAddr, client_cert: Option<&X509>) -> Result<String> {
        let snapshot = self.store.snapshot();
        let paired = client_cert
            .and_then(|cert| snapshot.get_client_via_ssl(cert))
            .is_some();
        let current_game = self
            .registry
            .session_for_ip(peer_ip)
            .map(|s| s.session_id)
            .unwrap_or(0);
        let mut codec_modes: u32 = 0x1;
        if snapshot.support_hevc {
            codec_modes |= 0x100;
        }
        if snapshot.support_av1 {
            codec_modes |= 0x10000;
        }
        let state = if self.registry.active_count() > 0 {
            "MOONHOST_SERVERINFO_BUSY"
        } else {
            "MOONHOST_SERVERINFO_FREE"
        };
        Ok(xml::root(
            200,
            &[
                ("hostname", snapshot.hostname.clone()),
                ("appversion", APP_VERSION.to_owned()),
                ("GfeVersion", GFE_VERSION.to_owned()),
                ("uniqueid", snapshot.uuid.clone()),
                ("HttpsPort", self.https_port.to_string()),
                ("ExternalPort", self.http_port.to_string()),
                (
                    "MaxLumaPixelsHEVC",
                    if snapshot.support_hevc {
                        "1869449984".to_owned()
                    } else {
                        "0".to_owned()
                    },
                ),
                ("ServerCodecModeSupport", codec_modes.to_string()),
                ("PairStatus", u8::from(paired).to_string()),
                ("currentgame", current_game.to_string()),
                ("state", state.to_owned()),
            ],
        ))
    }

    async fn pair(&self, peer_ip: IpAddr, params: &HashMap<String, String>) -> Result<String> {
        let phase = need(params, "phase")?;
        let outcome = match phase {
            "getservercert" => {
                let salt = need(params, "salt")?;
                let client_cert = need(params, "clientcert")?;
                self.pairing
                    .server_cert(peer_ip, salt, client_cert)
                    .await
                    .map(|plaincert| {
                        xml::root(
                            200,
                            &[("paired", "1".to_owned()), ("plaincert", plaincert)],
                        )
                    })
            }
            "clientchallenge" => {
                let challenge = need(params, "clientchallenge")?;
                self.pairing
                    .client_challenge(peer_ip, challenge)
                    .await
                    .map(|response| {
                        xml::root(
                            200,
                            &[
                                ("paired", "1".to_owned()),
                                ("challengeresponse", response),
                            ],
                        )
                    })
            }
            "serverchallengeresp" => {
                let response = need(params, "serverchallengeresp")?;
                self.pairing
                    .server_challenge_resp(peer_ip, response)
                    .await
                    .map(|secret| {
                        xml::root(
                            200,
                            &[("paired", "1".to_owned()), ("pairingsecret", secret)],
                        )
                    })
            }
            "clientpairingsecret" => {
                let secret = need(params, "clientpairingsecret")?;
                self.pairing
                    .client_pairing_secret(peer_ip, secret)
                    .await
                    .map(|paired| {
                        xml::root(200, &[("paired", if paired { "1" } else { "0" }.to_owned())])
                    })
            }
            other => Err(ServerError::Protocol(ProtocolError::Malformed(format!(
                "unknown pair phase {other}"
            )))),
        };

        // handshake failures are user-visible as paired=0, not transport
        // errors; malformed requests still surface as errors
        match outcome {
            Ok(body) => Ok(body),
            Err(ServerError::Pairing(e)) => {
                warn!(%peer_ip, error = %e, "pairing attempt failed");
                Ok(xml::root(200, &[("paired", "0".to_owned())]))
            }
            Err(e) => Err(e),
        }
    }

    fn unpair(&self, client_cert: Option<&X509>) -> Result<String> {
        let cert = require_cert(client_cert)?;
        self.store.unpair(cert)?;
        Ok(xml::root(200, &[("unpair", "1".to_owned())]))
    }

    fn applist(&self, client_cert: Option<&X509>) -> Result<String> {
        self.authorize(client_cert)?;
        let snapshot = self.store.snapshot();
        Ok(xml::app_list(snapshot.apps()))
    }

    fn launch(
        &self,
        peer_ip: IpAddr,
        client_cert: Option<&X509>,
        params: &HashMap<String, String>,
    ) -> Result<String> {
        let cert = require_cert(client_cert)?;
        let app_id = need(params, "appid")?.to_owned();
        let display_mode = parse_mode(params.get("mode").map(String::as_str))?;
        let audio_channel_count = parse_channel_count(params);
        let aes_key = parse_rikey(params)?;
        let aes_iv = parse_rikeyid(params)?;

        let session = self.registry.launch(LaunchRequest {
            app_id,
            client_cert: cert.clone(),
            client_ip: peer_ip,
            display_mode,
            audio_channel_count,
            aes_key,
            aes_iv,
        })?;
        Ok(xml::root(
            200,
            &[
                ("gamesession", session.session_id.to_string()),
                ("sessionUrl0", self.rtsp_url()),
            ],
        ))
    }

    fn resume(
        &self,
        peer_ip: IpAddr,
        client_cert: Option<&X509>,
        params: &HashMap<String, String>,
    ) -> Result<String> {
        self.authorize(client_cert)?;
        let session = self
            .registry
            .session_for_ip(peer_ip)
            .ok_or_else(|| ServerError::NotFound(format!("no active session for {peer_ip}")))?;

        if let (Some(key), Some(iv)) = (parse_rikey(params)?, parse_rikeyid(params)?) {
            session.set_audio_crypto(AudioCrypto { key, iv });
        }
        self.registry.publish_for(Event::ResumeStream(ResumeStream {
            session_id: session.session_id,
        }));
        Ok(xml::root(
            200,
            &[
                ("resume", "1".to_owned()),
                ("sessionUrl0", self.rtsp_url()),
            ],
        ))
    }

    fn cancel(&self, peer_ip: IpAddr, client_cert: Option<&X509>) -> Result<String> {
        self.authorize(client_cert)?;
        let session = self
            .registry
            .session_for_ip(peer_ip)
            .ok_or_else(|| ServerError::NotFound(format!("no active session for {peer_ip}")))?;
        self.registry.stop(session.session_id);
        Ok(xml::root(200, &[("cancel", "1".to_owned())]))
    }

    fn authorize(&self, client_cert: Option<&X509>) -> Result<Arc<PairedClient>> {
        let cert = require_cert(client_cert)?;
        self.store
            .get_client_via_ssl(cert)
            .ok_or_else(|| ServerError::Unauthorized("certificate is not paired".into()))
    }

    fn rtsp_url(&self) -> String {
        format!("rtsp://{}:{}", self.host_ip, self.rtsp_port)
    }
}

fn require_cert(client_cert: Option<&X509>) -> Result<&X509> {
    client_cert.ok_or_else(|| ServerError::Unauthorized("client certificate required".into()))
}

fn need<'a>(params: &'a HashMap<String, String>, key: &'static str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ProtocolError::MissingParam(key).into())
}

/// `mode=1920x1080x60`
fn parse_mode(mode: Option<&str>) -> Result<DisplayMode> {
    let Some(mode) = mode else {
        return Ok(DisplayMode {
            width: 1920,
            height: 1080,
            refresh_rate: 60,
        });
    };
    let parts: Vec<u32> = mode.split('x').filter_map(|p| p.parse().ok()).collect();
    match parts.as_slice() {
        [width, height, refresh_rate] => Ok(DisplayMode {
            width: *width,
            height: *height,
            refresh_rate: *refresh_rate,
        }),
        _ => Err(ProtocolError::Malformed(format!("bad mode {mode}")).into()),
    }
}

/// Channel count is the low 16 bits of `surroundAudioInfo`.
fn parse_channel_count(params: &HashMap<String, String>) -> u8 {
    params
        .get("surroundAudioInfo")
        .and_then(|v| v.parse::<u32>().ok())
        .map(|info| (info & 0xFFFF).min(8) as u8)
        .unwrap_or(2)
}

fn parse_rikey(params: &HashMap<String, String>) -> Result<Option<[u8; 16]>> {
    let Some(rikey) = params.get("rikey") else {
        return Ok(None);
    };
    let bytes = hex::decode(rikey).map_err(|_| ProtocolError::BadHex("rikey"))?;
    let key: [u8; 16] = bytes
        .try_into()
        .map_err(|_| ProtocolError::BadHex("rikey"))?;
    Ok(Some(key))
}

/// `rikeyid` is a 32-bit integer seeding the front of the IV.
fn parse_rikeyid(params: &HashMap<String, String>) -> Result<Option<[u8; 16]>> {
    let Some(rikeyid) = params.get("rikeyid") else {
        return Ok(None);
    };
    let id: i64 = rikeyid
        .parse()
        .map_err(|_| ProtocolError::BadHex("rikeyid"))?;
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&(id as u32).to_be_bytes());
    Ok(Some(iv))
}

fn xml_response(status: u16, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = hyper::StatusCode::from_u16(status)
        .unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/xml"),
    );
    response
}

/// Plain HTTP endpoint (pairing and discovery-level serverinfo).
pub async fn serve_http(endpoints: Arc<Endpoints>, port: u16) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!(port, "HTTP endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let endpoints = endpoints.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let endpoints = endpoints.clone();
                async move {
                    Ok::<_, Infallible>(endpoints.handle(request, peer.ip(), None).await)
                }
            });
            if let Err(e) = Http::new().serve_connection(stream, service).await {
                debug!(%peer, error = %e, "http connection error");
            }
        });
    }
}

/// Mutual-TLS endpoint; the peer certificate (when presented) is handed
/// to every request handler.
pub async fn serve_https(
    endpoints: Arc<Endpoints>,
    port: u16,
    acceptor: TlsAcceptor,
) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!(port, "HTTPS endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let endpoints = endpoints.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(%peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            let client_cert = tls::peer_certificate(&tls_stream);
            let service = service_fn(move |request| {
                let endpoints = endpoints.clone();
                let client_cert = client_cert.clone();
                async move {
                    Ok::<_, Infallible>(
                        endpoints
                            .handle(request, peer.ip(), client_cert.as_ref())
                            .await,
                    )
                }
            });
            if let Err(e) = Http::new().serve_connection(tls_stream, service).await {
                debug!(%peer, error = %e, "https connection error");
            }
        });
    }
}
