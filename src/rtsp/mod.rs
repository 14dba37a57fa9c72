//! RTSP negotiator
//!
//! Speaks the Moonlight RTSP variant on the port announced by `/launch`.
//! The connection is matched to its session by client address. SETUP
//! hands out the session's stream ports, ANNOUNCE carries the client's
//! stream configuration as SDP, and PLAY turns the negotiated parameters
//! into the video and audio session events that start the pipelines.

pub mod sdp;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, VideoCodec};
use crate::error::{ProtocolError, Result, ServerError};
use crate::events::Event;
use crate::session::{DisplayMode, SessionRegistry, StreamSession};
use crate::streaming::{AudioSessionParams, VideoSessionParams};

use sdp::AnnouncedParams;

const STEREO_AUDIO_BITRATE: u32 = 96_000;
const SURROUND_AUDIO_BITRATE: u32 = 256_000;

#[derive(Debug)]
pub(crate) struct Request {
    pub method: String,
    pub uri: String,
    pub cseq: u64,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Read one RTSP request; `None` on a clean EOF between requests.
pub(crate) async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (Some(method), Some(uri)) = (parts.next(), parts.next()) else {
        return Err(ProtocolError::Rtsp(format!("bad request line: {}", line.trim())).into());
    };
    let method = method.to_owned();
    let uri = uri.to_owned();

    let mut headers = HashMap::new();
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            return Err(ProtocolError::Rtsp("unexpected EOF in headers".into()).into());
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let cseq = headers
        .get("cseq")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = String::new();
    if let Some(length) = headers.get("content-length").and_then(|v| v.parse().ok()) {
        let mut buf = vec![0u8; length];
        reader.read_exact(&mut buf).await?;
        body = String::from_utf8_lossy(&buf).into_owned();
    }

    Ok(Some(Request {
        method,
        uri,
        cseq,
        headers,
        body,
    }))
}

fn response(cseq: u64, code: u16, reason: &str, headers: &[(&str, String)], body: &str) -> String {
    let mut out = format!("RTSP/1.0 {code} {reason}\r\nCSeq: {cseq}\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    if !body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

fn error_response(cseq: u64, error: &ServerError) -> String {
    let (code, reason) = match error {
        ServerError::NotFound(_) => (454, "Session Not Found"),
        ServerError::Protocol(_) => (400, "Bad Request"),
        _ => (500, "Internal Server Error"),
    };
    response(cseq, code, reason, &[], "")
}

pub struct RtspServer {
    registry: Arc<SessionRegistry>,
    store: Arc<ConfigStore>,
    port: u16,
}

impl RtspServer {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<ConfigStore>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            port,
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = self.port, "RTSP negotiator listening");
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!(%peer, error = %e, "RTSP connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut announced: Option<AnnouncedParams> = None;
        while let Some(request) = read_request(&mut reader).await? {
            debug!(%peer, method = %request.method, cseq = request.cseq, "RTSP request");
            let reply = self.dispatch(&request, peer.ip(), &mut announced);
            write.write_all(reply.as_bytes()).await?;
        }
        Ok(())
    }

    pub(crate) fn dispatch(
        &self,
        request: &Request,
        client_ip: IpAddr,
        announced: &mut Option<AnnouncedParams>,
    ) -> String {
        let result = match request.method.as_str() {
            "OPTIONS" => Ok(response(
                request.cseq,
                200,
                "OK",
                &[("Public", "OPTIONS DESCRIBE SETUP ANNOUNCE PLAY".to_owned())],
                "",
            )),
            "DESCRIBE" => Ok(self.describe(request)),
            "SETUP" => self.setup(request, client_ip),
            "ANNOUNCE" => self.announce(request, announced),
            "PLAY" => self.play(request, client_ip, announced.as_ref()),
            other => Err(ProtocolError::Rtsp(format!("unsupported method {other}")).into()),
        };
        result.unwrap_or_else(|e| {
            warn!(%client_ip, method = %request.method, error = %e, "RTSP request failed");
            error_response(request.cseq, &e)
        })
    }

    /// Codec capabilities as SDP; Moonlight sniffs these lines to decide
    /// what it may request in ANNOUNCE.
    fn describe(&self, request: &Request) -> String {
        let snapshot = self.store.snapshot();
        let mut body = String::from("v=0\r\n");
        body.push_str(&format!("s={}\r\n", snapshot.hostname));
        body.push_str("m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n");
        if snapshot.support_hevc {
            body.push_str("sprop-parameter-sets=AAAAAU\r\n");
            body.push_str("m=video 0 RTP/AVP 97\r\na=rtpmap:97 H265/90000\r\n");
        }
        if snapshot.support_av1 {
            body.push_str("m=video 0 RTP/AVP 98\r\na=rtpmap:98 AV1/90000\r\n");
        }
        body.push_str("m=audio 0 RTP/AVP 99\r\na=rtpmap:99 OPUS/48000/2\r\n");
        response(
            request.cseq,
            200,
            "OK",
            &[("Content-Type", "application/sdp".to_owned())],
            &body,
        )
    }

    fn setup(&self, request: &Request, client_ip: IpAddr) -> Result<String> {
        let session = self.session_for(client_ip)?;
        let stream = request
            .uri
            .rsplit_once("streamid=")
            .map(|(_, s)| s.split(&['/', '?'][..]).next().unwrap_or(s))
            .ok_or_else(|| ProtocolError::Rtsp(format!("no streamid in {}", request.uri)))?;
        let server_port = match stream {
            "video" => Some(session.video_port),
            "audio" => Some(session.audio_port),
            // control runs over its own reliable channel, no UDP port here
            "control" => None,
            other => {
                return Err(ProtocolError::Rtsp(format!("unknown stream {other}")).into());
            }
        };
        let transport = match server_port {
            Some(port) => format!("server_port={port}"),
            None => request
                .headers
                .get("transport")
                .cloned()
                .unwrap_or_else(|| "unicast".to_owned()),
        };
        Ok(response(
            request.cseq,
            200,
            "OK",
            &[
                ("Session", format!("{};timeout=90", session.session_id)),
                ("Transport", transport),
            ],
            "",
        ))
    }

    fn announce(
        &self,
        request: &Request,
        announced: &mut Option<AnnouncedParams>,
    ) -> Result<String> {
        let params = sdp::parse(&request.body)?;
        debug!(?params, "stream configuration announced");
        *announced = Some(params);
        Ok(response(request.cseq, 200, "OK", &[], ""))
    }

    fn play(
        &self,
        request: &Request,
        client_ip: IpAddr,
        announced: Option<&AnnouncedParams>,
    ) -> Result<String> {
        let session = self.session_for(client_ip)?;
        let announced = announced
            .ok_or_else(|| ProtocolError::Rtsp("PLAY before ANNOUNCE".into()))?;

        let display_mode = DisplayMode {
            width: announced.width.unwrap_or(session.display_mode.width),
            height: announced.height.unwrap_or(session.display_mode.height),
            refresh_rate: announced.fps.unwrap_or(session.display_mode.refresh_rate),
        };
        let codec = self.negotiate_codec(&session, announced.video_format);
        let pipeline = session
            .app
            .video_pipeline(codec)
            .unwrap_or(&session.app.h264_pipeline)
            .to_owned();

        let video = VideoSessionParams {
            session_id: session.session_id,
            port: session.video_port,
            display_mode,
            codec,
            pipeline,
            bitrate_kbps: announced.bitrate_kbps,
            packet_size: announced.packet_size,
            fec_percentage: announced.fec_percentage,
            min_required_fec_packets: announced.min_required_fec_packets,
            slices_per_frame: announced.slices_per_frame,
            color_range: announced.color_range,
            color_space: announced.color_space,
        };
        let channels = announced.channels.unwrap_or(session.audio_channel_count);
        let audio_crypto = session.audio_crypto();
        let audio = AudioSessionParams {
            session_id: session.session_id,
            port: session.audio_port,
            pipeline: session.app.opus_pipeline.clone(),
            channels,
            bitrate: if channels > 2 {
                SURROUND_AUDIO_BITRATE
            } else {
                STEREO_AUDIO_BITRATE
            },
            packet_duration: std::time::Duration::from_millis(announced.packet_duration_ms),
            encrypted: announced.encrypted_audio,
            aes_key: audio_crypto.key,
            aes_iv: audio_crypto.iv,
        };

        info!(
            session_id = session.session_id,
            codec = %codec,
            width = display_mode.width,
            height = display_mode.height,
            fps = display_mode.refresh_rate,
            "negotiation complete, starting streams"
        );
        self.registry
            .publish_for(Event::VideoSession(Arc::new(video)));
        self.registry
            .publish_for(Event::AudioSession(Arc::new(audio)));

        Ok(response(
            request.cseq,
            200,
            "OK",
            &[("Session", format!("{};timeout=90", session.session_id))],
            "",
        ))
    }

    /// Requested codec, downgraded to what config and app both support.
    fn negotiate_codec(&self, session: &StreamSession, requested: VideoCodec) -> VideoCodec {
        let snapshot = self.store.snapshot();
        let supported = match requested {
            VideoCodec::H264 => true,
            VideoCodec::Hevc => snapshot.support_hevc,
            VideoCodec::Av1 => snapshot.support_av1,
        };
        if supported && session.app.video_pipeline(requested).is_some() {
            requested
        } else {
            warn!(
                session_id = session.session_id,
                requested = %requested,
                "codec unavailable, falling back to h264"
            );
            VideoCodec::H264
        }
    }

    fn session_for(&self, client_ip: IpAddr) -> Result<Arc<StreamSession>> {
        self.registry
            .session_for_ip(client_ip)
            .ok_or_else(|| ServerError::NotFound(format!("no session for {client_ip}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw = b"ANNOUNCE rtsp://10.0.0.2:48010 RTSP/1.0\r\n\
CSeq: 4\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 5\r\n\
\r\n\
v=0\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.method, "ANNOUNCE");
        assert_eq!(request.cseq, 4);
        assert_eq!(request.body, "v=0\r\n");
    }

    #[tokio::test]
    async fn eof_between_requests_is_clean() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_request_line_is_a_protocol_error() {
        let mut reader = BufReader::new(&b"nonsense\r\n\r\n"[..]);
        assert!(read_request(&mut reader).await.is_err());
    }

    #[test]
    fn responses_carry_cseq_and_content_length() {
        let reply = response(7, 200, "OK", &[], "abc");
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\nCSeq: 7\r\n"));
        assert!(reply.contains("Content-Length: 3\r\n"));
        assert!(reply.ends_with("\r\nabc"));
    }
}
