//! Media sub-sessions
//!
//! The RTSP negotiator publishes [`VideoSessionParams`] and
//! [`AudioSessionParams`] once parameter exchange completes; this module
//! reacts by starting pipelines through the [`PipelineFactory`]
//! capability, coalesces IDR requests to one per frame interval, stops
//! pipelines on pause while retaining the negotiated parameters, and
//! replays those parameters bit-exactly on resume.

pub mod control;
#[cfg(feature = "gstreamer")]
pub mod gst;

pub use control::ControlService;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::VideoCodec;
use crate::error::Result;
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::runner::STOP_GRACE;
use crate::session::DisplayMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    Limited,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Bt601,
    Bt709,
    Bt2020,
}

/// Everything the media engine needs to produce the video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSessionParams {
    pub session_id: u64,
    pub port: u16,
    pub display_mode: DisplayMode,
    pub codec: VideoCodec,
    pub pipeline: String,
    pub bitrate_kbps: u32,
    pub packet_size: u32,
    pub fec_percentage: u8,
    pub min_required_fec_packets: u32,
    pub slices_per_frame: u8,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
}

/// Everything the media engine needs to produce the audio stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSessionParams {
    pub session_id: u64,
    pub port: u16,
    pub pipeline: String,
    pub channels: u8,
    pub bitrate: u32,
    pub packet_duration: Duration,
    pub encrypted: bool,
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
}

/// A running pipeline owned by the media engine.
pub trait MediaPipeline: Send + Sync {
    /// Produce an intra-coded frame at the next frame boundary.
    fn request_idr(&self);
    fn stop(&self);
}

/// Media engine capability: turns negotiated parameters into running
/// pipelines.
pub trait PipelineFactory: Send + Sync {
    fn start_video(&self, params: &VideoSessionParams) -> Result<Box<dyn MediaPipeline>>;
    fn start_audio(&self, params: &AudioSessionParams) -> Result<Box<dyn MediaPipeline>>;
}

/// Stand-in engine that only logs; used when no media backend is linked.
pub struct NullPipelineFactory;

struct NullPipeline;

impl MediaPipeline for NullPipeline {
    fn request_idr(&self) {}
    fn stop(&self) {}
}

impl PipelineFactory for NullPipelineFactory {
    fn start_video(&self, params: &VideoSessionParams) -> Result<Box<dyn MediaPipeline>> {
        info!(
            session_id = params.session_id,
            codec = %params.codec,
            "no media engine, video pipeline is a no-op"
        );
        Ok(Box::new(NullPipeline))
    }

    fn start_audio(&self, params: &AudioSessionParams) -> Result<Box<dyn MediaPipeline>> {
        info!(
            session_id = params.session_id,
            "no media engine, audio pipeline is a no-op"
        );
        Ok(Box::new(NullPipeline))
    }
}

struct SessionMedia {
    video: Option<Box<dyn MediaPipeline>>,
    audio: Option<Box<dyn MediaPipeline>>,
    last_video: Option<Arc<VideoSessionParams>>,
    last_audio: Option<Arc<AudioSessionParams>>,
    last_idr: Option<Instant>,
    frame_interval: Duration,
}

impl SessionMedia {
    fn new(frame_interval: Duration) -> Self {
        Self {
            video: None,
            audio: None,
            last_video: None,
            last_audio: None,
            last_idr: None,
            frame_interval,
        }
    }
}

/// Drives pipeline lifecycle off the bus.
pub struct StreamService {
    factory: Arc<dyn PipelineFactory>,
    media: Mutex<HashMap<u64, SessionMedia>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl StreamService {
    pub fn spawn(bus: &EventBus, factory: Arc<dyn PipelineFactory>) -> Arc<Self> {
        let service = Arc::new(Self {
            factory,
            media: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let kinds = [
            EventKind::StreamSession,
            EventKind::VideoSession,
            EventKind::AudioSession,
            EventKind::IdrRequest,
            EventKind::PauseStream,
            EventKind::ResumeStream,
            EventKind::StopStream,
        ];
        let mut subs = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let service_ = service.clone();
            subs.push(bus.subscribe(kind, move |event| service_.handle(event)));
        }
        service.subscriptions.lock().extend(subs);
        service
    }

    fn handle(&self, event: &Event) {
        match event {
            Event::StreamSession(session) => {
                self.media.lock().insert(
                    session.session_id,
                    SessionMedia::new(session.frame_interval()),
                );
            }
            Event::VideoSession(params) => self.start_video(params.clone()),
            Event::AudioSession(params) => self.start_audio(params.clone()),
            Event::IdrRequest(request) => self.request_idr(request.session_id),
            Event::PauseStream(pause) => self.pause(pause.session_id),
            Event::ResumeStream(resume) => self.resume(resume.session_id),
            Event::StopStream(stop) => self.stop(stop.session_id),
            _ => {}
        }
    }

    fn start_video(&self, params: Arc<VideoSessionParams>) {
        let mut media = self.media.lock();
        let entry = media
            .entry(params.session_id)
            .or_insert_with(|| SessionMedia::new(params.display_mode.frame_interval()));
        entry.frame_interval = params.display_mode.frame_interval();
        if let Some(old) = entry.video.take() {
            release_with_grace("video", old);
        }
        match self.factory.start_video(&params) {
            Ok(pipeline) => {
                info!(session_id = params.session_id, codec = %params.codec, "video pipeline started");
                entry.video = Some(pipeline);
            }
            Err(e) => warn!(session_id = params.session_id, error = %e, "video pipeline failed"),
        }
        entry.last_video = Some(params);
    }

    fn start_audio(&self, params: Arc<AudioSessionParams>) {
        let mut media = self.media.lock();
        let entry = media
            .entry(params.session_id)
            .or_insert_with(|| SessionMedia::new(Duration::from_millis(16)));
        if let Some(old) = entry.audio.take() {
            release_with_grace("audio", old);
        }
        match self.factory.start_audio(&params) {
            Ok(pipeline) => {
                info!(session_id = params.session_id, "audio pipeline started");
                entry.audio = Some(pipeline);
            }
            Err(e) => warn!(session_id = params.session_id, error = %e, "audio pipeline failed"),
        }
        entry.last_audio = Some(params);
    }

    /// At most one intra-frame request per frame interval; duplicates
    /// inside the window are absorbed.
    fn request_idr(&self, session_id: u64) {
        let mut media = self.media.lock();
        let Some(entry) = media.get_mut(&session_id) else {
            return;
        };
        let now = Instant::now();
        let due = entry
            .last_idr
            .map_or(true, |last| now.duration_since(last) >= entry.frame_interval);
        if !due {
            debug!(session_id, "IDR request coalesced");
            return;
        }
        if let Some(video) = &entry.video {
            video.request_idr();
            entry.last_idr = Some(now);
            debug!(session_id, "IDR requested");
        }
    }

    fn pause(&self, session_id: u64) {
        let mut media = self.media.lock();
        let Some(entry) = media.get_mut(&session_id) else {
            return;
        };
        if let Some(video) = entry.video.take() {
            release_with_grace("video", video);
        }
        if let Some(audio) = entry.audio.take() {
            release_with_grace("audio", audio);
        }
        info!(session_id, "stream paused, parameters retained");
    }

    fn resume(&self, session_id: u64) {
        let (video_params, audio_params) = {
            let media = self.media.lock();
            let Some(entry) = media.get(&session_id) else {
                return;
            };
            (entry.last_video.clone(), entry.last_audio.clone())
        };
        info!(session_id, "resuming with last negotiated parameters");
        if let Some(params) = video_params {
            self.start_video(params);
        }
        if let Some(params) = audio_params {
            self.start_audio(params);
        }
    }

    fn stop(&self, session_id: u64) {
        let Some(entry) = self.media.lock().remove(&session_id) else {
            return;
        };
        if let Some(video) = entry.video {
            release_with_grace("video", video);
        }
        if let Some(audio) = entry.audio {
            release_with_grace("audio", audio);
        }
        info!(session_id, "media released");
    }

    /// Parameters a resume would replay, for diagnostics.
    pub fn last_video_params(&self, session_id: u64) -> Option<Arc<VideoSessionParams>> {
        self.media
            .lock()
            .get(&session_id)
            .and_then(|m| m.last_video.clone())
    }

    pub fn last_audio_params(&self, session_id: u64) -> Option<Arc<AudioSessionParams>> {
        self.media
            .lock()
            .get(&session_id)
            .and_then(|m| m.last_audio.clone())
    }
}

/// Ask the pipeline to stop, but never wait past the grace period: when
/// the engine hangs we abandon the stop call and drop our handle.
fn release_with_grace(kind: &'static str, pipeline: Box<dyn MediaPipeline>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let stop = tokio::task::spawn_blocking(move || pipeline.stop());
                if tokio::time::timeout(STOP_GRACE, stop).await.is_err() {
                    warn!(kind, "pipeline ignored stop within grace period, releasing");
                }
            });
        }
        Err(_) => pipeline.stop(),
    }
}
