//! GStreamer-backed media engine
//!
//! Pipeline descriptions from the app catalog are gst-launch syntax with
//! `{width}`-style placeholders filled from the negotiated parameters.

use gstreamer as gst;
use gstreamer::prelude::*;

use tracing::{debug, info};

use crate::error::{Result, ServerError};

use super::{AudioSessionParams, MediaPipeline, PipelineFactory, VideoSessionParams};

pub struct GstPipelineFactory;

impl GstPipelineFactory {
    pub fn init() -> Result<Self> {
        gst::init().map_err(|e| ServerError::Transient(format!("gstreamer init: {e}")))?;
        info!("gstreamer media engine initialized");
        Ok(Self)
    }
}

struct GstPipeline {
    element: gst::Element,
}

impl MediaPipeline for GstPipeline {
    fn request_idr(&self) {
        let structure = gst::Structure::builder("GstForceKeyUnit")
            .field("all-headers", true)
            .build();
        self.element
            .send_event(gst::event::CustomDownstream::new(structure));
    }

    fn stop(&self) {
        let _ = self.element.set_state(gst::State::Null);
    }
}

fn launch(description: &str) -> Result<Box<dyn MediaPipeline>> {
    debug!(%description, "starting pipeline");
    let element = gst::parse::launch(description)
        .map_err(|e| ServerError::Transient(format!("pipeline parse: {e}")))?;
    element
        .set_state(gst::State::Playing)
        .map_err(|e| ServerError::Transient(format!("pipeline start: {e}")))?;
    Ok(Box::new(GstPipeline { element }))
}

impl PipelineFactory for GstPipelineFactory {
    fn start_video(&self, params: &VideoSessionParams) -> Result<Box<dyn MediaPipeline>> {
        let description = params
            .pipeline
            .replace("{width}", &params.display_mode.width.to_string())
            .replace("{height}", &params.display_mode.height.to_string())
            .replace("{fps}", &params.display_mode.refresh_rate.to_string())
            .replace("{bitrate}", &params.bitrate_kbps.to_string())
            .replace("{port}", &params.port.to_string());
        launch(&description)
    }

    fn start_audio(&self, params: &AudioSessionParams) -> Result<Box<dyn MediaPipeline>> {
        let description = params
            .pipeline
            .replace("{channels}", &params.channels.to_string())
            .replace("{bitrate}", &params.bitrate.to_string())
            .replace("{port}", &params.port.to_string());
        launch(&description)
    }
}
