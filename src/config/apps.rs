//! Launchable application catalog
//!
//! Apps are immutable after load; the config store hands out shared
//! references to them. Pipeline descriptions are opaque strings consumed
//! by the media engine.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runner::Runner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::Hevc => write!(f, "hevc"),
            VideoCodec::Av1 => write!(f, "av1"),
        }
    }
}

/// Flavor of virtual joypad exposed to the app for this title.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoypadType {
    #[default]
    Auto,
    Xbox,
    Nintendo,
    Ps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub support_hdr: bool,
    pub h264_pipeline: String,
    #[serde(default)]
    pub hevc_pipeline: Option<String>,
    #[serde(default)]
    pub av1_pipeline: Option<String>,
    pub opus_pipeline: String,
    #[serde(default = "default_render_node")]
    pub render_node: PathBuf,
    #[serde(default)]
    pub start_virtual_compositor: bool,
    #[serde(default)]
    pub joypad_type: JoypadType,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub runner: Runner,
}

fn default_render_node() -> PathBuf {
    PathBuf::from("/dev/dri/renderD128")
}

impl App {
    /// Pipeline description for `codec`, if this app provides one.
    pub fn video_pipeline(&self, codec: VideoCodec) -> Option<&str> {
        match codec {
            VideoCodec::H264 => Some(self.h264_pipeline.as_str()),
            VideoCodec::Hevc => self.hevc_pipeline.as_deref(),
            VideoCodec::Av1 => self.av1_pipeline.as_deref(),
        }
    }
}
