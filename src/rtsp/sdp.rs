//! SDP attribute parsing for the ANNOUNCE phase
//!
//! Moonlight carries its stream configuration as `a=x-nv-…` attributes.
//! Unknown attributes are ignored; missing ones fall back to protocol
//! defaults so older clients keep working.

use std::collections::HashMap;

use crate::config::VideoCodec;
use crate::error::{ProtocolError, Result};
use crate::streaming::{ColorRange, ColorSpace};

/// Audio encryption bit in `x-nv-general.featureFlags`.
const FF_AUDIO_ENCRYPTION: u32 = 0x20;

#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncedParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub bitrate_kbps: u32,
    pub packet_size: u32,
    pub fec_percentage: u8,
    pub min_required_fec_packets: u32,
    pub slices_per_frame: u8,
    pub channels: Option<u8>,
    pub packet_duration_ms: u64,
    pub encrypted_audio: bool,
    pub video_format: VideoCodec,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
}

impl Default for AnnouncedParams {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            fps: None,
            bitrate_kbps: 10_000,
            packet_size: 1024,
            fec_percentage: 20,
            min_required_fec_packets: 2,
            slices_per_frame: 1,
            channels: None,
            packet_duration_ms: 5,
            encrypted_audio: false,
            video_format: VideoCodec::H264,
            color_range: ColorRange::Limited,
            color_space: ColorSpace::Bt709,
        }
    }
}

/// Parse the attribute lines of an ANNOUNCE body.
pub fn parse(body: &str) -> Result<AnnouncedParams> {
    if body.trim().is_empty() {
        return Err(ProtocolError::Sdp("empty ANNOUNCE body".into()).into());
    }

    let mut attrs: HashMap<&str, &str> = HashMap::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };
        if let Some((key, value)) = attr.split_once(':') {
            attrs.insert(key.trim(), value.trim());
        }
    }

    let mut params = AnnouncedParams::default();
    params.width = parse_attr(&attrs, "x-nv-video[0].clientViewportWd");
    params.height = parse_attr(&attrs, "x-nv-video[0].clientViewportHt");
    params.fps = parse_attr(&attrs, "x-nv-video[0].maxFPS");
    if let Some(bitrate) = parse_attr(&attrs, "x-nv-vqos[0].bw.maximumBitrateKbps") {
        params.bitrate_kbps = bitrate;
    }
    if let Some(size) = parse_attr(&attrs, "x-nv-video[0].packetSize") {
        params.packet_size = size;
    }
    if let Some(percent) = parse_attr(&attrs, "x-nv-vqos[0].fec.repairPercent") {
        params.fec_percentage = percent;
    }
    if let Some(min) = parse_attr(&attrs, "x-nv-vqos[0].fec.minRequiredFecPackets") {
        params.min_required_fec_packets = min;
    }
    if let Some(slices) = parse_attr(&attrs, "x-nv-video[0].videoEncoderSlicesPerFrame") {
        params.slices_per_frame = slices;
    }
    params.channels = parse_attr(&attrs, "x-nv-audio.surround.numChannels");
    if let Some(duration) = parse_attr(&attrs, "x-nv-aqos.packetDuration") {
        params.packet_duration_ms = duration;
    }
    if let Some(flags) = parse_attr::<u32>(&attrs, "x-nv-general.featureFlags") {
        params.encrypted_audio = flags & FF_AUDIO_ENCRYPTION != 0;
    }
    if let Some(format) = parse_attr::<u8>(&attrs, "x-nv-vqos[0].bitStreamFormat") {
        params.video_format = match format {
            0 => VideoCodec::H264,
            1 => VideoCodec::Hevc,
            2 => VideoCodec::Av1,
            other => {
                return Err(ProtocolError::Sdp(format!("unknown bitstream format {other}")).into())
            }
        };
    }
    if let Some(csc) = parse_attr::<u32>(&attrs, "x-nv-video[0].encoderCscMode") {
        params.color_range = if csc & 0x1 != 0 {
            ColorRange::Full
        } else {
            ColorRange::Limited
        };
        params.color_space = match csc >> 1 {
            0 => ColorSpace::Bt601,
            1 => ColorSpace::Bt709,
            _ => ColorSpace::Bt2020,
        };
    }
    Ok(params)
}

fn parse_attr<T: std::str::FromStr>(attrs: &HashMap<&str, &str>, key: &str) -> Option<T> {
    attrs.get(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOUNCE: &str = "\
v=0\r
o=android 0 14 IN IPv4 192.168.1.50\r
s=NVIDIA Streaming Client\r
a=x-nv-video[0].clientViewportWd:1920\r
a=x-nv-video[0].clientViewportHt:1080\r
a=x-nv-video[0].maxFPS:60\r
a=x-nv-video[0].packetSize:1392\r
a=x-nv-vqos[0].bw.maximumBitrateKbps:20000\r
a=x-nv-vqos[0].fec.repairPercent:25\r
a=x-nv-vqos[0].bitStreamFormat:1\r
a=x-nv-video[0].encoderCscMode:3\r
a=x-nv-audio.surround.numChannels:6\r
a=x-nv-aqos.packetDuration:10\r
a=x-nv-general.featureFlags:33\r
";

    #[test]
    fn parses_announce_attributes() {
        let params = parse(ANNOUNCE).unwrap();
        assert_eq!(params.width, Some(1920));
        assert_eq!(params.height, Some(1080));
        assert_eq!(params.fps, Some(60));
        assert_eq!(params.packet_size, 1392);
        assert_eq!(params.bitrate_kbps, 20_000);
        assert_eq!(params.fec_percentage, 25);
        assert_eq!(params.video_format, VideoCodec::Hevc);
        assert_eq!(params.color_range, ColorRange::Full);
        assert_eq!(params.color_space, ColorSpace::Bt709);
        assert_eq!(params.channels, Some(6));
        assert_eq!(params.packet_duration_ms, 10);
        assert!(params.encrypted_audio);
    }

    #[test]
    fn missing_attributes_use_defaults() {
        let params = parse("v=0\r\ns=minimal\r\n").unwrap();
        assert_eq!(params, AnnouncedParams::default());
    }

    #[test]
    fn empty_body_is_a_protocol_error() {
        assert!(parse("  ").is_err());
    }

    #[test]
    fn unknown_bitstream_format_is_rejected() {
        let body = "a=x-nv-vqos[0].bitStreamFormat:9\r\n";
        assert!(parse(body).is_err());
    }
}
