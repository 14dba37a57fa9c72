//! moonhost-server library
//!
//! Session-and-streaming core of a self-hosted, Moonlight-compatible
//! game streaming host: pairing, session lifecycle, RTSP negotiation,
//! media sub-sessions and application runners.

pub mod config;
pub mod crypto;
pub mod display;
pub mod error;
pub mod events;
pub mod input;
pub mod network;
pub mod pairing;
pub mod rtsp;
pub mod runner;
pub mod session;
pub mod streaming;
