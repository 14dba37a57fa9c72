//! Client-facing HTTP(S) surface
//!
//! Pairing runs over plain HTTP (trust is established by the handshake
//! itself); everything session-related runs over HTTPS with the paired
//! certificate as client identity.

pub mod http;
pub mod tls;

mod xml;

pub use http::{serve_http, serve_https, Endpoints};

use std::collections::HashMap;

pub(crate) fn query_params(uri: &hyper::Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}
