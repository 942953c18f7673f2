//! Serializable form of an HTTP request (only the fields the far side needs).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request metadata sent as the text frame ahead of the body frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunneledRequest {
    pub method: String,
    pub url: String,
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "contentLength")]
    pub content_length: i64,
    #[serde(default, rename = "remoteAddr")]
    pub remote_addr: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub proto: String,
    #[serde(default, rename = "requestUri")]
    pub request_uri: String,
}

impl TunneledRequest {
    /// Build the wire form from request parts the server extracted.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: &http::Method,
        url: String,
        headers: &http::HeaderMap,
        content_length: i64,
        remote_addr: String,
        host: String,
        proto: String,
        request_uri: String,
    ) -> Self {
        Self {
            method: method.as_str().to_string(),
            url,
            header: crate::headers_to_wire(headers),
            content_length,
            remote_addr,
            host,
            proto,
            request_uri,
        }
    }
}
