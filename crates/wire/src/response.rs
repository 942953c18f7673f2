//! Serializable form of an HTTP response (only the fields worth carrying).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::CLIENT_ERROR_CODE;

/// Response metadata sent as the text frame ahead of the body frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunneledResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub header: HashMap<String, Vec<String>>,
    #[serde(rename = "contentLength")]
    pub content_length: i64,
}

impl TunneledResponse {
    pub fn new(status_code: u16, header: HashMap<String, Vec<String>>, content_length: i64) -> Self {
        Self {
            status_code,
            header,
            content_length,
        }
    }

    /// Response an agent sends when executing the request failed locally.
    ///
    /// The body frame that follows carries the error text.
    pub fn client_error(body_len: i64) -> Self {
        Self {
            status_code: CLIENT_ERROR_CODE,
            header: HashMap::new(),
            content_length: body_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let resp = TunneledResponse::new(200, HashMap::new(), 4);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["statusCode"], 200);
        assert_eq!(value["contentLength"], 4);
    }

    #[test]
    fn client_error_uses_the_reserved_code() {
        let resp = TunneledResponse::client_error(11);
        assert_eq!(resp.status_code, 527);
        assert_eq!(resp.content_length, 11);
        assert!(resp.header.is_empty());
    }

    #[test]
    fn parses_multi_value_headers() {
        let json = r#"{"statusCode":204,"header":{"Set-Cookie":["a=1","b=2"]},"contentLength":0}"#;
        let resp: TunneledResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status_code, 204);
        assert_eq!(resp.header["Set-Cookie"].len(), 2);
    }
}
