// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Frame encodings negotiated with the browser agent
//!
//! Agents that open the socket with the `base64` subprotocol (the websockify
//! convention) wrap every JSON document in base64 text. Everyone else gets
//! plain JSON text frames.

use crate::messages::RpcRequest;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;

/// Subprotocol name offered by browser agents that base64-wrap their frames
pub const BASE64_SUBPROTOCOL: &str = "base64";

#[derive(Error, Debug)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireEncoding {
    #[default]
    Json,
    Base64,
}

impl WireEncoding {
    /// Pick an encoding from the `Sec-WebSocket-Protocol` values a client offered.
    ///
    /// Each item may itself be a comma separated list, as browsers send it.
    pub fn negotiate<'a, I>(offered: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wants_base64 = offered
            .into_iter()
            .flat_map(|header| header.split(','))
            .any(|proto| proto.trim().eq_ignore_ascii_case(BASE64_SUBPROTOCOL));
        if wants_base64 {
            WireEncoding::Base64
        } else {
            WireEncoding::Json
        }
    }

    /// Subprotocol to echo back in the handshake response
    pub fn subprotocol(&self) -> Option<&'static str> {
        match self {
            WireEncoding::Json => None,
            WireEncoding::Base64 => Some(BASE64_SUBPROTOCOL),
        }
    }

    pub fn encode_request(&self, request: &RpcRequest) -> Result<String, WireError> {
        let json = serde_json::to_string(request)?;
        Ok(match self {
            WireEncoding::Json => json,
            WireEncoding::Base64 => B64.encode(json),
        })
    }

    pub fn decode_response(&self, payload: &[u8]) -> Result<Value, WireError> {
        match self {
            WireEncoding::Json => Ok(serde_json::from_slice(payload)?),
            WireEncoding::Base64 => {
                let json = B64.decode(payload.trim_ascii())?;
                Ok(serde_json::from_slice(&json)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn negotiates_base64_from_browser_header() {
        assert_eq!(
            WireEncoding::negotiate(["binary, base64"]),
            WireEncoding::Base64
        );
        assert_eq!(WireEncoding::negotiate(["binary"]), WireEncoding::Json);
        assert_eq!(WireEncoding::negotiate(Vec::<&str>::new()), WireEncoding::Json);
    }

    #[test]
    fn base64_frames_wrap_json() {
        let encoding = WireEncoding::Base64;
        let frame = encoding.encode_request(&RpcRequest::rmdir("/html/body/div[2]")).unwrap();
        let json = B64.decode(&frame).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&json).unwrap(),
            json!({"cmd": "rmdir", "args": ["/html/body/div[2]"]})
        );

        let reply = B64.encode(r#"[".", "..", "head[1]", "body[1]"]"#);
        assert_eq!(
            encoding.decode_response(reply.as_bytes()).unwrap(),
            json!([".", "..", "head[1]", "body[1]"])
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            WireEncoding::Json.decode_response(b"undefined"),
            Err(WireError::Json(_))
        ));
        assert!(matches!(
            WireEncoding::Base64.decode_response(b"not base64!"),
            Err(WireError::Base64(_))
        ));
    }
}
