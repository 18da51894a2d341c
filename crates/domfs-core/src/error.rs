// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for DomFS Core

use domfs_proto::{ValidationError, WireError};
use libc::c_int;
use std::io;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Transport-level failure of a single RPC
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("websocket error: {0}")]
    Socket(tungstenite::Error),
}

impl RpcError {
    /// Whether the connection is unusable after this error.
    ///
    /// A malformed frame is reported to the caller but leaves the stream in
    /// sync; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RpcError::Wire(_))
    }
}

impl From<tungstenite::Error> for RpcError {
    fn from(err: tungstenite::Error) -> Self {
        use tungstenite::error::ProtocolError;
        match err {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                RpcError::Closed
            }
            tungstenite::Error::Io(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                RpcError::Closed
            }
            other => RpcError::Socket(other),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Filesystem error surfaced to the kernel adapter
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("no such attribute")]
    NoAttribute,
    #[error("connection to agent closed")]
    ConnectionClosed,
    #[error("invalid reply: {0}")]
    InvalidReply(#[from] ValidationError),
    #[error("rpc failed: {0}")]
    Rpc(RpcError),
}

impl From<RpcError> for FsError {
    fn from(err: RpcError) -> Self {
        if err.is_fatal() {
            FsError::ConnectionClosed
        } else {
            FsError::Rpc(err)
        }
    }
}

impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NoAttribute => libc::ENODATA,
            FsError::ConnectionClosed => libc::ENOTCONN,
            FsError::InvalidReply(_) | FsError::Rpc(_) => libc::EIO,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use domfs_proto::Command;

    #[test]
    fn transport_failures_close_the_session() {
        assert!(matches!(FsError::from(RpcError::Closed), FsError::ConnectionClosed));
        assert!(matches!(
            FsError::from(RpcError::Timeout(Duration::from_secs(1))),
            FsError::ConnectionClosed
        ));
        assert!(matches!(
            FsError::from(RpcError::from(tungstenite::Error::ConnectionClosed)),
            FsError::ConnectionClosed
        ));
    }

    #[test]
    fn malformed_frame_is_not_fatal() {
        let wire = domfs_proto::WireEncoding::Json.decode_response(b"{").unwrap_err();
        let err = RpcError::from(wire);
        assert!(!err.is_fatal());
        assert_eq!(FsError::from(err).errno(), libc::EIO);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NoAttribute.errno(), libc::ENODATA);
        assert_eq!(FsError::ConnectionClosed.errno(), libc::ENOTCONN);
        let invalid = ValidationError::Shape {
            cmd: Command::Readdir,
            expected: "a sequence",
            actual: "null",
        };
        assert_eq!(FsError::from(invalid).errno(), libc::EIO);
    }
}
