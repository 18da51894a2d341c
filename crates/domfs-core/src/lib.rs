// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DomFS core: RPC channel and filesystem operation adapter
//!
//! The operation adapter answers path-keyed filesystem calls by issuing at
//! most one command over a connection's [`channel::RpcChannel`]. Kernel
//! plumbing (inodes, replies) lives in the FUSE host on top of this.

pub mod channel;
pub mod config;
pub mod error;
pub mod handles;
pub mod ops;

pub use channel::{ChannelClosed, CommandChannel, RpcChannel};
pub use config::DomFsConfig;
pub use error::{FsError, FsResult, RpcError, RpcResult};
pub use handles::HandleAllocator;
pub use ops::{DomOps, VolumeStats};

#[cfg(any(test, feature = "testing"))]
pub use channel::MockCommandChannel;
