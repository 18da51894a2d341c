// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path-level filesystem operations backed by the browser agent
//!
//! Each operation issues exactly one command over the channel, except `open`,
//! `readlink` and `statfs`, which are answered locally. Only the commands
//! whose reply carries data have their reply validated; acknowledgements are
//! taken as success whatever their value, but a closed connection is always
//! an error.

use crate::channel::CommandChannel;
use crate::error::{FsError, FsResult};
use crate::handles::HandleAllocator;
use domfs_proto::{decode_reply, Ack, Command, ReplySchema, RpcRequest, StatReply, ValidationError};
use serde_json::Value;
use tracing::{debug, trace};

/// Byte substituted for anything outside printable 7-bit ASCII in read data
pub const REPLACEMENT_BYTE: u8 = b'?';

/// Volume statistics reported for every mount. The DOM has no real capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeStats {
    pub bsize: u32,
    pub blocks: u64,
    pub bavail: u64,
}

pub const VOLUME_STATS: VolumeStats = VolumeStats {
    bsize: 512,
    blocks: 4096,
    bavail: 2048,
};

pub struct DomOps<C> {
    channel: C,
    handles: HandleAllocator,
}

impl<C: CommandChannel> DomOps<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            handles: HandleAllocator::new(),
        }
    }

    pub fn handles(&self) -> &HandleAllocator {
        &self.handles
    }

    fn rpc(&self, request: RpcRequest) -> FsResult<Value> {
        trace!(target: "domfs::ops", cmd = %request.cmd, args = ?request.args, "dispatch");
        let value = self.channel.call(request)?;
        Ok(value)
    }

    fn rpc_typed<T: ReplySchema>(&self, request: RpcRequest) -> FsResult<T> {
        let cmd = request.cmd;
        let value = self.rpc(request)?;
        Ok(decode_reply(cmd, value)?)
    }

    fn acknowledge(&self, request: RpcRequest) -> FsResult<()> {
        let cmd = request.cmd;
        let Ack(answer) = self.rpc_typed(request)?;
        debug!(target: "domfs::ops", %cmd, ?answer, "acknowledged");
        Ok(())
    }

    /// Anything but an attribute mapping means the node does not exist.
    pub fn getattr(&self, path: &str) -> FsResult<StatReply> {
        match self.rpc_typed(RpcRequest::getattr(path)) {
            Err(FsError::InvalidReply(ValidationError::Shape { .. })) => Err(FsError::NotFound),
            other => other,
        }
    }

    /// Entry names, including the "." and ".." the agent supplies.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        self.rpc_typed(RpcRequest::readdir(path))
    }

    /// Node contents as 7-bit text. Characters outside that range are
    /// replaced rather than reported as errors, so reads are lossy.
    pub fn read(&self, path: &str, size: u32, offset: i64) -> FsResult<Vec<u8>> {
        let text: String = self.rpc_typed(RpcRequest::read(path, size, offset))?;
        Ok(sanitize_payload(&text))
    }

    /// Byte count accepted by the agent, passed through unchanged.
    pub fn write(&self, path: &str, data: &[u8], offset: i64, fh: u64) -> FsResult<u32> {
        let text = String::from_utf8_lossy(data);
        self.rpc_typed(RpcRequest::write(path, &text, offset, fh))
    }

    /// Creates the node remotely and hands out a fresh local handle.
    pub fn create(&self, path: &str, mode: u32) -> FsResult<u64> {
        self.acknowledge(RpcRequest::create(path, mode))?;
        Ok(self.handles.allocate())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.acknowledge(RpcRequest::mkdir(path, mode))
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        self.acknowledge(RpcRequest::rmdir(path))
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.acknowledge(RpcRequest::unlink(path))
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        self.acknowledge(RpcRequest::rename(old_path, new_path))
    }

    pub fn symlink(&self, link_path: &str, target: &str) -> FsResult<()> {
        self.acknowledge(RpcRequest::symlink(link_path, target))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.acknowledge(RpcRequest::chmod(path, mode))
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        self.acknowledge(RpcRequest::chown(path, uid, gid))
    }

    pub fn utimens(&self, path: &str, times: Option<(f64, f64)>) -> FsResult<()> {
        self.acknowledge(RpcRequest::utimens(path, times))
    }

    pub fn truncate(&self, path: &str, length: u64) -> FsResult<()> {
        self.acknowledge(RpcRequest::truncate(path, length))
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> FsResult<()> {
        let value = String::from_utf8_lossy(value);
        self.acknowledge(RpcRequest::setxattr(path, name, &value))
    }

    pub fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        self.acknowledge(RpcRequest::removexattr(path, name))
    }

    pub fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        match self.rpc(RpcRequest::getxattr(path, name))? {
            Value::Null => Err(FsError::NoAttribute),
            value => {
                let text: String = decode_reply(Command::Getxattr, value)?;
                Ok(text.into_bytes())
            }
        }
    }

    pub fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        self.rpc_typed(RpcRequest::listxattr(path))
    }

    /// Local only; handles are never bound to remote state.
    pub fn open(&self, path: &str) -> u64 {
        let fh = self.handles.allocate();
        trace!(target: "domfs::ops", path, fh, "open");
        fh
    }

    /// Links are accepted by `symlink` but never resolvable.
    pub fn readlink(&self, _path: &str) -> Vec<u8> {
        Vec::new()
    }

    pub fn statfs(&self, _path: &str) -> VolumeStats {
        VOLUME_STATS
    }
}

/// Keep printable ASCII plus tab/newline/carriage return; replace each other
/// character with [`REPLACEMENT_BYTE`].
pub fn sanitize_payload(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            ' '..='~' | '\t' | '\n' | '\r' => c as u8,
            _ => REPLACEMENT_BYTE,
        })
        .collect()
}
