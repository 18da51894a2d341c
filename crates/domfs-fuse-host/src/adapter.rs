// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DomFS FUSE adapter implementation
//!
//! Maps inode-based FUSE requests onto the path-keyed operations of
//! [`DomOps`]. The only state kept here is the inode ↔ path table; every
//! attribute and listing comes from the agent on each request.

use domfs_core::config::CacheConfig;
use domfs_core::{CommandChannel, DomOps, FsError, FsResult};
use domfs_proto::StatReply;
use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EINVAL, ENAMETOOLONG, ENOENT, ERANGE};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Maximum single path component length
const NAME_MAX: usize = 255;

const BLOCK_SIZE: u32 = 512;

/// FUSE filesystem for one connected agent
pub struct DomFsFuse<C: CommandChannel + 'static> {
    ops: DomOps<C>,
    attr_ttl: Duration,
    entry_ttl: Duration,
    inodes: HashMap<u64, String>,
    paths: HashMap<String, u64>,
    next_inode: u64,
}

impl<C: CommandChannel + 'static> DomFsFuse<C> {
    pub fn new(ops: DomOps<C>, cache: &CacheConfig) -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, "/".to_string());
        paths.insert("/".to_string(), FUSE_ROOT_ID);

        Self {
            ops,
            attr_ttl: Duration::from_millis(u64::from(cache.attr_ttl_ms)),
            entry_ttl: Duration::from_millis(u64::from(cache.entry_ttl_ms)),
            inodes,
            paths,
            next_inode: FUSE_ROOT_ID + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.get(&ino).cloned().ok_or(ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        if name.len() > NAME_MAX {
            return Err(ENAMETOOLONG);
        }
        Ok(child_path(&self.path_of(parent)?, name))
    }

    fn get_or_alloc_inode(&mut self, path: &str) -> u64 {
        if let Some(&inode) = self.paths.get(path) {
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(path.to_string(), inode);
        self.inodes.insert(inode, path.to_string());
        inode
    }

    fn remove_path_mapping(&mut self, path: &str) -> Option<u64> {
        let inode = self.paths.remove(path)?;
        self.inodes.remove(&inode);
        Some(inode)
    }

    /// `root` and every mapped path below it
    fn subtree_mappings(&self, root: &str) -> Vec<(String, u64)> {
        let prefix = format!("{root}/");
        self.paths
            .iter()
            .filter(|(path, _)| path.as_str() == root || path.starts_with(&prefix))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect()
    }

    /// Re-key `old` and everything below it under `new`, dropping whatever
    /// `new` replaced.
    fn rename_path_mapping(&mut self, old: &str, new: &str) {
        for (path, ino) in self.subtree_mappings(new) {
            self.paths.remove(&path);
            self.inodes.remove(&ino);
        }
        let moved = self.subtree_mappings(old);
        for (path, ino) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.paths.remove(&path);
            self.paths.insert(renamed.clone(), ino);
            self.inodes.insert(ino, renamed);
        }
    }

    fn forget_inode(&mut self, inode: u64) {
        if inode == FUSE_ROOT_ID {
            return;
        }
        if let Some(path) = self.inodes.remove(&inode) {
            self.paths.remove(&path);
        }
    }

    fn fail(&self, op: &'static str, path: &str, err: FsError) -> c_int {
        let errno = err.errno();
        debug!(target: "domfs::fuse", op, path, %err, errno, "operation failed");
        errno
    }

    /// Attributes for a node this process just created. The agent is not
    /// asked again, so each create-like call stays a single round trip.
    fn local_attr(&self, req: &Request, ino: u64, kind: FileType, mode: u32) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: (mode & 0o7777) as u16,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub(crate) fn parent_path(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn to_system_time(secs: Option<f64>) -> SystemTime {
    match secs {
        Some(secs) => UNIX_EPOCH + Duration::try_from_secs_f64(secs).unwrap_or_default(),
        None => SystemTime::now(),
    }
}

fn clamp_id(id: i64) -> u32 {
    u32::try_from(id).unwrap_or(0)
}

pub(crate) fn stat_to_file_attr(stat: &StatReply, ino: u64) -> FileAttr {
    let kind = match stat.st_mode & libc::S_IFMT {
        m if m == libc::S_IFDIR => FileType::Directory,
        m if m == libc::S_IFLNK => FileType::Symlink,
        m if m == libc::S_IFCHR => FileType::CharDevice,
        m if m == libc::S_IFBLK => FileType::BlockDevice,
        m if m == libc::S_IFIFO => FileType::NamedPipe,
        m if m == libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };
    let ctime = to_system_time(stat.st_ctime);

    FileAttr {
        ino,
        size: stat.st_size,
        blocks: stat.st_size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: to_system_time(stat.st_atime),
        mtime: to_system_time(stat.st_mtime),
        ctime,
        crtime: ctime,
        kind,
        perm: (stat.st_mode & 0o7777) as u16,
        nlink: stat.st_nlink.max(1),
        uid: clamp_id(stat.st_uid),
        gid: clamp_id(stat.st_gid),
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn time_to_secs(time: TimeOrNow) -> f64 {
    let at = match time {
        TimeOrNow::SpecificTime(at) => at,
        TimeOrNow::Now => SystemTime::now(),
    };
    at.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Timestamp argument for a setattr, or `None` when no time changes.
/// `Some(None)` asks the agent to use "now" for both.
pub(crate) fn utimens_times(
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> Option<Option<(f64, f64)>> {
    match (atime, mtime) {
        (None, None) => None,
        (Some(TimeOrNow::Now), Some(TimeOrNow::Now) | None)
        | (None, Some(TimeOrNow::Now)) => Some(None),
        (atime, mtime) => Some(Some((
            time_to_secs(atime.unwrap_or(TimeOrNow::Now)),
            time_to_secs(mtime.unwrap_or(TimeOrNow::Now)),
        ))),
    }
}

/// How to answer an xattr query given the caller's buffer size
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum XattrAnswer {
    Size(u32),
    Data,
    TooSmall,
}

pub(crate) fn xattr_answer(requested: u32, len: usize) -> XattrAnswer {
    if requested == 0 {
        XattrAnswer::Size(u32::try_from(len).unwrap_or(u32::MAX))
    } else if len <= requested as usize {
        XattrAnswer::Data
    } else {
        XattrAnswer::TooSmall
    }
}

fn reply_xattr(reply: ReplyXattr, requested: u32, bytes: &[u8]) {
    match xattr_answer(requested, bytes.len()) {
        XattrAnswer::Size(len) => reply.size(len),
        XattrAnswer::Data => reply.data(bytes),
        XattrAnswer::TooSmall => reply.error(ERANGE),
    }
}

pub(crate) fn xattr_name_list(names: &[String]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for name in names {
        buffer.extend_from_slice(name.as_bytes());
        buffer.push(0);
    }
    buffer
}

impl<C: CommandChannel + 'static> fuser::Filesystem for DomFsFuse<C> {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        info!(
            target: "domfs::fuse",
            attr_ttl_ms = self.attr_ttl.as_millis() as u64,
            entry_ttl_ms = self.entry_ttl.as_millis() as u64,
            "DomFS FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            target: "domfs::fuse",
            handles = self.ops.handles().last(),
            "DomFS FUSE adapter destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.getattr(&path) {
            Ok(stat) => {
                let ino = self.get_or_alloc_inode(&path);
                reply.entry(&self.entry_ttl, &stat_to_file_attr(&stat, ino), 0);
            }
            Err(err) => reply.error(self.fail("lookup", &path, err)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        self.forget_inode(ino);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.getattr(&path) {
            Ok(stat) => reply.attr(&self.attr_ttl, &stat_to_file_attr(&stat, ino)),
            Err(err) => reply.error(self.fail("getattr", &path, err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let applied = (|| -> FsResult<StatReply> {
            if let Some(mode) = mode {
                self.ops.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.ops.chown(&path, uid, gid)?;
            }
            if let Some(length) = size {
                self.ops.truncate(&path, length)?;
            }
            if let Some(times) = utimens_times(atime, mtime) {
                self.ops.utimens(&path, times)?;
            }
            self.ops.getattr(&path)
        })();

        match applied {
            Ok(stat) => reply.attr(&self.attr_ttl, &stat_to_file_attr(&stat, ino)),
            Err(err) => reply.error(self.fail("setattr", &path, err)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.path_of(ino) {
            Ok(path) => reply.data(&self.ops.readlink(&path)),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.mkdir(&path, mode) {
            Ok(()) => {
                let ino = self.get_or_alloc_inode(&path);
                let attr = self.local_attr(req, ino, FileType::Directory, mode & !umask);
                reply.entry(&self.entry_ttl, &attr, 0);
            }
            Err(err) => reply.error(self.fail("mkdir", &path, err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.unlink(&path) {
            Ok(()) => {
                self.remove_path_mapping(&path);
                reply.ok();
            }
            Err(err) => reply.error(self.fail("unlink", &path, err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.rmdir(&path) {
            Ok(()) => {
                self.remove_path_mapping(&path);
                reply.ok();
            }
            Err(err) => reply.error(self.fail("rmdir", &path, err)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_of(parent, link_name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(target) = target.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.ops.symlink(&path, target) {
            Ok(()) => {
                let ino = self.get_or_alloc_inode(&path);
                let attr = self.local_attr(req, ino, FileType::Symlink, 0o777);
                reply.entry(&self.entry_ttl, &attr, 0);
            }
            Err(err) => reply.error(self.fail("symlink", &path, err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self
            .child_of(parent, name)
            .and_then(|old| Ok((old, self.child_of(newparent, newname)?)));
        let (old, new) = match paths {
            Ok(paths) => paths,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.rename(&old, &new) {
            Ok(()) => {
                self.rename_path_mapping(&old, &new);
                reply.ok();
            }
            Err(err) => reply.error(self.fail("rename", &old, err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path_of(ino) {
            Ok(path) => reply.opened(self.ops.open(&path), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.read(&path, size, offset) {
            Ok(bytes) => reply.data(&bytes),
            Err(err) => reply.error(self.fail("read", &path, err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.write(&path, data, offset, fh) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(self.fail("write", &path, err)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let entries = match self.ops.readdir(&path) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(self.fail("readdir", &path, err));
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, name) in entries.iter().enumerate().skip(skip) {
            let (entry_ino, kind) = match name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => {
                    let parent = parent_path(&path).to_string();
                    (self.get_or_alloc_inode(&parent), FileType::Directory)
                }
                _ => {
                    let child = child_path(&path, name);
                    (self.get_or_alloc_inode(&child), FileType::RegularFile)
                }
            };
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.path_of(ino).unwrap_or_else(|_| "/".to_string());
        let stats = self.ops.statfs(&path);
        reply.statfs(
            stats.blocks,
            stats.bavail,
            stats.bavail,
            0,
            0,
            stats.bsize,
            NAME_MAX as u32,
            stats.bsize,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.ops.setxattr(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(self.fail("setxattr", &path, err)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.ops.getxattr(&path, name) {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(err) => reply.error(self.fail("getxattr", &path, err)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.listxattr(&path) {
            Ok(names) => reply_xattr(reply, size, &xattr_name_list(&names)),
            Err(err) => reply.error(self.fail("listxattr", &path, err)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.ops.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(self.fail("removexattr", &path, err)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.ops.create(&path, mode) {
            Ok(fh) => {
                let ino = self.get_or_alloc_inode(&path);
                let attr = self.local_attr(req, ino, FileType::RegularFile, mode & !umask);
                reply.created(&self.entry_ttl, &attr, 0, fh, 0);
            }
            Err(err) => reply.error(self.fail("create", &path, err)),
        }
    }
}
