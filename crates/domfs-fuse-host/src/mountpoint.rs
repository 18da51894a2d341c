// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount directory claims
//!
//! A directory is claimed for exactly one session at a time. The in-process
//! registry catches sessions of this host; the mount-point check catches a
//! filesystem some other process left mounted there.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum MountError {
    #[error("{0} is already an active mount")]
    Busy(PathBuf),
    #[error("cannot prepare mount directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Mount paths currently owned by live sessions
#[derive(Clone, Debug, Default)]
pub struct MountRegistry {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<base>.<id>`
    pub fn mount_path(base: &Path, id: u64) -> PathBuf {
        let mut path = base.as_os_str().to_owned();
        path.push(format!(".{id}"));
        PathBuf::from(path)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    /// Create (or adopt) the directory at `path` for a new session.
    ///
    /// Fails with [`MountError::Busy`] when a live session or a foreign
    /// filesystem already occupies it; in that case nothing on disk is touched.
    pub fn claim(&self, path: PathBuf) -> Result<MountDir, MountError> {
        let mut active = self.lock();
        if active.contains(&path) {
            return Err(MountError::Busy(path));
        }

        match std::fs::create_dir(&path) {
            Ok(()) => debug!(target: "domfs::mount", path = %path.display(), "created mount directory"),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let mounted = is_mount_point(&path).map_err(|source| MountError::Io {
                    path: path.clone(),
                    source,
                })?;
                if mounted {
                    return Err(MountError::Busy(path));
                }
                if !path.is_dir() {
                    return Err(MountError::Io {
                        path,
                        source: io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
                    });
                }
                info!(
                    target: "domfs::mount",
                    path = %path.display(),
                    "reusing stale mount directory"
                );
            }
            Err(source) => return Err(MountError::Io { path, source }),
        }

        active.insert(path.clone());
        Ok(MountDir {
            path,
            registry: self.clone(),
        })
    }
}

/// A claimed mount directory. Dropping it removes the directory and
/// releases the claim; drop it only after the filesystem is unmounted.
#[derive(Debug)]
pub struct MountDir {
    path: PathBuf,
    registry: MountRegistry,
}

impl MountDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir(&self.path) {
            warn!(
                target: "domfs::mount",
                path = %self.path.display(),
                %err,
                "failed to remove mount directory"
            );
        } else {
            debug!(target: "domfs::mount", path = %self.path.display(), "removed mount directory");
        }
        self.registry.lock().remove(&self.path);
    }
}

/// Whether `path` is the root of a mounted filesystem. A FUSE mount whose
/// server has gone away reports `ENOTCONN` and counts as mounted.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => return Ok(true),
        Err(err) => return Err(err),
    };
    let parent = std::fs::metadata(path.join(".."))?;
    Ok(meta.dev() != parent.dev() || meta.ino() == parent.ino())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_path_appends_connection_id() {
        assert_eq!(
            MountRegistry::mount_path(Path::new("/tmp/domfs"), 3),
            PathBuf::from("/tmp/domfs.3")
        );
    }

    #[test]
    fn claim_creates_and_drop_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();
        let path = MountRegistry::mount_path(&tmp.path().join("mnt"), 1);

        let dir = registry.claim(path.clone()).unwrap();
        assert!(path.is_dir());
        assert!(registry.is_active(&path));
        assert_eq!(dir.path(), path);

        drop(dir);
        assert!(!path.exists());
        assert!(!registry.is_active(&path));
    }

    #[test]
    fn second_claim_is_busy_and_leaves_first_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = MountRegistry::new();
        let path = tmp.path().join("mnt.1");

        let first = registry.claim(path.clone()).unwrap();
        let second = registry.claim(path.clone());
        assert!(matches!(second, Err(MountError::Busy(ref p)) if *p == path));
        assert!(path.is_dir());
        assert!(registry.is_active(&path));
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn stale_directory_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mnt.7");
        std::fs::create_dir(&path).unwrap();

        let dir = MountRegistry::new().claim(path.clone()).unwrap();
        assert!(path.is_dir());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn existing_mount_is_busy_and_untouched() {
        let registry = MountRegistry::new();
        let root = PathBuf::from("/");
        assert!(matches!(registry.claim(root.clone()), Err(MountError::Busy(_))));
        assert!(root.is_dir());
        assert!(!registry.is_active(&root));
    }

    #[test]
    fn plain_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mnt.2");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            MountRegistry::new().claim(path.clone()),
            Err(MountError::Io { .. })
        ));
        assert!(path.is_file());
    }

    #[test]
    fn mount_point_detection() {
        assert!(is_mount_point(Path::new("/")).unwrap());
        let tmp = tempfile::tempdir().unwrap();
        let inner = tmp.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        assert!(!is_mount_point(&inner).unwrap());
        assert!(is_mount_point(&tmp.path().join("missing")).is_err());
    }
}
