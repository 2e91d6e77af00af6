//! Inode number management and attribute conversion
//!
//! The kernel addresses files by inode number; the backing store by path.
//! Inode numbers are virtual, allocated on first lookup, and map to paths
//! relative to the mount root.

use crate::block::BlockLayout;
use fuser::{FileAttr, FileType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

#[derive(Default)]
struct Maps {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
}

/// Bidirectional inode/path table
pub struct InodeTable {
    next_ino: AtomicU64,
    maps: RwLock<Maps>,
}

impl InodeTable {
    /// Create a table holding only the root
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.by_ino.insert(ROOT_INO, PathBuf::new());
        maps.by_path.insert(PathBuf::new(), ROOT_INO);

        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(maps),
        }
    }

    /// Path for an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.maps.read().by_ino.get(&ino).cloned()
    }

    /// Path of a child entry of a directory inode
    pub fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode for a path, allocating one if needed
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(&ino) = self.maps.read().by_path.get(path) {
            return ino;
        }

        let mut maps = self.maps.write();
        if let Some(&ino) = maps.by_path.get(path) {
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        maps.by_ino.insert(ino, path.to_path_buf());
        maps.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Whether an inode is known
    pub fn exists(&self, ino: u64) -> bool {
        self.maps.read().by_ino.contains_key(&ino)
    }

    /// Drop a path and everything below it
    pub fn remove(&self, path: &Path) {
        let mut maps = self.maps.write();
        let stale: Vec<PathBuf> = maps
            .by_path
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();

        for p in stale {
            if let Some(ino) = maps.by_path.remove(&p) {
                maps.by_ino.remove(&ino);
            }
        }
    }

    /// Move a path and everything below it, keeping inode numbers
    pub fn rename(&self, from: &Path, to: &Path) {
        self.remove(to);

        let mut maps = self.maps.write();
        let moved: Vec<(PathBuf, u64)> = maps
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        for (old, ino) in moved {
            let Ok(rest) = old.strip_prefix(from) else {
                continue;
            };
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };

            maps.by_path.remove(&old);
            maps.by_path.insert(new.clone(), ino);
            maps.by_ino.insert(ino, new);
        }
    }

    /// Number of known inodes
    pub fn len(&self) -> usize {
        self.maps.read().by_ino.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a std file type to the FUSE one
pub fn file_type(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Build FUSE attributes from backing metadata.
///
/// Regular files report their logical size; everything else reports the
/// backing metadata unchanged.
pub fn file_attr(ino: u64, meta: &Metadata, layout: &BlockLayout) -> FileAttr {
    let kind = file_type(meta.file_type());
    let size = if kind == FileType::RegularFile {
        layout.logical_size(meta.len())
    } else {
        meta.len()
    };

    FileAttr {
        ino,
        size,
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}
