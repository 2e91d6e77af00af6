//! File handle management
//!
//! Each FUSE open gets its own handle holding a backing file descriptor.
//! Handles on the same backing file share one reader/writer lock so that
//! read-modify-write cycles never interleave.

use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Flags handled by the filesystem rather than passed to the backing open.
///
/// `O_DIRECT` is dropped along with `O_APPEND`: block I/O on the backing file
/// never lines up with the caller's offsets and lengths.
#[cfg(target_os = "linux")]
const STRIPPED_FLAGS: i32 = libc::O_ACCMODE
    | libc::O_APPEND
    | libc::O_CREAT
    | libc::O_EXCL
    | libc::O_TRUNC
    | libc::O_DIRECT;

#[cfg(not(target_os = "linux"))]
const STRIPPED_FLAGS: i32 =
    libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

/// Identity of a backing file, stable across renames and hard links
type FileKey = (u64, u64);

/// Represents an open file
pub struct FileHandle {
    /// Inode number
    pub ino: u64,
    /// Open flags as requested by the caller
    pub flags: i32,
    /// Backing file, always opened readable
    pub file: File,
    key: FileKey,
    lock: Arc<RwLock<()>>,
}

impl FileHandle {
    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        (self.flags & libc::O_APPEND) != 0
    }

    /// Check if the caller asked for truncation on open
    pub fn is_truncate(&self) -> bool {
        (self.flags & libc::O_TRUNC) != 0
    }

    /// Lock shared by every handle on the same backing file
    pub fn lock(&self) -> &RwLock<()> {
        &self.lock
    }
}

/// Manages open file handles
pub struct HandleManager {
    /// Next handle ID
    next_id: AtomicU64,
    /// Open handles
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    /// Per-backing-file locks
    locks: DashMap<FileKey, Arc<RwLock<()>>>,
}

impl HandleManager {
    /// Create a new handle manager
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
        }
    }

    /// Open a backing file and return a handle ID.
    ///
    /// The backing file is opened readable even for write-only callers,
    /// since partial block writes must read the block first. Append is
    /// resolved by the filesystem against the logical size. With `create`
    /// set, the file is created with the given mode.
    pub fn open(&self, ino: u64, path: &Path, flags: i32, create: Option<u32>) -> Result<u64> {
        let writable = matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR);

        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(writable || create.is_some())
            .custom_flags(flags & !STRIPPED_FLAGS);
        if let Some(mode) = create {
            options.create(true).mode(mode);
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            }
        }

        let file = options.open(path)?;
        let meta = file.metadata()?;
        let key = (meta.dev(), meta.ino());

        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();

        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = FileHandle {
            ino,
            flags,
            file,
            key,
            lock,
        };
        self.handles.write().insert(fh, Arc::new(handle));
        Ok(fh)
    }

    /// Get a handle by ID
    pub fn get(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::InvalidFileHandle(fh))
    }

    /// Close a handle, dropping the file lock once no handle uses it
    pub fn close(&self, fh: u64) -> Result<()> {
        let handle = self
            .handles
            .write()
            .remove(&fh)
            .ok_or(Error::InvalidFileHandle(fh))?;

        let key = handle.key;
        drop(handle);
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        Ok(())
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// Check if no handles are open
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Number of backing files with a live lock
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();

        let handles = HandleManager::new();
        let fh = handles.open(2, &path, libc::O_RDONLY, None).unwrap();
        assert_eq!(handles.get(fh).unwrap().ino, 2);
        assert_eq!(handles.len(), 1);

        handles.close(fh).unwrap();
        assert!(handles.is_empty());
        assert_eq!(handles.lock_count(), 0);
        assert!(matches!(handles.get(fh), Err(Error::InvalidFileHandle(_))));
        assert!(matches!(handles.close(fh), Err(Error::InvalidFileHandle(_))));
    }

    #[test]
    fn test_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();
        let handles = HandleManager::new();

        let wo = handles
            .get(handles.open(2, &path, libc::O_WRONLY | libc::O_APPEND, None).unwrap())
            .unwrap();
        assert!(!wo.is_readable());
        assert!(wo.is_writable());
        assert!(wo.is_append());

        let ro = handles.get(handles.open(2, &path, libc::O_RDONLY, None).unwrap()).unwrap();
        assert!(ro.is_readable());
        assert!(!ro.is_writable());
        assert!(!ro.is_truncate());
    }

    #[test]
    fn test_write_only_handle_can_read_backing_file() {
        use std::os::unix::fs::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"backing").unwrap();
        let handles = HandleManager::new();

        let handle = handles
            .get(handles.open(2, &path, libc::O_WRONLY | libc::O_APPEND, None).unwrap())
            .unwrap();
        let mut buf = [0u8; 7];
        handle.file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"backing");

        // O_APPEND is not passed through: positional writes land where asked
        handle.file.write_all_at(b"B", 0).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"Backing");
    }

    #[test]
    fn test_handles_share_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let other = dir.path().join("g");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(&other, b"").unwrap();
        std::fs::hard_link(&path, dir.path().join("link")).unwrap();

        let handles = HandleManager::new();
        let a = handles.open(2, &path, libc::O_RDWR, None).unwrap();
        let b = handles.open(2, &path, libc::O_RDONLY, None).unwrap();
        let c = handles.open(3, &other, libc::O_RDWR, None).unwrap();
        let d = handles.open(4, &dir.path().join("link"), libc::O_RDWR, None).unwrap();

        let ha = handles.get(a).unwrap();
        let hb = handles.get(b).unwrap();
        let hc = handles.get(c).unwrap();
        let hd = handles.get(d).unwrap();
        assert!(Arc::ptr_eq(&ha.lock, &hb.lock));
        assert!(Arc::ptr_eq(&ha.lock, &hd.lock));
        assert!(!Arc::ptr_eq(&ha.lock, &hc.lock));
        assert_eq!(handles.lock_count(), 2);
        drop((ha, hb, hc, hd));

        handles.close(a).unwrap();
        assert_eq!(handles.lock_count(), 2);
        handles.close(b).unwrap();
        handles.close(d).unwrap();
        assert_eq!(handles.lock_count(), 1);
        handles.close(c).unwrap();
        assert_eq!(handles.lock_count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_direct_io_not_forwarded() {
        use std::os::unix::fs::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();
        let handles = HandleManager::new();

        let fh = handles.open(2, &path, libc::O_RDWR | libc::O_DIRECT, None).unwrap();
        let handle = handles.get(fh).unwrap();
        assert_ne!(handle.flags & libc::O_DIRECT, 0);

        // An unaligned positional write would fail with EINVAL on a direct fd
        handle.file.write_all_at(&[7u8; 45], 3).unwrap();
        let mut buf = [0u8; 45];
        handle.file.read_exact_at(&mut buf, 3).unwrap();
        assert_eq!(buf, [7u8; 45]);
    }

    #[test]
    fn test_create() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new");
        let handles = HandleManager::new();

        let fh = handles
            .open(5, &path, libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, Some(0o600))
            .unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        handles.close(fh).unwrap();

        // O_EXCL refuses an existing file
        let err = handles
            .open(5, &path, libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, Some(0o600))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[test]
    fn test_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let handles = HandleManager::new();
        let err = handles
            .open(2, &dir.path().join("missing"), libc::O_RDONLY, None)
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}
