//! Main FUSE filesystem implementation
//!
//! A passthrough over the backing directory. Namespace operations map
//! directly onto the backing tree; file contents go through the block
//! engine so that the backing files only ever hold sealed blocks.

use crate::block::BlockIo;
use crate::error::{Error, Result};
use crate::fs::backing::BackingStore;
use crate::fs::handle::HandleManager;
use crate::fs::inode::{file_attr, file_type, InodeTable, ROOT_INO};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// TTL for cached attributes
const TTL: Duration = Duration::from_secs(1);

/// Block-encrypting passthrough filesystem
pub struct BlockCryptFs {
    /// Backing directory
    backing: BackingStore,
    /// Inode number to path table
    inodes: InodeTable,
    /// File handle manager
    handles: HandleManager,
    /// Block engine
    io: BlockIo,
}

impl BlockCryptFs {
    /// Create a filesystem over a backing directory
    pub fn new(backing: BackingStore, io: BlockIo) -> Self {
        BlockCryptFs {
            backing,
            inodes: InodeTable::new(),
            handles: HandleManager::new(),
            io,
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        self.inodes
            .child_path(parent, name)
            .ok_or_else(|| Error::NotFound(format!("inode {}", parent)))
    }

    /// Attributes of a virtual path, registering it in the inode table
    fn entry(&self, path: &Path) -> Result<FileAttr> {
        let meta = self.backing.metadata(path)?;
        let ino = self.inodes.ino_for(path);
        Ok(file_attr(ino, &meta, self.io.layout()))
    }

    fn attr(&self, ino: u64) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        let meta = self.backing.metadata(&path)?;
        Ok(file_attr(ino, &meta, self.io.layout()))
    }

    fn do_open(&self, ino: u64, flags: i32) -> Result<u64> {
        let path = self.path_of(ino)?;
        let fh = self
            .handles
            .open(ino, &self.backing.resolve(&path), flags, None)?;

        let handle = self.handles.get(fh)?;
        if handle.is_truncate() && handle.is_writable() {
            let _guard = handle.lock().write();
            if let Err(e) = self.io.truncate(&handle.file, 0) {
                drop(_guard);
                let _ = self.handles.close(fh);
                return Err(e);
            }
        }

        Ok(fh)
    }

    fn do_create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64)> {
        let path = self.child_of(parent, name)?;
        let backing_path = self.backing.resolve(&path);
        let ino = self.inodes.ino_for(&path);

        let fh = self
            .handles
            .open(ino, &backing_path, flags, Some(mode & !umask & 0o7777))?;

        match self.entry(&path) {
            Ok(attr) => Ok((attr, fh)),
            Err(e) => {
                let _ = self.handles.close(fh);
                Err(e)
            }
        }
    }

    fn do_read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let offset = logical_offset(offset)?;
        let handle = self.handles.get(fh)?;

        let _guard = handle.lock().read();
        self.io.read(&handle.file, offset, size as usize)
    }

    fn do_write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<usize> {
        let offset = logical_offset(offset)?;
        let handle = self.handles.get(fh)?;
        if !handle.is_writable() {
            return Err(Error::InvalidFileHandle(fh));
        }

        let _guard = handle.lock().write();
        let offset = if handle.is_append() {
            self.io.logical_len(&handle.file)?
        } else {
            offset
        };
        self.io.write(&handle.file, offset, data)
    }

    fn truncate(&self, ino: u64, path: &Path, fh: Option<u64>, size: u64) -> Result<()> {
        let (fh, temporary) = match fh {
            Some(fh) => (fh, false),
            None => (
                self.handles
                    .open(ino, &self.backing.resolve(path), libc::O_WRONLY, None)?,
                true,
            ),
        };

        let result = self.handles.get(fh).and_then(|handle| {
            let _guard = handle.lock().write();
            self.io.truncate(&handle.file, size)
        });

        if temporary {
            self.handles.close(fh)?;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        let backing_path = self.backing.resolve(&path);

        if let Some(m) = mode {
            fs::set_permissions(&backing_path, fs::Permissions::from_mode(m & 0o7777))?;
        }
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(&backing_path, uid, gid)?;
        }
        if let Some(s) = size {
            self.truncate(ino, &path, fh, s)?;
        }
        if atime.is_some() || mtime.is_some() {
            set_times(&backing_path, atime, mtime)?;
        }

        self.attr(ino)
    }

    fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, FileType, OsString)>> {
        let path = self.path_of(ino)?;
        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.ino_for(parent),
            None => ROOT_INO,
        };

        let mut entries = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];

        for entry in fs::read_dir(self.backing.resolve(&path))? {
            let entry = entry?;
            let name = entry.file_name();
            let child_ino = self.inodes.ino_for(&path.join(&name));
            entries.push((child_ino, file_type(entry.file_type()?), name));
        }

        Ok(entries)
    }

    fn do_mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> Result<FileAttr> {
        let path = self.child_of(parent, name)?;
        DirBuilder::new()
            .mode(mode & !umask & 0o7777)
            .create(self.backing.resolve(&path))?;
        self.entry(&path)
    }

    fn do_mknod(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<FileAttr> {
        let path = self.child_of(parent, name)?;
        nix::sys::stat::mknod(
            &self.backing.resolve(&path),
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & !umask & 0o7777),
            rdev as libc::dev_t,
        )
        .map_err(io::Error::from)?;
        self.entry(&path)
    }

    fn do_unlink(&self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_of(parent, name)?;
        fs::remove_file(self.backing.resolve(&path))?;
        self.inodes.remove(&path);
        Ok(())
    }

    fn do_rmdir(&self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_of(parent, name)?;
        fs::remove_dir(self.backing.resolve(&path))?;
        self.inodes.remove(&path);
        Ok(())
    }

    fn do_symlink(&self, parent: u64, name: &OsStr, target: &Path) -> Result<FileAttr> {
        let path = self.child_of(parent, name)?;
        std::os::unix::fs::symlink(target, self.backing.resolve(&path))?;
        self.entry(&path)
    }

    fn do_readlink(&self, ino: u64) -> Result<PathBuf> {
        let path = self.path_of(ino)?;
        Ok(fs::read_link(self.backing.resolve(&path))?)
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> Result<()> {
        if flags != 0 {
            return Err(Error::InvalidArgument(format!(
                "unsupported rename flags {:#x}",
                flags
            )));
        }

        let from = self.child_of(parent, name)?;
        let to = self.child_of(newparent, newname)?;
        fs::rename(self.backing.resolve(&from), self.backing.resolve(&to))?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    fn do_link(&self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr> {
        let existing = self.path_of(ino)?;
        let path = self.child_of(newparent, newname)?;
        fs::hard_link(self.backing.resolve(&existing), self.backing.resolve(&path))?;
        self.entry(&path)
    }

    fn do_fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.handles.get(fh)?;
        let _guard = handle.lock().read();
        if datasync {
            handle.file.sync_data()?;
        } else {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    fn do_access(&self, ino: u64, mask: i32) -> Result<()> {
        let path = self.path_of(ino)?;
        nix::unistd::access(
            &self.backing.resolve(&path),
            AccessFlags::from_bits_truncate(mask),
        )
        .map_err(io::Error::from)?;
        Ok(())
    }
}

/// Reject negative offsets from the kernel
fn logical_offset(offset: i64) -> Result<u64> {
    u64::try_from(offset).map_err(|_| Error::InvalidArgument(format!("negative offset {}", offset)))
}

fn timespec(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(t)) => {
            let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: since.as_secs() as libc::time_t,
                tv_nsec: since.subsec_nanos() as libc::c_long,
            }
        }
    }
}

/// Set access and modification times without following symlinks
fn set_times(path: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(path.display().to_string()))?;
    let times = [timespec(atime), timespec(mtime)];

    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Log a failed operation and return its errno
fn errno(op: &str, e: &Error) -> libc::c_int {
    if e.is_corruption() {
        warn!("{}: {}", op, e);
    } else if matches!(e, Error::NotFound(_)) {
        debug!("{}: {}", op, e);
    } else if let Error::Io(io_err) = e {
        debug!("{}: {}", op, io_err);
    } else {
        error!("{} error: {}", op, e);
    }
    e.to_errno()
}

impl Filesystem for BlockCryptFs {
    fn destroy(&mut self) {
        info!("Unmounting {}", self.backing.root().display());
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.child_of(parent, name).and_then(|path| self.entry(&path)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("getattr", &e)),
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
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?})", ino, size);

        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.do_readlink(ino) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_mknod(parent, name, mode, umask, rdev) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_mkdir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        match self.do_symlink(parent, link_name, target) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        match self.do_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
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
        debug!(
            "write(ino={}, fh={}, offset={}, size={})",
            ino,
            fh,
            offset,
            data.len()
        );

        match self.do_write(fh, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        // Writes are never buffered
        match self.handles.get(fh) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        match self.handles.close(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.do_fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs()");

        match nix::sys::statvfs::statvfs(self.backing.root()) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => {
                error!("statfs error: {}", e);
                reply.error(e as libc::c_int);
            }
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.do_access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.do_create(parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(errno("create", &e)),
        }
    }
}
