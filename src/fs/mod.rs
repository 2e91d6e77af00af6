//! FUSE filesystem implementation
//!
//! Implements the FUSE filesystem interface as a passthrough over a
//! backing directory whose regular files hold encrypted blocks.

mod backing;
mod filesystem;
mod handle;
mod inode;

pub use backing::BackingStore;
pub use filesystem::BlockCryptFs;
pub use handle::{FileHandle, HandleManager};
pub use inode::{file_attr, InodeTable, ROOT_INO};
