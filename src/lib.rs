//! blockcryptfs - Block-encrypting passthrough filesystem
//!
//! This library provides a FUSE filesystem that mirrors a backing directory,
//! storing every regular file as a sequence of independently authenticated
//! encrypted blocks.

pub mod block;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::block::{BlockIo, BlockLayout};
    pub use crate::config::Config;
    pub use crate::crypto::SessionKey;
    pub use crate::error::{Error, Result};
}
