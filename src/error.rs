//! Error types for blockcryptfs

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for blockcryptfs
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Authentication failed for block {block}: data corrupted or wrong key")]
    AuthenticationFailure { block: u64 },

    #[error("Corrupt block {block}: {len} bytes is shorter than the block overhead")]
    CorruptBlock { block: u64, len: usize },

    #[error("Entropy source failed: {0}")]
    Entropy(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Filesystem errors
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Invalid file handle: {0}")]
    InvalidFileHandle(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request too large: {size} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge { size: u64, limit: u64 },

    #[error("Out of memory reserving {0} bytes")]
    OutOfMemory(usize),

    // Config errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied => libc::EACCES,
            Error::InvalidFileHandle(_) => libc::EBADF,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::RequestTooLarge { .. } => libc::EFBIG,
            Error::OutOfMemory(_) => libc::ENOMEM,
            Error::AuthenticationFailure { .. } | Error::CorruptBlock { .. } => libc::EBADMSG,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Whether this error signals tampered or corrupted ciphertext
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailure { .. } | Error::CorruptBlock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_has_distinct_errno() {
        let auth = Error::AuthenticationFailure { block: 3 };
        let corrupt = Error::CorruptBlock { block: 0, len: 7 };

        assert_eq!(auth.to_errno(), libc::EBADMSG);
        assert_eq!(corrupt.to_errno(), libc::EBADMSG);
        assert!(auth.is_corruption());
        assert_ne!(auth.to_errno(), Error::NotFound("x".into()).to_errno());
        assert_ne!(auth.to_errno(), Error::PermissionDenied.to_errno());
    }

    #[test]
    fn test_io_errno_passthrough() {
        let e = Error::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.to_errno(), libc::ENOSPC);

        let e = Error::from(io::Error::new(io::ErrorKind::Other, "no errno"));
        assert_eq!(e.to_errno(), libc::EIO);
        assert!(!e.is_corruption());
    }
}
