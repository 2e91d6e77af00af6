//! Backing directory path mapping
//!
//! Virtual paths are relative to the mount root; the backing store resolves
//! them to paths under the backing directory.

use crate::error::{Error, Result};
use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};

/// Root of the ciphertext tree
#[derive(Debug, Clone)]
pub struct BackingStore {
    root: PathBuf,
}

impl BackingStore {
    /// Open a backing directory, which must already exist
    pub fn new(root: PathBuf) -> Result<Self> {
        let meta = fs::metadata(&root)
            .map_err(|_| Error::NotFound(root.to_string_lossy().to_string()))?;

        if !meta.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to its backing path.
    ///
    /// Leading separators, `.` and `..` components are dropped so a path can
    /// never escape the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let mut resolved = self.root.clone();
        for component in path.components() {
            if let Component::Normal(part) = component {
                resolved.push(part);
            }
        }
        resolved
    }

    /// Get metadata for a virtual path without following symlinks
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        fs::symlink_metadata(self.resolve(path)).map_err(Error::Io)
    }
}
