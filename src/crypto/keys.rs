//! Session key management
//!
//! A mount holds exactly one content key for its lifetime:
//! - Passphrase + salt go through Argon2id to produce a master key
//! - The content key is expanded from the master key with HKDF-SHA256
//!
//! The passphrase buffer is consumed and zeroized by derivation, and the key
//! material never leaves this type except by reference to the block cipher.

use crate::config::EncryptionConfig;
use crate::crypto::{derive_key, KEY_SIZE};
use crate::error::{Error, Result};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use std::fmt;
use zeroize::Zeroizing;

/// HKDF info label for the file content key
const CONTENT_KEY_INFO: &[u8] = b"blockcryptfs-content-v1";

/// Symmetric key used for every block of the mount
pub struct SessionKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl SessionKey {
    /// Derive the session key from a passphrase.
    ///
    /// Takes ownership of the passphrase so that it is wiped as soon as
    /// derivation returns, successful or not.
    pub fn from_passphrase(
        passphrase: Zeroizing<Vec<u8>>,
        config: &EncryptionConfig,
    ) -> Result<Self> {
        if config.salt.is_empty() {
            return Err(Error::KeyDerivation(
                "No salt configured; run `blockcryptfs init` first".to_string(),
            ));
        }

        let derived = derive_key(&passphrase, &config.salt, config)?;
        drop(passphrase);

        let key = expand_content_key(derived.key(), derived.salt())?;
        Ok(SessionKey { key })
    }

    /// Wrap existing key material
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(SessionKey { key })
    }

    /// Get the raw key bytes
    pub(crate) fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

fn expand_content_key(master: &[u8; KEY_SIZE], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(master);

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    prk.expand(&[CONTENT_KEY_INFO], HkdfKeyType)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
        .fill(&mut output[..])
        .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

    Ok(output)
}

/// HKDF key type for ring
struct HkdfKeyType;

impl hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}
