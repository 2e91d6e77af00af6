//! Key Derivation Functions using Argon2id
//!
//! The passphrase is the only secret input; the salt lives in the config
//! file so the same passphrase re-derives the same key on every mount.

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// Derived key with associated salt
#[derive(Clone)]
pub struct DerivedKey {
    /// The derived key material (zeroized on drop)
    key: Zeroizing<[u8; KEY_SIZE]>,
    /// Salt used for derivation
    salt: [u8; SALT_SIZE],
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Get the salt
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

/// Derive a key from a passphrase using Argon2id
///
/// # Arguments
/// * `password` - The passphrase to derive from
/// * `salt` - Exactly `SALT_SIZE` bytes of salt
/// * `config` - Encryption configuration with Argon2 parameters
pub fn derive_key(password: &[u8], salt: &[u8], config: &EncryptionConfig) -> Result<DerivedKey> {
    if salt.len() != SALT_SIZE {
        return Err(Error::KeyDerivation(format!(
            "Salt must be {} bytes, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let mut salt_bytes = [0u8; SALT_SIZE];
    salt_bytes.copy_from_slice(salt);

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key_bytes = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password, &salt_bytes, key_bytes.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey {
        key: key_bytes,
        salt: salt_bytes,
    })
}

/// Generate a random salt from the OS entropy source
pub fn generate_salt() -> Result<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| Error::Entropy(e.to_string()))?;
    Ok(salt)
}
