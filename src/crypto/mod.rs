//! Cryptography module for blockcryptfs
//!
//! Provides XChaCha20-Poly1305 block encryption with an Argon2id-derived
//! session key. Every physical block carries its own random nonce.

mod encryption;
mod kdf;
mod keys;

pub use encryption::{BlockCipher, PhysicalBlock};
pub use kdf::{derive_key, generate_salt, DerivedKey};
pub use keys::SessionKey;

/// Size of the XChaCha20-Poly1305 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the extended nonce in bytes
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Fixed per-block cost of nonce + tag
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;
