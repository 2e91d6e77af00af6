//! XChaCha20-Poly1305 Block Encryption
//!
//! Every physical block is sealed independently:
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//! No associated data is bound. Decryption is all-or-nothing: a tag mismatch
//! yields `AuthenticationFailure` and no plaintext.

use crate::crypto::{SessionKey, NONCE_SIZE, OVERHEAD};
use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use zeroize::Zeroizing;

/// One on-disk block: nonce followed by authenticated ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalBlock {
    /// Nonce used for this encryption (fresh on every write)
    nonce: [u8; NONCE_SIZE],
    /// Ciphertext with appended authentication tag
    ciphertext: Vec<u8>,
}

impl PhysicalBlock {
    /// Get the nonce
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Get the ciphertext including its tag
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Total size on disk
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    /// Length of the plaintext this block decrypts to
    pub fn plaintext_len(&self) -> usize {
        self.len() - OVERHEAD
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse a block read from storage.
    ///
    /// `index` is only used for error reporting.
    pub fn from_bytes(index: u64, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < OVERHEAD {
            return Err(Error::CorruptBlock {
                block: index,
                len: bytes.len(),
            });
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        Ok(PhysicalBlock {
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Block codec bound to the session key
#[derive(Clone)]
pub struct BlockCipher {
    key: Arc<SessionKey>,
}

impl BlockCipher {
    /// Create a codec sharing the session key
    pub fn new(key: Arc<SessionKey>) -> Self {
        BlockCipher { key }
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.key()))
    }

    /// Seal one block of plaintext under a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<PhysicalBlock> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| Error::Entropy(e.to_string()))?;

        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Encryption("Block encryption failed".to_string()))?;

        Ok(PhysicalBlock { nonce, ciphertext })
    }

    /// Open one block; `index` is only used for error reporting
    pub fn decrypt(&self, index: u64, block: &PhysicalBlock) -> Result<Zeroizing<Vec<u8>>> {
        self.cipher()
            .decrypt(XNonce::from_slice(&block.nonce), block.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| Error::AuthenticationFailure { block: index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_SIZE, TAG_SIZE};

    fn test_cipher() -> BlockCipher {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        BlockCipher::new(Arc::new(SessionKey::from_bytes(&key).unwrap()))
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = test_cipher();
        let plaintext = b"Hello, blockcryptfs!";

        let block = cipher.encrypt(plaintext).unwrap();
        assert_eq!(block.len(), NONCE_SIZE + TAG_SIZE + plaintext.len());
        assert_eq!(block.plaintext_len(), plaintext.len());

        let decrypted = cipher.decrypt(0, &block).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_empty_and_full_block() {
        let cipher = test_cipher();

        for len in [0usize, 1, 4056] {
            let plaintext = vec![0x5Au8; len];
            let block = cipher.encrypt(&plaintext).unwrap();
            assert_eq!(block.len(), len + OVERHEAD);
            assert_eq!(cipher.decrypt(0, &block).unwrap().as_slice(), &plaintext[..]);
        }
    }

    #[test]
    fn test_nonce_freshness() {
        let cipher = test_cipher();
        let plaintext = [0x11u8; 64];

        let a = cipher.encrypt(&plaintext).unwrap();
        let b = cipher.encrypt(&plaintext).unwrap();

        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let cipher = test_cipher();
        let stored = cipher.encrypt(b"tamper me please").unwrap().to_bytes();

        for byte in 0..stored.len() {
            for bit in [0u8, 3, 7] {
                let mut tampered = stored.clone();
                tampered[byte] ^= 1 << bit;

                let block = PhysicalBlock::from_bytes(9, &tampered).unwrap();
                let result = cipher.decrypt(9, &block);
                assert!(
                    matches!(result, Err(Error::AuthenticationFailure { block: 9 })),
                    "flip of byte {} bit {} was not detected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let block = test_cipher().encrypt(b"Secret data").unwrap();
        let result = test_cipher().decrypt(0, &block);
        assert!(matches!(result, Err(Error::AuthenticationFailure { .. })));
    }

    #[test]
    fn test_serialization() {
        let cipher = test_cipher();
        let block = cipher.encrypt(b"Test serialization").unwrap();

        let bytes = block.to_bytes();
        assert_eq!(&bytes[..NONCE_SIZE], block.nonce());
        assert_eq!(&bytes[NONCE_SIZE..], block.ciphertext());

        let restored = PhysicalBlock::from_bytes(0, &bytes).unwrap();
        assert_eq!(restored, block);
        assert_eq!(cipher.decrypt(0, &restored).unwrap().as_slice(), b"Test serialization");
    }

    #[test]
    fn test_short_block_is_corrupt() {
        let result = PhysicalBlock::from_bytes(4, &[0u8; OVERHEAD - 1]);
        assert!(matches!(
            result,
            Err(Error::CorruptBlock { block: 4, len: 39 })
        ));
    }
}
