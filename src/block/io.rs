//! Content I/O over encrypted backing files
//!
//! Reads decode whole physical blocks and copy out the requested window.
//! Writes always replace whole physical blocks: a block that is only partly
//! covered is read, merged, and re-sealed under a fresh nonce. Callers are
//! responsible for serializing writers of the same backing file.

use crate::block::BlockLayout;
use crate::config::IoConfig;
use crate::crypto::{BlockCipher, PhysicalBlock, SessionKey};
use crate::error::{Error, Result};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::{trace, warn};
use zeroize::Zeroizing;

/// Content engine shared by every open file of a mount
#[derive(Clone)]
pub struct BlockIo {
    layout: BlockLayout,
    cipher: BlockCipher,
    max_request_size: usize,
}

impl BlockIo {
    /// Create an engine from explicit parts
    pub fn new(layout: BlockLayout, cipher: BlockCipher, max_request_size: usize) -> Self {
        BlockIo {
            layout,
            cipher,
            max_request_size,
        }
    }

    /// Create an engine from the I/O configuration and the session key
    pub fn from_config(config: &IoConfig, key: Arc<SessionKey>) -> Result<Self> {
        Ok(Self::new(
            BlockLayout::new(config.block_size)?,
            BlockCipher::new(key),
            config.max_request_size,
        ))
    }

    /// Block geometry
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Largest read or write accepted
    pub fn max_request_size(&self) -> usize {
        self.max_request_size
    }

    /// Logical (plaintext) length of a backing file
    pub fn logical_len(&self, file: &File) -> Result<u64> {
        Ok(self.layout.logical_size(file.metadata()?.len()))
    }

    /// Read up to `len` plaintext bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at end of file. Any block failing
    /// authentication aborts the whole read.
    pub fn read(&self, file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_request(len)?;
        self.check_range(offset, len)?;

        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory(len))?;

        let full = self.layout.plaintext_block_size();
        let (mut index, mut delta) = self.layout.locate(offset);

        while out.len() < len {
            let plaintext = match self.read_block(file, index)? {
                Some(p) => p,
                None => break,
            };

            if delta >= plaintext.len() {
                break;
            }

            let take = (len - out.len()).min(plaintext.len() - delta);
            out.extend_from_slice(&plaintext[delta..delta + take]);

            // A short block is always the last one
            if plaintext.len() < full {
                break;
            }

            index += 1;
            delta = 0;
        }

        trace!(offset, requested = len, returned = out.len(), "read complete");
        Ok(out)
    }

    /// Write `data` at logical `offset`, returning the number of bytes written.
    ///
    /// Writing past the current end zero-fills the gap. Every gap block is
    /// sealed and written before this returns, so the cost grows with the
    /// distance from the old end, not with `data.len()`.
    pub fn write(&self, file: &File, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_request(data.len())?;

        if data.is_empty() {
            return Ok(0);
        }

        self.check_range(offset, data.len())?;

        let size = self.logical_len(file)?;
        self.splice(file, size, offset, data)?;

        trace!(offset, len = data.len(), "write complete");
        Ok(data.len())
    }

    /// Set the logical length of a backing file.
    ///
    /// Shrinking re-seals the new trailing partial block; growing zero-fills
    /// and so costs one block write per gap block, the same as [`write`]
    /// past the end.
    ///
    /// [`write`]: BlockIo::write
    pub fn truncate(&self, file: &File, new_len: u64) -> Result<()> {
        let physical_len = self.layout.physical_size(new_len)?;
        let size = self.logical_len(file)?;

        if new_len > size {
            return self.splice(file, size, new_len, &[]);
        }

        let (index, tail) = self.layout.locate(new_len);
        if tail > 0 && new_len < size {
            let mut plaintext = self
                .read_block(file, index)?
                .ok_or(Error::CorruptBlock { block: index, len: 0 })?;
            plaintext.truncate(tail);
            self.write_block(file, index, &plaintext)?;
        }

        file.set_len(physical_len)?;
        trace!(from = size, to = new_len, "truncate complete");
        Ok(())
    }

    /// Rewrite every block touched by `[min(offset, size), offset + data.len())`.
    ///
    /// `size` is the current logical length. Bytes between `size` and
    /// `offset` become zeros; existing bytes outside the written range are
    /// preserved.
    fn splice(&self, file: &File, size: u64, offset: u64, data: &[u8]) -> Result<()> {
        let full = self.layout.plaintext_block_size() as u64;
        let end = offset + data.len() as u64;
        let start = offset.min(size);

        if end <= start {
            return Ok(());
        }

        let first = start / full;
        let last = (end - 1) / full;

        for index in first..=last {
            let block_lo = self.layout.logical_block_start(index)?;
            let block_hi = block_lo + full;
            let fill_hi = end.min(block_hi);

            let covered = offset <= block_lo && end >= block_hi;
            let mut plaintext = if !covered && block_lo < size {
                trace!(block = index, "read-modify-write");
                self.read_block(file, index)?.unwrap_or_default()
            } else {
                Zeroizing::new(Vec::new())
            };

            let new_len = plaintext.len().max((fill_hi - block_lo) as usize);
            plaintext.resize(new_len, 0);

            let copy_lo = offset.max(block_lo);
            if copy_lo < fill_hi {
                let dst = (copy_lo - block_lo) as usize;
                let src = (copy_lo - offset) as usize;
                let n = (fill_hi - copy_lo) as usize;
                plaintext[dst..dst + n].copy_from_slice(&data[src..src + n]);
            }

            self.write_block(file, index, &plaintext)?;
        }

        Ok(())
    }

    /// Read and open one block; `None` past end of file
    fn read_block(&self, file: &File, index: u64) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let mut buf = vec![0u8; self.layout.block_size()];
        let n = read_full_at(file, &mut buf, self.layout.block_start(index)?)?;

        if n == 0 {
            return Ok(None);
        }

        let block = PhysicalBlock::from_bytes(index, &buf[..n])?;
        match self.cipher.decrypt(index, &block) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => {
                warn!(block = index, "block failed authentication");
                Err(e)
            }
        }
    }

    /// Seal and store one block over whatever was there
    fn write_block(&self, file: &File, index: u64, plaintext: &[u8]) -> Result<()> {
        let block = self.cipher.encrypt(plaintext)?;
        file.write_all_at(&block.to_bytes(), self.layout.block_start(index)?)?;
        trace!(block = index, plaintext_len = plaintext.len(), "block written");
        Ok(())
    }

    /// Reject ranges whose end has no representable physical offset
    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            Error::InvalidArgument(format!("range of {} bytes at offset {} overflows", len, offset))
        })?;
        self.layout.physical_size(end)?;
        Ok(())
    }

    fn check_request(&self, len: usize) -> Result<()> {
        if len > self.max_request_size {
            return Err(Error::RequestTooLarge {
                size: len as u64,
                limit: self.max_request_size as u64,
            });
        }
        Ok(())
    }
}

/// Positioned read that only stops short at end of file
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_SIZE, NONCE_SIZE, OVERHEAD};

    const P: usize = 4056;

    fn engine_with_key(key: [u8; KEY_SIZE]) -> BlockIo {
        let key = Arc::new(SessionKey::from_bytes(&key).unwrap());
        BlockIo::from_config(&IoConfig::default(), key).unwrap()
    }

    fn engine() -> BlockIo {
        engine_with_key([0x42; KEY_SIZE])
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn physical_len(file: &File) -> u64 {
        file.metadata().unwrap().len()
    }

    #[test]
    fn test_write_across_block_boundary() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, &pattern(5000, 1)).unwrap();
        let payload = b"0123456789";
        assert_eq!(io.write(&file, 4050, payload).unwrap(), 10);

        assert_eq!(io.read(&file, 4050, 10).unwrap(), payload);

        let mut expected = pattern(5000, 1);
        expected[4050..4060].copy_from_slice(payload);
        assert_eq!(io.read(&file, 0, 5000).unwrap(), expected);
    }

    #[test]
    fn test_write_read_law_over_offsets() {
        let io = engine();

        let cases: &[(u64, usize)] = &[
            (0, 0),
            (0, 1),
            (0, P),
            (0, P + 1),
            (4050, 10),
            (P as u64 - 1, 2),
            (P as u64, P),
            (7, 3 * P + 5),
            (3 * P as u64 + 100, 50),
        ];

        for &(offset, len) in cases {
            let file = tempfile::tempfile().unwrap();
            let payload = pattern(len, offset as u8);

            assert_eq!(io.write(&file, offset, &payload).unwrap(), len);
            assert_eq!(
                io.read(&file, offset, len).unwrap(),
                payload,
                "offset {} len {}",
                offset,
                len
            );
        }
    }

    #[test]
    fn test_unaligned_write_preserves_prefix() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, b"AAAA").unwrap();
        io.write(&file, 2, b"BB").unwrap();

        assert_eq!(io.read(&file, 0, 4).unwrap(), b"AABB");
    }

    #[test]
    fn test_inner_write_preserves_suffix() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, b"AAAAAAAA").unwrap();
        io.write(&file, 1, b"B").unwrap();

        assert_eq!(io.read(&file, 0, 100).unwrap(), b"ABAAAAAA");
        assert_eq!(io.logical_len(&file).unwrap(), 8);
    }

    #[test]
    fn test_short_read_at_eof() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, b"0123456789").unwrap();

        assert_eq!(io.read(&file, 5, 100).unwrap(), b"56789");
        assert!(io.read(&file, 10, 100).unwrap().is_empty());
        assert!(io.read(&file, 50_000, 100).unwrap().is_empty());
    }

    #[test]
    fn test_read_empty_file() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        assert!(io.read(&file, 0, 4096).unwrap().is_empty());
        assert_eq!(io.logical_len(&file).unwrap(), 0);
    }

    #[test]
    fn test_size_law() {
        let io = engine();

        for len in [1usize, 10, P - 1, P, P + 1, 3 * P + 17] {
            let file = tempfile::tempfile().unwrap();
            io.write(&file, 0, &pattern(len, 9)).unwrap();

            assert_eq!(io.logical_len(&file).unwrap(), len as u64);
            assert_eq!(io.logical_len(&file).unwrap(), len as u64);
            assert_eq!(physical_len(&file), io.layout().physical_size(len as u64).unwrap());
        }
    }

    #[test]
    fn test_full_blocks_are_block_sized() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, &pattern(2 * P + 3, 2)).unwrap();
        assert_eq!(physical_len(&file), 2 * 4096 + (3 + OVERHEAD) as u64);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, b"head").unwrap();
        let offset = 2 * P as u64 + 10;
        io.write(&file, offset, b"tail").unwrap();

        assert_eq!(io.logical_len(&file).unwrap(), offset + 4);

        let all = io.read(&file, 0, offset as usize + 4).unwrap();
        assert_eq!(&all[..4], b"head");
        assert!(all[4..offset as usize].iter().all(|&b| b == 0));
        assert_eq!(&all[offset as usize..], b"tail");
    }

    #[test]
    fn test_rewrite_changes_nonce() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        let mut first = [0u8; NONCE_SIZE];
        let mut second = [0u8; NONCE_SIZE];

        io.write(&file, 0, b"same bytes").unwrap();
        file.read_exact_at(&mut first, 0).unwrap();
        io.write(&file, 0, b"same bytes").unwrap();
        file.read_exact_at(&mut second, 0).unwrap();

        assert_ne!(first, second);
        assert_eq!(io.read(&file, 0, 10).unwrap(), b"same bytes");
    }

    #[test]
    fn test_tampered_block_aborts_whole_read() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        io.write(&file, 0, &pattern(2 * P + 100, 4)).unwrap();

        // Flip one ciphertext bit in the second block
        let pos = 4096 + NONCE_SIZE as u64 + 5;
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, pos).unwrap();
        byte[0] ^= 0x01;
        file.write_all_at(&byte, pos).unwrap();

        assert!(io.read(&file, 0, 100).is_ok());
        let result = io.read(&file, 0, 2 * P + 100);
        assert!(matches!(result, Err(Error::AuthenticationFailure { block: 1 })));

        // A write that must merge the damaged block fails too
        let result = io.write(&file, P as u64 + 1, b"x");
        assert!(matches!(result, Err(Error::AuthenticationFailure { block: 1 })));
    }

    #[test]
    fn test_wrong_key_cannot_read() {
        let file = tempfile::tempfile().unwrap();
        engine().write(&file, 0, b"secret").unwrap();

        let other = engine_with_key([0x43; KEY_SIZE]);
        let result = other.read(&file, 0, 6);
        assert!(result.unwrap_err().is_corruption());
    }

    #[test]
    fn test_truncated_fragment_is_corrupt() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        io.write(&file, 0, &pattern(P + 20, 5)).unwrap();

        file.set_len(4096 + 10).unwrap();
        let result = io.read(&file, 0, P + 20);
        assert!(matches!(result, Err(Error::CorruptBlock { block: 1, len: 10 })));
    }

    #[test]
    fn test_truncate_shrink() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        let data = pattern(3 * P, 6);
        io.write(&file, 0, &data).unwrap();

        io.truncate(&file, P as u64 + 7).unwrap();
        assert_eq!(io.logical_len(&file).unwrap(), P as u64 + 7);
        assert_eq!(physical_len(&file), 4096 + 7 + OVERHEAD as u64);
        assert_eq!(io.read(&file, 0, 3 * P).unwrap(), &data[..P + 7]);

        io.truncate(&file, P as u64).unwrap();
        assert_eq!(physical_len(&file), 4096);
        assert_eq!(io.read(&file, 0, 3 * P).unwrap(), &data[..P]);

        io.truncate(&file, 0).unwrap();
        assert_eq!(physical_len(&file), 0);
    }

    #[test]
    fn test_truncate_grow_zero_fills() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        io.write(&file, 0, b"abc").unwrap();

        io.truncate(&file, P as u64 + 1).unwrap();
        assert_eq!(io.logical_len(&file).unwrap(), P as u64 + 1);

        let all = io.read(&file, 0, P + 1).unwrap();
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_grow_seals_every_gap_block() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();
        let len = 10 * P as u64 + 5;

        io.truncate(&file, len).unwrap();
        assert_eq!(physical_len(&file), io.layout().physical_size(len).unwrap());

        for index in 0..10 {
            let block = io.read_block(&file, index).unwrap().unwrap();
            assert_eq!(block.len(), P);
            assert!(block.iter().all(|&b| b == 0));
        }
        assert_eq!(io.read_block(&file, 10).unwrap().unwrap().as_slice(), &[0u8; 5]);
    }

    #[test]
    fn test_out_of_range_offsets_rejected() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        assert!(matches!(
            io.read(&file, u64::MAX - 1, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            io.read(&file, u64::MAX, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            io.truncate(&file, u64::MAX),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            io.write(&file, u64::MAX - 10, b"x"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(physical_len(&file), 0);

        // Offsets just inside the addressable range still read as EOF
        assert!(io.read(&file, u64::MAX / 4, 16).unwrap().is_empty());
    }

    #[test]
    fn test_zero_length_write_creates_nothing() {
        let io = engine();
        let file = tempfile::tempfile().unwrap();

        assert_eq!(io.write(&file, 100, b"").unwrap(), 0);
        assert_eq!(physical_len(&file), 0);
    }

    #[test]
    fn test_request_limit() {
        let key = Arc::new(SessionKey::from_bytes(&[1u8; KEY_SIZE]).unwrap());
        let config = IoConfig {
            block_size: 4096,
            max_request_size: 64,
        };
        let io = BlockIo::from_config(&config, key).unwrap();
        let file = tempfile::tempfile().unwrap();

        assert!(matches!(
            io.write(&file, 0, &[0u8; 65]),
            Err(Error::RequestTooLarge { size: 65, limit: 64 })
        ));
        assert!(matches!(
            io.read(&file, 0, 65),
            Err(Error::RequestTooLarge { .. })
        ));
        assert_eq!(io.write(&file, 0, &[0u8; 64]).unwrap(), 64);
    }

    #[test]
    fn test_small_block_size() {
        let key = Arc::new(SessionKey::from_bytes(&[2u8; KEY_SIZE]).unwrap());
        let config = IoConfig {
            block_size: OVERHEAD + 3,
            max_request_size: 1024,
        };
        let io = BlockIo::from_config(&config, key).unwrap();
        let file = tempfile::tempfile().unwrap();

        io.write(&file, 0, b"abcdefghij").unwrap();
        io.write(&file, 4, b"XY").unwrap();
        assert_eq!(io.read(&file, 0, 10).unwrap(), b"abcdXYghij");
        assert_eq!(physical_len(&file), 3 * (OVERHEAD as u64 + 3) + OVERHEAD as u64 + 1);
    }
}
