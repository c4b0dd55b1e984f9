// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem, ops::Range};

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util::NumBytes;

pub const TCPA_MAGIC: [u8; 8] = *b"TCPABIOS";

/// Size of the SHA-1 content hash stored in the block.
pub const HASH_SIZE: usize = 20;

/// Size of the RSA signature stored in the block. The vendor only uses 1024-bit
/// keys.
pub const SIGNATURE_SIZE: usize = 128;

/// Number of bytes, starting from the magic, that are covered by the block
/// signature. This includes the content hash and size fields, but not the
/// signature itself.
pub const SIGNED_SIZE: usize = 107;

/// Largest value that fits in the 24-bit content size field.
pub const CONTENT_SIZE_MAX: u64 = 0xff_ffff;

#[derive(Debug, Error)]
pub enum Error {
    #[error("TCPA block at {offset:#x} needs {needed:?}, but only {available:?} remain")]
    BlockTruncated {
        offset: usize,
        needed: NumBytes<usize>,
        available: NumBytes<usize>,
    },
    #[error("Content size {0} does not fit in 24 bits")]
    SizeOutOfRange(u64),
    #[error("Content size {size:?} exceeds working region size {available:?}")]
    ContentSizeTooLarge {
        size: NumBytes<u64>,
        available: NumBytes<usize>,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Raw in-image layout of the TCPA block. Fields not touched by the signing
/// process are kept opaque.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub struct TcpaBlock {
    /// Magic value. This should be equal to [`TCPA_MAGIC`].
    magic: [u8; 8],
    reserved1: [u8; 24],
    /// SHA-1 digest of the first [`Self::content_size`] bytes of the working
    /// region.
    content_hash: [u8; HASH_SIZE],
    reserved2: [u8; 4],
    /// Little-endian 24-bit integer.
    content_size: [u8; 3],
    reserved3: [u8; 51],
    /// Raw RSA signature over the first [`SIGNED_SIZE`] bytes of the block.
    signature: [u8; SIGNATURE_SIZE],
}

impl fmt::Debug for TcpaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpaBlock")
            .field("magic", &self.magic.escape_ascii().to_string())
            .field("content_hash", &hex::encode(self.content_hash))
            .field("content_size", &self.content_size())
            .field("signature", &hex::encode(self.signature))
            .finish_non_exhaustive()
    }
}

impl TcpaBlock {
    pub const SIZE: usize = mem::size_of::<Self>();

    fn check_fits(region: &[u8], offset: usize) -> Result<()> {
        let available = region.len().saturating_sub(offset);

        if available < Self::SIZE {
            return Err(Error::BlockTruncated {
                offset,
                needed: NumBytes(Self::SIZE),
                available: NumBytes(available),
            });
        }

        Ok(())
    }

    /// Get a view of the block located at `offset` in the working region.
    pub fn ref_from_region(region: &[u8], offset: usize) -> Result<&Self> {
        Self::check_fits(region, offset)?;

        // Size was checked above and the type has no alignment requirement.
        Self::ref_from_prefix(&region[offset..])
            .map(|(block, _)| block)
            .map_err(|_| Error::BlockTruncated {
                offset,
                needed: NumBytes(Self::SIZE),
                available: NumBytes(region.len() - offset),
            })
    }

    /// Get a mutable view of the block located at `offset` in the working
    /// region.
    pub fn mut_from_region(region: &mut [u8], offset: usize) -> Result<&mut Self> {
        Self::check_fits(region, offset)?;

        let available = region.len() - offset;

        Self::mut_from_prefix(&mut region[offset..])
            .map(|(block, _)| block)
            .map_err(|_| Error::BlockTruncated {
                offset,
                needed: NumBytes(Self::SIZE),
                available: NumBytes(available),
            })
    }

    pub fn magic(&self) -> [u8; 8] {
        self.magic
    }

    pub fn content_size(&self) -> u64 {
        let [a, b, c] = self.content_size;
        u64::from(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn set_content_size(&mut self, size: u64) -> Result<()> {
        if size > CONTENT_SIZE_MAX {
            return Err(Error::SizeOutOfRange(size));
        }

        let [a, b, c, _, _, _, _, _] = size.to_le_bytes();
        self.content_size = [a, b, c];

        Ok(())
    }

    /// Range of the working region covered by the content hash.
    pub fn content_range(&self, region_len: usize) -> Result<Range<usize>> {
        let size = self.content_size();

        match usize::try_from(size) {
            Ok(s) if s <= region_len => Ok(0..s),
            _ => Err(Error::ContentSizeTooLarge {
                size: NumBytes(size),
                available: NumBytes(region_len),
            }),
        }
    }

    pub fn content_hash(&self) -> [u8; HASH_SIZE] {
        self.content_hash
    }

    pub fn set_content_hash(&mut self, hash: &[u8; HASH_SIZE]) {
        self.content_hash = *hash;
    }

    pub fn signature(&self) -> [u8; SIGNATURE_SIZE] {
        self.signature
    }

    pub fn set_signature(&mut self, signature: &[u8; SIGNATURE_SIZE]) {
        self.signature = *signature;
    }
}

/// Range of the working region covered by the block signature.
pub fn signed_message_range(offset: usize) -> Range<usize> {
    offset..offset + SIGNED_SIZE
}
