// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Size of the modulus as stored in the image. This is the DER INTEGER
/// contents for a 1024-bit modulus, so there is a leading zero byte to keep the
/// value positive.
pub const MODULUS_SIZE: usize = 129;

/// DER prefix of a SubjectPublicKeyInfo holding a 1024-bit RSA key, up to and
/// including the modulus INTEGER length.
pub const PUB_KEY_HEADER: [u8; 28] = [
    0x30, 0x81, 0x9d, 0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01,
    0x05, 0x00, 0x03, 0x81, 0x8b, 0x00, 0x30, 0x81, 0x87, 0x02, 0x81, 0x81,
];

/// DER encoding of the public exponent INTEGER. The firmware only uses e = 3.
pub const PUB_KEY_FOOTER: [u8; 3] = [0x02, 0x01, 0x03];

pub const ENVELOPE_SIZE: usize = PUB_KEY_HEADER.len() + MODULUS_SIZE + PUB_KEY_FOOTER.len();

#[derive(Debug, Error)]
pub enum Error {
    #[error("DER public key ({len} bytes) is not a 1024-bit RSA SubjectPublicKeyInfo")]
    MalformedKey { len: usize },
    #[error("Modulus at {offset:#x} does not fit in {region_len} byte working region")]
    ModulusOutOfBounds { offset: usize, region_len: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// Get the raw modulus bytes from a DER-encoded SubjectPublicKeyInfo.
pub fn extract_modulus(der: &[u8]) -> Result<[u8; MODULUS_SIZE]> {
    let start = PUB_KEY_HEADER.len();
    let end = start + MODULUS_SIZE;

    if der.len() < end || der[..start] != PUB_KEY_HEADER {
        return Err(Error::MalformedKey { len: der.len() });
    }

    let mut modulus = [0u8; MODULUS_SIZE];
    modulus.copy_from_slice(&der[start..end]);

    Ok(modulus)
}

/// Rebuild a DER-encoded SubjectPublicKeyInfo from the raw modulus. The
/// resulting key always has a public exponent of 3.
pub fn build_envelope(modulus: &[u8; MODULUS_SIZE]) -> Vec<u8> {
    let mut der = Vec::with_capacity(ENVELOPE_SIZE);
    der.extend_from_slice(&PUB_KEY_HEADER);
    der.extend_from_slice(modulus);
    der.extend_from_slice(&PUB_KEY_FOOTER);
    der
}

fn checked_range(region_len: usize, offset: usize) -> Result<std::ops::Range<usize>> {
    offset
        .checked_add(MODULUS_SIZE)
        .filter(|end| *end <= region_len)
        .map(|end| offset..end)
        .ok_or(Error::ModulusOutOfBounds { offset, region_len })
}

/// Read the modulus stored at `offset` in the working region.
pub fn read_modulus(region: &[u8], offset: usize) -> Result<[u8; MODULUS_SIZE]> {
    let range = checked_range(region.len(), offset)?;

    let mut modulus = [0u8; MODULUS_SIZE];
    modulus.copy_from_slice(&region[range]);

    Ok(modulus)
}

/// Overwrite the modulus stored at `offset` in the working region.
pub fn embed_modulus(region: &mut [u8], offset: usize, modulus: &[u8; MODULUS_SIZE]) -> Result<()> {
    let range = checked_range(region.len(), offset)?;

    region[range].copy_from_slice(modulus);

    Ok(())
}
