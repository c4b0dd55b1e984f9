// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Signing and verification of the TCPA block.
//!
//! The firmware does not use PKCS#1 v1.5. The verifier applies the raw RSA
//! public key operation to the stored signature and compares the last 20 bytes
//! of the result with the SHA-1 digest of the block. There is no padding and no
//! DigestInfo, so the signed message is just zeros followed by the digest.

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    crypto::{self, CryptoProvider, KEY_BITS, KEY_EXPONENT},
    format::{
        layout::{self, FirmwareImage},
        modulus::{self, MODULUS_SIZE},
        tcpa::{self, HASH_SIZE, SIGNATURE_SIZE},
    },
    util::{self, NumBytes},
};

/// Number of zero bytes in front of the block hash in the signed message.
pub const MESSAGE_PADDING: usize = SIGNATURE_SIZE - HASH_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature is {0} bytes, but {SIGNATURE_SIZE} bytes are needed")]
    InvalidSignatureLength(usize),
    #[error("Image layout error")]
    Layout(#[from] layout::Error),
    #[error("TCPA block error")]
    Tcpa(#[from] tcpa::Error),
    #[error("Modulus error")]
    Modulus(#[from] modulus::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashStatus {
    Match,
    Mismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    Invalid,
}

/// Outcome of [`verify_image`]. Mismatches are reported here instead of being
/// returned as errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    pub content_size: u64,
    pub stored_hash: [u8; HASH_SIZE],
    pub computed_hash: [u8; HASH_SIZE],
    pub hash: HashStatus,
    pub signature: SignatureStatus,
}

impl VerifyReport {
    pub fn is_valid(&self) -> bool {
        self.hash == HashStatus::Match && self.signature == SignatureStatus::Valid
    }
}

/// Compute the digest of `region[0..content_size]`.
pub fn content_hash(image: &FirmwareImage) -> Result<[u8; HASH_SIZE]> {
    let region = image.region();
    let range = image.block()?.content_range(region.len())?;

    Ok(crypto::sha1(&region[range]))
}

/// Compute the digest of the signed part of the TCPA block.
pub fn block_hash(image: &FirmwareImage) -> Result<[u8; HASH_SIZE]> {
    // Bounds were checked when the image was resolved.
    let range = tcpa::signed_message_range(image.tcpa_offset());

    Ok(crypto::sha1(&image.region()[range]))
}

/// Build the message that is passed to the raw RSA private key operation.
pub fn build_message(hash: &[u8; HASH_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let mut message = [0u8; SIGNATURE_SIZE];
    message[MESSAGE_PADDING..].copy_from_slice(hash);
    message
}

/// Recompute the content hash and store it in the TCPA block.
pub fn update_content_hash(image: &mut FirmwareImage) -> Result<[u8; HASH_SIZE]> {
    let hash = content_hash(image)?;
    image.block_mut()?.set_content_hash(&hash);

    Ok(hash)
}

/// Sign the TCPA block and store the signature. The content hash must already
/// be up to date since it is covered by the signature.
pub fn sign_block<P: CryptoProvider>(
    provider: &P,
    image: &mut FirmwareImage,
    key: &P::PrivateKey,
) -> Result<()> {
    let message = build_message(&block_hash(image)?);
    let signature = provider.raw_sign(&message, key)?;

    let signature: [u8; SIGNATURE_SIZE] = signature
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidSignatureLength(signature.len()))?;

    image.block_mut()?.set_signature(&signature);

    Ok(())
}

/// Get the public key envelope for the modulus embedded in the image.
pub fn public_key_envelope(image: &FirmwareImage) -> Result<Vec<u8>> {
    let offset = image.modulus_offset()?;
    let modulus = modulus::read_modulus(image.region(), offset)?;

    Ok(modulus::build_envelope(&modulus))
}

/// Check the stored signature against the modulus embedded in the image. A
/// key or signature that the provider rejects is [`SignatureStatus::Invalid`].
/// A provider that cannot run at all is an error.
pub fn verify_block<P: CryptoProvider>(
    provider: &P,
    image: &FirmwareImage,
) -> Result<SignatureStatus> {
    let signature = image.block()?.signature();
    let envelope = public_key_envelope(image)?;
    let expected = block_hash(image)?;

    if util::is_zero(&signature) {
        warn!("TCPA block has an empty signature");
    }

    let recovered = match provider.raw_verify(&signature, &envelope) {
        Ok(r) => r,
        Err(e) if e.is_verification_failure() => {
            warn!("Public key operation failed: {e}");
            return Ok(SignatureStatus::Invalid);
        }
        Err(e) => return Err(e.into()),
    };

    // Only the tail is checked. The rest is whatever the signer put there.
    let tail = recovered
        .len()
        .checked_sub(HASH_SIZE)
        .map(|start| &recovered[start..]);

    let status = if tail == Some(expected.as_slice()) {
        SignatureStatus::Valid
    } else {
        SignatureStatus::Invalid
    };

    Ok(status)
}

/// Replace the modulus embedded in the image with the one from `key`.
pub fn embed_public_key<P: CryptoProvider>(
    provider: &P,
    image: &mut FirmwareImage,
    key: &P::PrivateKey,
) -> Result<[u8; MODULUS_SIZE]> {
    let offset = image.modulus_offset()?;
    let der = provider.export_public_key_der(key)?;
    let modulus = modulus::extract_modulus(&der)?;

    modulus::embed_modulus(image.region_mut(), offset, &modulus)?;

    Ok(modulus)
}

/// Run the signing pipeline: update the content hash, sign the TCPA block, and
/// replace the embedded modulus. If `key` is [`None`], a new key is generated.
/// The key that was used is returned.
pub fn sign_image<P: CryptoProvider>(
    provider: &P,
    image: &mut FirmwareImage,
    key: Option<P::PrivateKey>,
) -> Result<P::PrivateKey> {
    // Nothing is modified if the modulus can't be replaced.
    let modulus_offset = image.modulus_offset()?;
    modulus::read_modulus(image.region(), modulus_offset)?;

    let content_size = image.block()?.content_size();
    info!("Calculating hash over {:?}", NumBytes(content_size));
    let hash = update_content_hash(image)?;
    info!("Replaced content hash: {}", hex::encode(hash));

    let key = match key {
        Some(k) => k,
        None => {
            info!("Generating {KEY_BITS}-bit private key");
            provider.generate_keypair(KEY_BITS, KEY_EXPONENT)?
        }
    };

    info!("Signing TCPA block");
    sign_block(provider, image, &key)?;

    info!("Replacing modulus");
    embed_public_key(provider, image, &key)?;

    Ok(key)
}

/// Run the verification pipeline. Only structural problems, like a missing
/// TCPA block or modulus, are returned as errors.
pub fn verify_image<P: CryptoProvider>(
    provider: &P,
    image: &FirmwareImage,
) -> Result<VerifyReport> {
    let block = image.block()?;
    let content_size = block.content_size();
    let stored_hash = block.content_hash();

    info!("Calculating hash over {:?}", NumBytes(content_size));
    let computed_hash = content_hash(image)?;

    let hash = if stored_hash == computed_hash {
        HashStatus::Match
    } else {
        HashStatus::Mismatch
    };

    info!("Verifying signature");
    let signature = verify_block(provider, image)?;

    Ok(VerifyReport {
        content_size,
        stored_hash,
        computed_hash,
        hash,
        signature,
    })
}
