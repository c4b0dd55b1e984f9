/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    cell::RefCell,
    io,
    path::Path,
    process::{Command, Stdio},
    sync::OnceLock,
};

use assert_matches::assert_matches;
use rsa::RsaPrivateKey;

use tcpasign::{
    crypto::{self, CryptoProvider, KEY_BITS, KEY_EXPONENT, OpensslProvider, RustCryptoProvider},
    format::{
        layout::{
            self, BROADWELL_BIOS_REGION_OFFSET, FirmwareImage, INTEL_IMAGE_HEADER,
            LENOVO_MODULUS_DISTANCE, LENOVO_TPM_OEM_PEI_HEADER, Layout, SANDY_MODULUS_DISTANCE,
            SANDY_MODULUS_HEADER, SANDY_PREFIX_SIZE,
        },
        modulus::{self, MODULUS_SIZE},
        tcpa::{self, TCPA_MAGIC},
    },
    signer::{self, HashStatus, SignatureStatus},
};

const TCPA_OFFSET: usize = 1000;
const CONTENT_SIZE: usize = 1000;
const ANCHOR_OFFSET: usize = 2048;

fn test_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

    KEY.get_or_init(|| {
        RustCryptoProvider
            .generate_keypair(KEY_BITS, KEY_EXPONENT)
            .unwrap()
    })
    .clone()
}

#[derive(Clone, Copy)]
enum Anchor {
    Lenovo,
    Sandy,
    Missing,
}

/// Build a working region with a TCPA block at [`TCPA_OFFSET`] and a modulus
/// anchor at [`ANCHOR_OFFSET`]. The filler never contains 0xff, so it can't
/// accidentally form any of the markers.
fn build_region(len: usize, anchor: Anchor) -> Vec<u8> {
    let mut region = (0..len).map(|i| (i % 241) as u8).collect::<Vec<_>>();

    region[TCPA_OFFSET..TCPA_OFFSET + TCPA_MAGIC.len()].copy_from_slice(&TCPA_MAGIC);
    region[TCPA_OFFSET + 56..TCPA_OFFSET + 59]
        .copy_from_slice(&u32::try_from(CONTENT_SIZE).unwrap().to_le_bytes()[..3]);

    match anchor {
        Anchor::Lenovo => {
            region[ANCHOR_OFFSET..ANCHOR_OFFSET + LENOVO_TPM_OEM_PEI_HEADER.len()]
                .copy_from_slice(&LENOVO_TPM_OEM_PEI_HEADER);
        }
        Anchor::Sandy => {
            region[ANCHOR_OFFSET..ANCHOR_OFFSET + SANDY_MODULUS_HEADER.len()]
                .copy_from_slice(&SANDY_MODULUS_HEADER);
        }
        Anchor::Missing => {}
    }

    region
}

fn lenovo_modulus_offset() -> usize {
    ANCHOR_OFFSET + LENOVO_MODULUS_DISTANCE
}

fn signed_plain_image() -> FirmwareImage {
    let mut image = FirmwareImage::resolve(build_region(4096, Anchor::Lenovo), false).unwrap();
    signer::sign_image(&RustCryptoProvider, &mut image, Some(test_key())).unwrap();
    image
}

fn reload(image: FirmwareImage, sandy: bool) -> FirmwareImage {
    FirmwareImage::resolve(image.into_bytes(), sandy).unwrap()
}

fn flip_byte(image: FirmwareImage, offset: usize) -> FirmwareImage {
    let sandy = image.layout() == Layout::SandyCompat;
    let prefix_size = image.layout().prefix_size();
    let mut data = image.into_bytes();
    data[prefix_size + offset] ^= 0x01;

    FirmwareImage::resolve(data, sandy).unwrap()
}

#[test]
fn round_trip_plain_image() {
    let image = reload(signed_plain_image(), false);

    let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
    assert_eq!(report.hash, HashStatus::Match);
    assert_eq!(report.signature, SignatureStatus::Valid);
    assert_eq!(report.content_size, CONTENT_SIZE as u64);
    assert!(report.is_valid());
}

#[test]
fn signing_patches_expected_fields() {
    let original = build_region(4096, Anchor::Lenovo);
    let key = test_key();

    let mut image = FirmwareImage::resolve(original.clone(), false).unwrap();
    signer::sign_image(&RustCryptoProvider, &mut image, Some(key.clone())).unwrap();
    let signed = image.into_bytes();

    assert_eq!(signed.len(), original.len());

    // Content hash.
    let hash = crypto::sha1(&original[..CONTENT_SIZE]);
    assert_eq!(&signed[TCPA_OFFSET + 32..TCPA_OFFSET + 52], &hash);

    // Modulus.
    let der = RustCryptoProvider.export_public_key_der(&key).unwrap();
    let offset = lenovo_modulus_offset();
    assert_eq!(
        &signed[offset..offset + MODULUS_SIZE],
        &modulus::extract_modulus(&der).unwrap()
    );
    assert_eq!(signed[offset], 0);

    // Everything that isn't one of the three fields is untouched.
    for (i, (a, b)) in original.iter().zip(&signed).enumerate() {
        let in_hash = (TCPA_OFFSET + 32..TCPA_OFFSET + 52).contains(&i);
        let in_sig = (TCPA_OFFSET + 110..TCPA_OFFSET + 238).contains(&i);
        let in_modulus = (offset..offset + MODULUS_SIZE).contains(&i);

        if !in_hash && !in_sig && !in_modulus {
            assert_eq!(a, b, "Byte {i} changed");
        }
    }
}

#[test]
fn content_corruption_is_hash_mismatch() {
    for offset in [0, 500, CONTENT_SIZE - 1] {
        let image = flip_byte(signed_plain_image(), offset);

        let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
        assert_eq!(report.hash, HashStatus::Mismatch, "Offset {offset}");
        assert_ne!(report.stored_hash, report.computed_hash);
        // The block itself is unchanged.
        assert_eq!(report.signature, SignatureStatus::Valid);
        assert!(!report.is_valid());
    }
}

#[test]
fn data_after_content_is_not_hashed() {
    let image = flip_byte(signed_plain_image(), CONTENT_SIZE + TCPA_OFFSET);

    let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
    assert!(report.is_valid());
}

#[test]
fn block_corruption_is_invalid_signature() {
    // Avoid the magic, the content hash, and the content size since those
    // change the outcome in other ways.
    for relative in [8, 20, 53, 60, 106] {
        let image = flip_byte(signed_plain_image(), TCPA_OFFSET + relative);

        let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
        assert_eq!(report.hash, HashStatus::Match, "Offset +{relative}");
        assert_eq!(report.signature, SignatureStatus::Invalid, "Offset +{relative}");
    }
}

#[test]
fn stored_hash_corruption_fails_both_checks() {
    let image = flip_byte(signed_plain_image(), TCPA_OFFSET + 40);

    let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
    assert_eq!(report.hash, HashStatus::Mismatch);
    assert_eq!(report.signature, SignatureStatus::Invalid);
}

#[test]
fn signature_corruption_is_invalid_signature() {
    let image = flip_byte(signed_plain_image(), TCPA_OFFSET + 200);

    let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
    assert_eq!(report.hash, HashStatus::Match);
    assert_eq!(report.signature, SignatureStatus::Invalid);
}

#[test]
fn modulus_corruption_is_invalid_signature() {
    let image = flip_byte(signed_plain_image(), lenovo_modulus_offset() + 64);

    let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
    assert_eq!(report.hash, HashStatus::Match);
    assert_eq!(report.signature, SignatureStatus::Invalid);
}

#[test]
fn broadwell_scenario() {
    let image_size = 16 * 1024 * 1024;

    let mut data = vec![0u8; BROADWELL_BIOS_REGION_OFFSET];
    data[..INTEL_IMAGE_HEADER.len()].copy_from_slice(&INTEL_IMAGE_HEADER);
    data[4096] = 0xa5;
    data.extend_from_slice(&build_region(
        image_size - BROADWELL_BIOS_REGION_OFFSET,
        Anchor::Lenovo,
    ));
    assert_eq!(data.len(), image_size);

    let expected_hash =
        crypto::sha1(&data[BROADWELL_BIOS_REGION_OFFSET..BROADWELL_BIOS_REGION_OFFSET + 1000]);
    let original_prefix = data[..BROADWELL_BIOS_REGION_OFFSET].to_vec();

    // The compatibility flag must not matter.
    let mut image = FirmwareImage::resolve(data, true).unwrap();
    assert_eq!(image.layout(), Layout::Broadwell);
    assert_eq!(image.tcpa_offset(), 1000);

    // Sign with a freshly generated key.
    signer::sign_image(&RustCryptoProvider, &mut image, None).unwrap();

    let signed = image.into_bytes();
    assert_eq!(signed.len(), image_size);
    assert_eq!(&signed[..BROADWELL_BIOS_REGION_OFFSET], original_prefix);
    assert_eq!(
        &signed[BROADWELL_BIOS_REGION_OFFSET + 1032..BROADWELL_BIOS_REGION_OFFSET + 1052],
        &expected_hash
    );

    let image = FirmwareImage::resolve(signed, false).unwrap();
    let report = signer::verify_image(&RustCryptoProvider, &image).unwrap();
    assert!(report.is_valid());
}

#[test]
fn sandy_round_trip() {
    let mut data = vec![0x11u8; SANDY_PREFIX_SIZE];
    data.extend_from_slice(&build_region(4096, Anchor::Sandy));

    let mut image = FirmwareImage::resolve(data.clone(), true).unwrap();
    assert_eq!(image.layout(), Layout::SandyCompat);
    assert_eq!(
        image.modulus_offset().unwrap(),
        ANCHOR_OFFSET + SANDY_MODULUS_DISTANCE
    );

    signer::sign_image(&RustCryptoProvider, &mut image, Some(test_key())).unwrap();
    let signed = image.into_bytes();

    assert_eq!(&signed[..SANDY_PREFIX_SIZE], &data[..SANDY_PREFIX_SIZE]);
    assert_eq!(
        &signed[SANDY_PREFIX_SIZE + TCPA_OFFSET + 32..SANDY_PREFIX_SIZE + TCPA_OFFSET + 52],
        &crypto::sha1(&data[SANDY_PREFIX_SIZE..SANDY_PREFIX_SIZE + CONTENT_SIZE])
    );

    let image = FirmwareImage::resolve(signed, true).unwrap();
    assert!(signer::verify_image(&RustCryptoProvider, &image).unwrap().is_valid());
}

#[test]
fn missing_anchor_aborts_before_mutation() {
    let data = build_region(4096, Anchor::Missing);
    let mut image = FirmwareImage::resolve(data.clone(), false).unwrap();

    assert_matches!(
        signer::sign_image(&RustCryptoProvider, &mut image, Some(test_key())),
        Err(signer::Error::Layout(layout::Error::ModulusAnchorNotFound))
    );
    assert_eq!(image.into_bytes(), data);

    let image = FirmwareImage::resolve(data, false).unwrap();
    assert_matches!(
        signer::verify_image(&RustCryptoProvider, &image),
        Err(signer::Error::Layout(layout::Error::ModulusAnchorNotFound))
    );
}

#[test]
fn missing_marker_is_fatal() {
    let mut data = build_region(4096, Anchor::Lenovo);
    data[TCPA_OFFSET] = b'X';

    assert_matches!(
        FirmwareImage::resolve(data, false),
        Err(layout::Error::MarkerNotFound)
    );
}

#[test]
fn oversized_content_is_rejected() {
    let mut image = FirmwareImage::resolve(build_region(4096, Anchor::Lenovo), false).unwrap();
    image.block_mut().unwrap().set_content_size(4097).unwrap();

    assert_matches!(
        signer::sign_image(&RustCryptoProvider, &mut image, Some(test_key())),
        Err(signer::Error::Tcpa(tcpa::Error::ContentSizeTooLarge { .. }))
    );
    assert_matches!(
        signer::verify_image(&RustCryptoProvider, &image),
        Err(signer::Error::Tcpa(tcpa::Error::ContentSizeTooLarge { .. }))
    );
}

/// Records what is passed to the provider and returns canned results.
#[derive(Default)]
struct FakeProvider {
    signature: Vec<u8>,
    recovered: Vec<u8>,
    verify_error: Option<fn() -> crypto::Error>,
    messages: RefCell<Vec<Vec<u8>>>,
}

impl CryptoProvider for FakeProvider {
    type PrivateKey = ();

    fn generate_keypair(&self, _bits: usize, _exponent: u32) -> Result<(), crypto::Error> {
        Ok(())
    }

    fn export_public_key_der(&self, _key: &()) -> Result<Vec<u8>, crypto::Error> {
        Ok(modulus::build_envelope(&[0x42; MODULUS_SIZE]))
    }

    fn raw_sign(&self, message: &[u8], _key: &()) -> Result<Vec<u8>, crypto::Error> {
        self.messages.borrow_mut().push(message.to_vec());
        Ok(self.signature.clone())
    }

    fn raw_verify(
        &self,
        _signature: &[u8],
        _public_key_der: &[u8],
    ) -> Result<Vec<u8>, crypto::Error> {
        match self.verify_error {
            Some(error) => Err(error()),
            None => Ok(self.recovered.clone()),
        }
    }

    fn load_private_key(&self, _path: &Path) -> Result<(), crypto::Error> {
        Ok(())
    }

    fn save_private_key(&self, _key: &(), _path: &Path) -> Result<(), crypto::Error> {
        Ok(())
    }
}

#[test]
fn message_is_zero_padded_block_hash() {
    let provider = FakeProvider {
        signature: vec![0x5a; 128],
        ..Default::default()
    };
    let mut image = FirmwareImage::resolve(build_region(4096, Anchor::Lenovo), false).unwrap();

    signer::sign_image(&provider, &mut image, Some(())).unwrap();

    let block_hash = signer::block_hash(&image).unwrap();
    let messages = provider.messages.borrow();
    assert_eq!(messages.len(), 1);
    assert_eq!(&messages[0][..108], &[0u8; 108]);
    assert_eq!(&messages[0][108..], &block_hash);

    assert_eq!(image.block().unwrap().signature(), [0x5a; 128]);
    assert_eq!(
        modulus::read_modulus(image.region(), lenovo_modulus_offset()).unwrap(),
        [0x42; MODULUS_SIZE]
    );
}

#[test]
fn recovered_tail_decides_validity() {
    let image = FirmwareImage::resolve(build_region(4096, Anchor::Lenovo), false).unwrap();
    let block_hash = signer::block_hash(&image).unwrap();

    let mut recovered = vec![0xcc; 108];
    recovered.extend_from_slice(&block_hash);
    let provider = FakeProvider {
        recovered,
        ..Default::default()
    };
    assert_eq!(
        signer::verify_block(&provider, &image).unwrap(),
        SignatureStatus::Valid
    );

    let provider = FakeProvider {
        recovered: vec![0u8; 10],
        ..Default::default()
    };
    assert_eq!(
        signer::verify_block(&provider, &image).unwrap(),
        SignatureStatus::Invalid
    );
}

#[test]
fn short_signature_is_rejected() {
    let provider = FakeProvider {
        signature: vec![0x5a; 127],
        ..Default::default()
    };
    let original = build_region(4096, Anchor::Lenovo);
    let mut image = FirmwareImage::resolve(original.clone(), false).unwrap();

    assert_matches!(
        signer::sign_block(&provider, &mut image, &()),
        Err(signer::Error::InvalidSignatureLength(127))
    );
    assert_eq!(image.into_bytes(), original);
}

#[test]
fn rejected_key_or_signature_is_invalid() {
    let image = signed_plain_image();

    let errors: [fn() -> crypto::Error; 3] = [
        || crypto::Error::InvalidSignatureLength(127, 128),
        || crypto::Error::RsaVerify(Box::new(rsa::Error::Verification)),
        || crypto::Error::LoadPubKey(rsa::pkcs8::spki::Error::KeyMalformed),
    ];

    for error in errors {
        let provider = FakeProvider {
            verify_error: Some(error),
            ..Default::default()
        };

        assert_eq!(
            signer::verify_block(&provider, &image).unwrap(),
            SignatureStatus::Invalid
        );
    }
}

#[test]
fn provider_environment_failure_is_fatal() {
    let image = signed_plain_image();

    let errors: [fn() -> crypto::Error; 2] = [
        || crypto::Error::TempDir(io::Error::other("no space")),
        || crypto::Error::WriteFile("pub_key.der".into(), io::Error::other("no space")),
    ];

    for error in errors {
        let provider = FakeProvider {
            verify_error: Some(error),
            ..Default::default()
        };

        assert_matches!(
            signer::verify_block(&provider, &image),
            Err(signer::Error::Crypto(_))
        );
    }

    let provider = OpensslProvider::new("/nonexistent/openssl").unwrap();
    assert_matches!(
        signer::verify_image(&provider, &image),
        Err(signer::Error::Crypto(crypto::Error::CommandSpawn(_, _)))
    );
}

/// Only available when the openssl binary can be found.
fn openssl_provider() -> Option<OpensslProvider> {
    let available = Command::new("openssl")
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success());

    if !available {
        eprintln!("Skipping test: openssl not found");
        return None;
    }

    Some(OpensslProvider::new("openssl").unwrap())
}

#[test]
fn openssl_round_trip() {
    let Some(openssl) = openssl_provider() else {
        return;
    };

    let mut image = FirmwareImage::resolve(build_region(4096, Anchor::Lenovo), false).unwrap();
    let key = signer::sign_image(&openssl, &mut image, None).unwrap();

    let image = reload(image, false);
    assert!(signer::verify_image(&openssl, &image).unwrap().is_valid());

    let der = openssl.export_public_key_der(&key).unwrap();
    assert_eq!(
        modulus::read_modulus(image.region(), lenovo_modulus_offset()).unwrap(),
        modulus::extract_modulus(&der).unwrap()
    );

    let image = flip_byte(image, TCPA_OFFSET + 200);
    let report = signer::verify_image(&openssl, &image).unwrap();
    assert_eq!(report.hash, HashStatus::Match);
    assert_eq!(report.signature, SignatureStatus::Invalid);
}

#[test]
fn openssl_and_rust_providers_agree() {
    let Some(openssl) = openssl_provider() else {
        return;
    };

    // Signed by openssl, verified in-process.
    let mut image = FirmwareImage::resolve(build_region(4096, Anchor::Lenovo), false).unwrap();
    signer::sign_image(&openssl, &mut image, None).unwrap();
    let image = reload(image, false);
    assert!(signer::verify_image(&RustCryptoProvider, &image).unwrap().is_valid());

    // Signed in-process, verified by openssl.
    let image = reload(signed_plain_image(), false);
    assert!(signer::verify_image(&openssl, &image).unwrap().is_valid());

    let image = flip_byte(image, lenovo_modulus_offset() + 64);
    let report = signer::verify_image(&openssl, &image).unwrap();
    assert_eq!(report.signature, SignatureStatus::Invalid);
}
