/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    cli::{self, ImageGroup, ProviderGroup, status, warning},
    crypto::{CryptoProvider, OpensslProvider, RustCryptoProvider},
    format::layout::FirmwareImage,
    signer::{self, HashStatus, SignatureStatus, VerifyReport},
};

fn verify_with<P: CryptoProvider>(provider: &P, image: &FirmwareImage) -> Result<VerifyReport> {
    signer::verify_image(provider, image).context("Failed to verify TCPA block")
}

fn dump_artifacts(cli: &VerifyCli, image: &FirmwareImage) -> Result<()> {
    if let Some(p) = &cli.dump_public_key {
        let envelope =
            signer::public_key_envelope(image).context("Failed to build public key")?;

        fs::write(p, envelope).with_context(|| format!("Failed to write public key: {p:?}"))?;
    }

    if let Some(p) = &cli.dump_signature {
        let signature = image
            .block()
            .context("Failed to read TCPA block")?
            .signature();

        fs::write(p, signature).with_context(|| format!("Failed to write signature: {p:?}"))?;
    }

    Ok(())
}

pub fn verify_main(cli: &VerifyCli) -> Result<()> {
    let image = cli::read_image(&cli.image)?;

    status!("Found TCPABIOS section at {:#x}", image.tcpa_offset());

    let report = match &cli.provider.openssl {
        Some(program) => {
            let provider =
                OpensslProvider::new(program).context("Failed to set up openssl provider")?;
            verify_with(&provider, &image)?
        }
        None => verify_with(&RustCryptoProvider, &image)?,
    };

    dump_artifacts(cli, &image)?;

    status!("Hash found: {}", hex::encode(report.stored_hash));

    match report.hash {
        HashStatus::Match => status!("Hashes match"),
        HashStatus::Mismatch => {
            warning!("Hashes do not match");
            warning!("Calculated hash: {}", hex::encode(report.computed_hash));
        }
    }

    match report.signature {
        SignatureStatus::Valid => status!("Signature is valid"),
        SignatureStatus::Invalid => warning!("Signature is NOT valid"),
    }

    if !report.is_valid() {
        bail!("TCPA block verification failed");
    }

    Ok(())
}

/// Verify the TCPA block of a BIOS image.
///
/// Both the content hash and the block signature are checked. The signature is
/// checked against the modulus embedded in the image itself.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    #[command(flatten)]
    pub image: ImageGroup,

    /// Write the DER-encoded public key rebuilt from the embedded modulus.
    #[arg(long, value_name = "FILE", value_parser)]
    pub dump_public_key: Option<PathBuf>,

    /// Write the raw signature stored in the TCPA block.
    #[arg(long, value_name = "FILE", value_parser)]
    pub dump_signature: Option<PathBuf>,

    #[command(flatten)]
    pub provider: ProviderGroup,
}
