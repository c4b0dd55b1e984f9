/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{path::PathBuf, time::Instant};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::{self, ImageGroup, ProviderGroup, status},
    crypto::{CryptoProvider, OpensslProvider, RustCryptoProvider},
    format::layout::FirmwareImage,
    signer,
};

fn sign_with<P: CryptoProvider>(
    provider: &P,
    cli: &SignCli,
    image: &mut FirmwareImage,
) -> Result<()> {
    let key = match &cli.key {
        Some(p) => Some(
            provider
                .load_private_key(p)
                .with_context(|| format!("Failed to load key: {p:?}"))?,
        ),
        None => None,
    };

    let key = signer::sign_image(provider, image, key).context("Failed to sign TCPA block")?;

    if let Some(p) = &cli.output_key {
        provider
            .save_private_key(&key, p)
            .with_context(|| format!("Failed to write private key: {p:?}"))?;
        status!("Saved private key to {p:?}");
    }

    Ok(())
}

pub fn sign_main(cli: &SignCli) -> Result<()> {
    let start = Instant::now();

    let mut image = cli::read_image(&cli.image)?;

    match &cli.provider.openssl {
        Some(program) => {
            let provider =
                OpensslProvider::new(program).context("Failed to set up openssl provider")?;
            sign_with(&provider, cli, &mut image)?;
        }
        None => sign_with(&RustCryptoProvider, cli, &mut image)?,
    }

    status!("Saving resulting file to {:?}", cli.output);
    cli::write_image(&cli.output, image)?;

    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Re-sign the TCPA block of a BIOS image.
///
/// The content hash is recalculated, the block is signed with a 1024-bit RSA
/// key (exponent 3), and the embedded modulus is replaced with the key's
/// modulus. A new key is generated unless one is specified.
#[derive(Debug, Parser)]
pub struct SignCli {
    #[command(flatten)]
    pub image: ImageGroup,

    /// Path to output BIOS image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Path to existing private key in PEM format.
    ///
    /// The key must be 1024 bits with a public exponent of 3.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub key: Option<PathBuf>,

    /// Save the private key that was used for signing.
    #[arg(long, value_name = "FILE", value_parser)]
    pub output_key: Option<PathBuf>,

    #[command(flatten)]
    pub provider: ProviderGroup,
}
