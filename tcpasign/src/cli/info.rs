/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::{self, ImageGroup},
    format::modulus,
    signer, util,
};

pub fn info_main(cli: &InfoCli) -> Result<()> {
    let image = cli::read_image(&cli.image)?;
    let block = image.block().context("Failed to read TCPA block")?;

    println!("Layout:         {}", image.layout());
    println!("Prefix size:    {:?}", util::NumBytes(image.prefix().len()));
    println!("TCPA offset:    {:#x}", image.tcpa_offset());
    println!("Content size:   {:?}", util::NumBytes(block.content_size()));
    println!("Content hash:   {}", hex::encode(block.content_hash()));
    println!(
        "Block hash:     {}",
        hex::encode(signer::block_hash(&image).context("Failed to hash TCPA block")?)
    );

    let signature = block.signature();
    if util::is_zero(&signature) {
        println!("Signature:      <empty>");
    } else {
        println!("Signature:      {}", hex::encode(signature));
    }

    match image.modulus_offset() {
        Ok(offset) => {
            let modulus = modulus::read_modulus(image.region(), offset)
                .context("Failed to read modulus")?;

            println!("Modulus offset: {offset:#x}");
            println!("Modulus:        {}", hex::encode(modulus));
        }
        Err(e) => println!("Modulus offset: <{e}>"),
    }

    Ok(())
}

/// Display TCPA block information.
///
/// Nothing is verified. Use the `verify` subcommand to check the hash and
/// signature.
#[derive(Debug, Parser)]
pub struct InfoCli {
    #[command(flatten)]
    pub image: ImageGroup,
}
