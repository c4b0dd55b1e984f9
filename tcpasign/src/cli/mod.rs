/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    ffi::OsStr,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Args;
use tempfile::NamedTempFile;

use crate::{format::layout::FirmwareImage, util};

pub mod args;
pub mod info;
pub mod sign;
pub mod verify;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        println!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;

#[derive(Debug, Args)]
pub struct ImageGroup {
    /// Path to input BIOS image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Use Sandy Bridge/Ivy Bridge compatibility mode.
    ///
    /// Needed for Intel Core 2nd and 3rd generation ThinkPads. This is ignored
    /// for full SPI images that start with an Intel flash descriptor.
    #[arg(long)]
    pub sandy: bool,
}

#[derive(Debug, Args)]
pub struct ProviderGroup {
    /// Use the openssl command line tool for RSA operations.
    ///
    /// By default, all RSA operations are performed in-process.
    #[arg(
        long,
        value_name = "PROGRAM",
        value_parser,
        num_args = 0..=1,
        default_missing_value = "openssl"
    )]
    pub openssl: Option<PathBuf>,
}

/// Load and resolve a BIOS image.
pub fn read_image(group: &ImageGroup) -> Result<FirmwareImage> {
    let data = fs::read(&group.input)
        .with_context(|| format!("Failed to read BIOS image: {:?}", group.input))?;

    let image = FirmwareImage::resolve(data, group.sandy)
        .with_context(|| format!("Failed to parse BIOS image: {:?}", group.input))?;

    status!("Using {} layout", image.layout());

    Ok(image)
}

/// Write a BIOS image via a temporary file in the output directory so that a
/// failure never leaves a partially written output behind.
pub fn write_image(path: &Path, image: FirmwareImage) -> Result<()> {
    let mut temp_writer = NamedTempFile::with_prefix_in(
        path.file_name()
            .unwrap_or_else(|| OsStr::new("tcpasign.tmp")),
        util::parent_path(path),
    )
    .context("Failed to open temporary output file")?;
    let temp_path = temp_writer.path().to_owned();

    temp_writer
        .write_all(&image.into_bytes())
        .with_context(|| format!("Failed to write BIOS image: {temp_path:?}"))?;
    temp_writer
        .flush()
        .with_context(|| format!("Failed to flush BIOS image: {temp_path:?}"))?;

    // NamedTempFile forces 600 permissions on temp files because it's the safe
    // option for a shared /tmp. Since we're writing to the output file's
    // directory, just mimic umask.
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::prelude::PermissionsExt};

        use rustix::{fs::Mode, process::umask};

        let mask = umask(Mode::empty());
        umask(mask);

        // Mac uses a 16-bit value.
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(0o666 & !mask.bits());

        temp_writer
            .as_file()
            .set_permissions(Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions to {mode:o}: {temp_path:?}"))?;
    }

    temp_writer.persist(path).with_context(|| {
        format!("Failed to move temporary file to output path: {temp_path:?} -> {path:?}")
    })?;

    Ok(())
}
