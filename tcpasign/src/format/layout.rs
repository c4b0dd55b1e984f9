// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use memchr::memmem;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::tcpa::{self, TCPA_MAGIC, TcpaBlock},
    util::NumBytes,
};

/// Intel flash descriptor signature found at the start of full SPI images.
pub const INTEL_IMAGE_HEADER: [u8; 19] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x5a, 0xa5, 0xf0,
];

/// Offset of the BIOS region in Broadwell SPI images. Everything before it
/// (descriptor, ME firmware, etc.) is kept as is.
pub const BROADWELL_BIOS_REGION_OFFSET: usize = 10 * 1024 * 1024;

/// Size of the capsule header on Sandy Bridge and Ivy Bridge BIOS updates.
pub const SANDY_PREFIX_SIZE: usize = 72;

/// "LenovoTpmOemPei" as UTF-16 code units, minus the final zero byte.
pub const LENOVO_TPM_OEM_PEI_HEADER: [u8; 29] = [
    0x4c, 0x00, 0x65, 0x00, 0x6e, 0x00, 0x6f, 0x00, 0x76, 0x00, 0x6f, 0x00, 0x54, 0x00, 0x70, 0x00,
    0x6d, 0x00, 0x4f, 0x00, 0x65, 0x00, 0x6d, 0x00, 0x50, 0x00, 0x65, 0x00, 0x69,
];

/// Distance from [`LENOVO_TPM_OEM_PEI_HEADER`] to the modulus.
pub const LENOVO_MODULUS_DISTANCE: usize = 82;

/// Modulus anchor used by Sandy Bridge and Ivy Bridge firmware.
pub const SANDY_MODULUS_HEADER: [u8; 18] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x12, 0x04,
];

/// Distance from [`SANDY_MODULUS_HEADER`] to the modulus.
pub const SANDY_MODULUS_DISTANCE: usize = 18;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{layout} image needs more than {prefix:?}, but is only {actual:?}")]
    ImageTooSmall {
        layout: Layout,
        prefix: NumBytes<usize>,
        actual: NumBytes<usize>,
    },
    #[error("Could not find TCPABIOS section")]
    MarkerNotFound,
    #[error("Could not find modulus")]
    ModulusAnchorNotFound,
    #[error("TCPA block error")]
    Tcpa(#[from] tcpa::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// The whole file is the BIOS region.
    Plain,
    /// Sandy Bridge and Ivy Bridge update images with a fixed size header.
    SandyCompat,
    /// Full SPI flash dump with the descriptor and ME regions in front.
    Broadwell,
}

impl Layout {
    /// Pick the layout for an image. A flash descriptor always wins over the
    /// compatibility flag.
    pub fn detect(data: &[u8], sandy: bool) -> Self {
        if data.starts_with(&INTEL_IMAGE_HEADER) {
            Self::Broadwell
        } else if sandy {
            Self::SandyCompat
        } else {
            Self::Plain
        }
    }

    /// Size of the opaque prefix that is excluded from parsing.
    pub fn prefix_size(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::SandyCompat => SANDY_PREFIX_SIZE,
            Self::Broadwell => BROADWELL_BIOS_REGION_OFFSET,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("Plain"),
            Self::SandyCompat => f.write_str("Sandy/Ivy Bridge"),
            Self::Broadwell => f.write_str("Broadwell"),
        }
    }
}

/// Find the offset of the modulus within the working region. Only Sandy Bridge
/// and Ivy Bridge firmware use a different anchor.
pub fn find_modulus(region: &[u8], layout: Layout) -> Option<usize> {
    match layout {
        Layout::SandyCompat => {
            memmem::find(region, &SANDY_MODULUS_HEADER).map(|o| o + SANDY_MODULUS_DISTANCE)
        }
        Layout::Plain | Layout::Broadwell => memmem::find(region, &LENOVO_TPM_OEM_PEI_HEADER)
            .map(|o| o + LENOVO_MODULUS_DISTANCE),
    }
}

/// A firmware image split into an opaque prefix and the working region that
/// holds the TCPA block. The buffer is never resized, so [`Self::into_bytes`]
/// always returns the same number of bytes that were passed in.
pub struct FirmwareImage {
    data: Vec<u8>,
    layout: Layout,
    tcpa_offset: usize,
    modulus_offset: Option<usize>,
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("size", &NumBytes(self.data.len()))
            .field("layout", &self.layout)
            .field("tcpa_offset", &format_args!("{:#x}", self.tcpa_offset))
            .field("modulus_offset", &self.modulus_offset)
            .finish_non_exhaustive()
    }
}

impl FirmwareImage {
    /// Detect the layout and locate the TCPA block and modulus. A missing
    /// modulus is not an error here, but every operation that needs it will
    /// fail with [`Error::ModulusAnchorNotFound`].
    pub fn resolve(data: Vec<u8>, sandy: bool) -> Result<Self> {
        let layout = Layout::detect(&data, sandy);
        let prefix_size = layout.prefix_size();

        if data.len() < prefix_size {
            return Err(Error::ImageTooSmall {
                layout,
                prefix: NumBytes(prefix_size),
                actual: NumBytes(data.len()),
            });
        }

        debug!("Detected {layout} layout with {:?} prefix", NumBytes(prefix_size));

        let region = &data[prefix_size..];

        let tcpa_offset = memmem::find(region, &TCPA_MAGIC).ok_or(Error::MarkerNotFound)?;
        debug!("Found TCPA block at region offset {tcpa_offset:#x}");

        // Fail early instead of on the first field access.
        TcpaBlock::ref_from_region(region, tcpa_offset)?;

        let modulus_offset = find_modulus(region, layout);
        match modulus_offset {
            Some(o) => debug!("Found modulus at region offset {o:#x}"),
            None => warn!("Could not find modulus anchor"),
        }

        Ok(Self {
            data,
            layout,
            tcpa_offset,
            modulus_offset,
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Bytes before the working region.
    pub fn prefix(&self) -> &[u8] {
        &self.data[..self.layout.prefix_size()]
    }

    pub fn region(&self) -> &[u8] {
        &self.data[self.layout.prefix_size()..]
    }

    pub fn region_mut(&mut self) -> &mut [u8] {
        let prefix_size = self.layout.prefix_size();
        &mut self.data[prefix_size..]
    }

    /// Offset of the TCPA block relative to the working region.
    pub fn tcpa_offset(&self) -> usize {
        self.tcpa_offset
    }

    /// Offset of the modulus relative to the working region.
    pub fn modulus_offset(&self) -> Result<usize> {
        self.modulus_offset.ok_or(Error::ModulusAnchorNotFound)
    }

    pub fn block(&self) -> Result<&TcpaBlock> {
        Ok(TcpaBlock::ref_from_region(self.region(), self.tcpa_offset)?)
    }

    pub fn block_mut(&mut self) -> Result<&mut TcpaBlock> {
        let offset = self.tcpa_offset;
        Ok(TcpaBlock::mut_from_region(self.region_mut(), offset)?)
    }

    /// Serialize the image. This is the opaque prefix followed by the working
    /// region.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
