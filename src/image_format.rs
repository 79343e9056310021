//! Flash image segments and bootloader header handling.

use std::borrow::Cow;

use log::{debug, warn};

use crate::{
    Error,
    flasher::{FlashFrequency, FlashMode, FlashSize},
    target::Chip,
};

/// Magic byte opening every bootloader image header.
pub(crate) const ESP_MAGIC: u8 = 0xE9;

/// A segment of code or data to write to the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment<'a> {
    /// Address to write the segment to.
    pub addr: u32,
    /// Segment payload.
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    /// Creates a new [Segment].
    pub fn new(addr: u32, data: impl Into<Cow<'a, [u8]>>) -> Self {
        Segment {
            addr,
            data: data.into(),
        }
    }

    /// Length of the segment payload in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Borrow the segment for the lifetime of this reference.
    pub fn borrow(&self) -> Segment<'_> {
        Segment {
            addr: self.addr,
            data: Cow::Borrowed(self.data.as_ref()),
        }
    }
}

/// Patches the flash mode, frequency and size fields of a bootloader image
/// header in place.
///
/// Only images placed at the chip's bootloader offset carry the header; other
/// segments are left untouched, as are images whose magic byte does not match
/// (with a warning, since that usually means the wrong file is being
/// flashed).
pub(crate) fn update_flash_params(
    chip: Chip,
    addr: u32,
    image: &mut [u8],
    mode: Option<FlashMode>,
    size: Option<FlashSize>,
    freq: Option<FlashFrequency>,
) -> Result<(), Error> {
    if image.len() < 8 || addr != chip.bootloader_flash_offset() {
        return Ok(());
    }

    if mode.is_none() && size.is_none() && freq.is_none() {
        return Ok(());
    }

    if image[0] != ESP_MAGIC {
        warn!(
            "Image at {addr:#x} does not look like a bootloader image, leaving flash parameters untouched"
        );
        return Ok(());
    }

    let flash_mode = match mode {
        Some(mode) => mode as u8,
        None => image[2],
    };
    let flash_freq = match freq {
        Some(freq) => freq.encode(),
        None => image[3] & 0x0F,
    };
    let flash_size = match size {
        Some(size) => chip.flash_size_code(size)?,
        None => image[3] & 0xF0,
    };

    debug!(
        "Setting flash params to {:#06x}",
        (u16::from(flash_mode) << 8) | u16::from(flash_freq | flash_size)
    );
    image[2] = flash_mode;
    image[3] = flash_freq | flash_size;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootloader_image() -> Vec<u8> {
        let mut image = vec![0u8; 16];
        image[0] = ESP_MAGIC;
        image[2] = FlashMode::Qio as u8;
        image[3] = 0x21; // 4MB, 26 MHz
        image
    }

    #[test]
    fn patches_header_at_bootloader_offset() {
        let mut image = bootloader_image();
        update_flash_params(
            Chip::Esp32,
            0x1000,
            &mut image,
            Some(FlashMode::Dio),
            Some(FlashSize::_8Mb),
            Some(FlashFrequency::_40Mhz),
        )
        .unwrap();

        assert_eq!(image[2], FlashMode::Dio as u8);
        assert_eq!(image[3], 0x30);
    }

    #[test]
    fn keeps_unspecified_fields() {
        let mut image = bootloader_image();
        update_flash_params(Chip::Esp32, 0x1000, &mut image, Some(FlashMode::Dout), None, None)
            .unwrap();

        assert_eq!(image[2], FlashMode::Dout as u8);
        assert_eq!(image[3], 0x21);
    }

    #[test]
    fn ignores_segments_off_the_bootloader_offset() {
        let mut image = bootloader_image();
        let before = image.clone();
        update_flash_params(
            Chip::Esp32,
            0x8000,
            &mut image,
            Some(FlashMode::Dio),
            Some(FlashSize::_8Mb),
            Some(FlashFrequency::_40Mhz),
        )
        .unwrap();

        assert_eq!(image, before);
    }

    #[test]
    fn leaves_unrecognized_images_untouched() {
        let mut image = bootloader_image();
        image[0] = 0x42;
        let before = image.clone();
        update_flash_params(
            Chip::Esp32,
            0x1000,
            &mut image,
            Some(FlashMode::Dio),
            Some(FlashSize::_8Mb),
            Some(FlashFrequency::_40Mhz),
        )
        .unwrap();

        assert_eq!(image, before);
    }
}
