//! Flashable target devices
//!
//! Each supported family is described by an immutable [Chip] capability:
//! the magic values that select it, its register maps, its flash layout
//! quirks, and the efuse decoding used to identify the connected part. The
//! engine only ever talks to a chip through this interface; it is bound once
//! at detection time and never mutated.

use log::warn;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

use crate::{
    Error,
    connection::{Connection, SerialInterface},
    flasher::FlashSize,
};

/// Supported crystal frequencies.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, Serialize, Deserialize)]
#[non_exhaustive]
pub enum XtalFrequency {
    /// 26 MHz
    #[strum(serialize = "26 MHz")]
    _26Mhz,
    /// 40 MHz
    #[default]
    #[strum(serialize = "40 MHz")]
    _40Mhz,
}

impl XtalFrequency {
    /// The frequency in MHz.
    pub fn mhz(self) -> u32 {
        match self {
            XtalFrequency::_26Mhz => 26,
            XtalFrequency::_40Mhz => 40,
        }
    }
}

/// SPI controller register addresses for a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    /// Address of the command register.
    pub fn cmd(&self) -> u32 {
        self.base
    }

    /// Address of the USR register.
    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    /// Address of the USR1 register.
    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    /// Address of the USR2 register.
    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    /// Address of the first data window register.
    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    /// Address of the dedicated MOSI bit-length register, on families which
    /// have one.
    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    /// Address of the dedicated MISO bit-length register, on families which
    /// have one.
    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
    /// ESP8266
    Esp8266,
}

impl Chip {
    /// Create a [Chip] from a magic value.
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        for chip in Chip::iter() {
            if chip.has_magic_value(magic) {
                return Ok(chip);
            }
        }

        Err(Error::ChipDetect(format!(
            "unrecognized magic value: {magic:#x}"
        )))
    }

    /// Check if the chip's magic values contain the specified value
    pub fn has_magic_value(&self, value: u32) -> bool {
        match self {
            Chip::Esp32 => [0x00f0_1d83].contains(&value),
            Chip::Esp32c3 => [
                0x6921_506f, // ECO1 + ECO2
                0x1b31_506f, // ECO3
            ]
            .contains(&value),
            Chip::Esp32s2 => [0x0000_07c6].contains(&value),
            Chip::Esp32s3 => [0x9].contains(&value),
            Chip::Esp8266 => [0xfff0_c101].contains(&value),
        }
    }

    /// SPI controller register addresses for the chip.
    pub fn spi_registers(&self) -> SpiRegisters {
        match self {
            Chip::Esp32 => SpiRegisters {
                base: 0x3ff4_2000,
                usr_offset: 0x1c,
                usr1_offset: 0x20,
                usr2_offset: 0x24,
                w0_offset: 0x80,
                mosi_length_offset: Some(0x28),
                miso_length_offset: Some(0x2c),
            },
            Chip::Esp32c3 | Chip::Esp32s3 => SpiRegisters {
                base: 0x6000_2000,
                usr_offset: 0x18,
                usr1_offset: 0x1c,
                usr2_offset: 0x20,
                w0_offset: 0x58,
                mosi_length_offset: Some(0x24),
                miso_length_offset: Some(0x28),
            },
            Chip::Esp32s2 => SpiRegisters {
                base: 0x3f40_2000,
                usr_offset: 0x18,
                usr1_offset: 0x1c,
                usr2_offset: 0x20,
                w0_offset: 0x58,
                mosi_length_offset: Some(0x24),
                miso_length_offset: Some(0x28),
            },
            // The ESP8266 has no dedicated bit-length registers; lengths are
            // packed into USR1 instead.
            Chip::Esp8266 => SpiRegisters {
                base: 0x6000_0200,
                usr_offset: 0x1c,
                usr1_offset: 0x20,
                usr2_offset: 0x24,
                w0_offset: 0x40,
                mosi_length_offset: None,
                miso_length_offset: None,
            },
        }
    }

    /// UART clock divider register, mask, and crystal divider used to
    /// estimate the crystal frequency.
    fn uart_clkdiv(&self) -> (u32, u32, u32) {
        const UART_CLKDIV_MASK: u32 = 0xfffff;

        match self {
            Chip::Esp32 => (0x3ff4_0014, UART_CLKDIV_MASK, 1),
            Chip::Esp32c3 | Chip::Esp32s3 => (0x6000_0014, UART_CLKDIV_MASK, 1),
            Chip::Esp32s2 => (0x3f40_0014, UART_CLKDIV_MASK, 1),
            Chip::Esp8266 => (0x6000_0014, UART_CLKDIV_MASK, 2),
        }
    }

    /// Returns the base address of the eFuse register block.
    pub fn efuse_reg(&self) -> u32 {
        match self {
            Chip::Esp32 => 0x3ff5_a000,
            Chip::Esp32c3 => 0x6000_8800,
            Chip::Esp32s2 => 0x3f41_a000,
            Chip::Esp32s3 => 0x6000_7000,
            Chip::Esp8266 => 0x3ff0_0050,
        }
    }

    /// Flash offset the second-stage bootloader is written to.
    pub fn bootloader_flash_offset(&self) -> u32 {
        match self {
            Chip::Esp32 | Chip::Esp32s2 => 0x1000,
            Chip::Esp32c3 | Chip::Esp32s3 | Chip::Esp8266 => 0x0,
        }
    }

    /// Encodes a flash size into the code carried by the bootloader image
    /// header.
    pub fn flash_size_code(&self, size: FlashSize) -> Result<u8, Error> {
        use FlashSize::*;

        let encoded = match self {
            Chip::Esp8266 => match size {
                _256Kb => Some(0x10),
                _512Kb => Some(0x00),
                _1Mb => Some(0x20),
                _2Mb => Some(0x30),
                _4Mb => Some(0x40),
                _8Mb => Some(0x80),
                _16Mb => Some(0x90),
            },
            _ => match size {
                _1Mb => Some(0x00),
                _2Mb => Some(0x10),
                _4Mb => Some(0x20),
                _8Mb => Some(0x30),
                _16Mb => Some(0x40),
                _ => None,
            },
        };

        encoded.ok_or(Error::UnsupportedFlashSize { chip: *self, size })
    }

    /// Number of bytes to erase ahead of writing `size` bytes at `offset`.
    ///
    /// The ESP8266 ROM miscounts sectors spanning the first block boundary,
    /// so the erase length is shortened to stop the ROM from erasing past the
    /// region.
    pub fn erase_size(&self, offset: u32, size: u32) -> u32 {
        const SECTOR_SIZE: u32 = 0x1000;
        const SECTORS_PER_BLOCK: u32 = 16;

        match self {
            Chip::Esp8266 => {
                let num_sectors = size.div_ceil(SECTOR_SIZE);
                let start_sector = offset / SECTOR_SIZE;
                let head_sectors =
                    (SECTORS_PER_BLOCK - start_sector % SECTORS_PER_BLOCK).min(num_sectors);

                if num_sectors < 2 * head_sectors {
                    num_sectors.div_ceil(2) * SECTOR_SIZE
                } else {
                    (num_sectors - head_sectors) * SECTOR_SIZE
                }
            }
            _ => size,
        }
    }

    /// Reads the raw word at the given index of the eFuse block.
    pub async fn read_efuse<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
        word: u32,
    ) -> Result<u32, Error> {
        connection.read_reg(self.efuse_reg() + word * 4).await
    }

    /// Reads the chip's factory MAC address from the eFuse words holding it.
    pub async fn mac_address<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<String, Error> {
        let mac = match self {
            Chip::Esp32 => {
                let mac0 = self.read_efuse(connection, 1).await?;
                let mac1 = self.read_efuse(connection, 2).await?;

                [
                    (mac1 >> 8) as u8,
                    mac1 as u8,
                    (mac0 >> 24) as u8,
                    (mac0 >> 16) as u8,
                    (mac0 >> 8) as u8,
                    mac0 as u8,
                ]
            }
            Chip::Esp32c3 | Chip::Esp32s2 | Chip::Esp32s3 => {
                // MAC words sit at a fixed offset into the eFuse block on the
                // newer families.
                let base = self.efuse_reg() + 0x44;
                let mac0 = connection.read_reg(base).await?;
                let mac1 = connection.read_reg(base + 4).await? & 0xffff;

                [
                    (mac1 >> 8) as u8,
                    mac1 as u8,
                    (mac0 >> 24) as u8,
                    (mac0 >> 16) as u8,
                    (mac0 >> 8) as u8,
                    mac0 as u8,
                ]
            }
            Chip::Esp8266 => {
                let mac0 = self.read_efuse(connection, 0).await?;
                let mac1 = self.read_efuse(connection, 1).await?;
                let mac3 = self.read_efuse(connection, 3).await?;

                let oui = if mac3 != 0 {
                    [(mac3 >> 16) as u8, (mac3 >> 8) as u8, mac3 as u8]
                } else if (mac1 >> 16) & 0xff == 0 {
                    [0x18, 0xfe, 0x34]
                } else if (mac1 >> 16) & 0xff == 1 {
                    [0xac, 0xd0, 0x74]
                } else {
                    return Err(Error::ChipDetect(
                        "unknown OUI in ESP8266 eFuse".to_string(),
                    ));
                };

                [
                    oui[0],
                    oui[1],
                    oui[2],
                    (mac1 >> 8) as u8,
                    mac1 as u8,
                    (mac0 >> 24) as u8,
                ]
            }
        };

        Ok(mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"))
    }

    /// Human-readable description of the connected part.
    pub async fn chip_description<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<String, Error> {
        match self {
            Chip::Esp32 => {
                let word3 = self.read_efuse(connection, 3).await?;
                let single_core = word3 & 1 != 0;
                let pkg_version = self.esp32_package_version(connection).await?;
                let revision = self.chip_revision(connection).await?.unwrap_or(0);
                let rev3 = revision == 3;

                let mut names = [
                    "ESP32-D0WDQ6",
                    "ESP32-D0WD",
                    "ESP32-D2WD",
                    "",
                    "ESP32-U4WDH",
                    "ESP32-PICO-D4",
                    "ESP32-PICO-V3-02",
                ];
                if single_core {
                    names[0] = "ESP32-S0WDQ6";
                    names[1] = "ESP32-S0WD";
                }
                if rev3 {
                    names[5] = "ESP32-PICO-V3";
                }

                let mut name = names
                    .get(pkg_version as usize)
                    .copied()
                    .unwrap_or("Unknown ESP32")
                    .to_string();
                if rev3 && pkg_version <= 1 {
                    name.push_str("-V3");
                }

                Ok(format!("{name} (revision {revision})"))
            }
            Chip::Esp32c3 => Ok("ESP32-C3".to_string()),
            Chip::Esp32s2 => Ok("ESP32-S2".to_string()),
            Chip::Esp32s3 => Ok("ESP32-S3".to_string()),
            Chip::Esp8266 => {
                if self.esp8266_is_8285(connection).await? {
                    Ok("ESP8285".to_string())
                } else {
                    Ok("ESP8266EX".to_string())
                }
            }
        }
    }

    /// Enumerate the chip's features.
    pub async fn chip_features<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<Vec<&'static str>, Error> {
        match self {
            Chip::Esp32 => {
                let mut features = vec!["WiFi"];

                let word3 = self.read_efuse(connection, 3).await?;

                let disable_bt = word3 & (1 << 1) != 0;
                if !disable_bt {
                    features.push("BT");
                }

                let disable_app_cpu = word3 & (1 << 0) != 0;
                if disable_app_cpu {
                    features.push("Single Core");
                } else {
                    features.push("Dual Core");
                }

                let chip_cpu_freq_rated = word3 & (1 << 13) != 0;
                if chip_cpu_freq_rated {
                    let chip_cpu_freq_low = word3 & (1 << 12) != 0;
                    if chip_cpu_freq_low {
                        features.push("160MHz");
                    } else {
                        features.push("240MHz");
                    }
                }

                let pkg_version = self.esp32_package_version(connection).await?;
                if [2, 4, 5, 6].contains(&pkg_version) {
                    features.push("Embedded Flash");
                }
                if pkg_version == 6 {
                    features.push("Embedded PSRAM");
                }

                let word4 = self.read_efuse(connection, 4).await?;
                let adc_vref = (word4 >> 8) & 0x1f;
                if adc_vref != 0 {
                    features.push("VRef calibration in efuse");
                }

                let blk3_part_reserve = (word3 >> 14) & 0x1;
                if blk3_part_reserve != 0 {
                    features.push("BLK3 partially reserved");
                }

                let word6 = self.read_efuse(connection, 6).await?;
                let coding_scheme = word6 & 0x3;
                features.push(match coding_scheme {
                    0 => "Coding Scheme None",
                    1 => "Coding Scheme 3/4",
                    2 => "Coding Scheme Repeat (UNSUPPORTED)",
                    _ => "Coding Scheme Invalid",
                });

                Ok(features)
            }
            Chip::Esp32c3 => Ok(vec!["WiFi", "BLE"]),
            Chip::Esp32s2 => Ok(vec!["WiFi"]),
            Chip::Esp32s3 => Ok(vec!["WiFi", "BLE"]),
            Chip::Esp8266 => {
                let mut features = vec!["WiFi"];
                if self.esp8266_is_8285(connection).await? {
                    features.push("Embedded Flash");
                }
                Ok(features)
            }
        }
    }

    /// Determine the chip's revision number, on families which encode one.
    pub async fn chip_revision<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<Option<u32>, Error> {
        match self {
            Chip::Esp32 => {
                const APB_CTL_DATE_REG: u32 = 0x3ff6_607c;

                let word3 = self.read_efuse(connection, 3).await?;
                let word5 = self.read_efuse(connection, 5).await?;
                let apb_ctl_date = connection.read_reg(APB_CTL_DATE_REG).await?;

                let rev_bit0 = (word3 >> 15) & 0x1;
                let rev_bit1 = (word5 >> 20) & 0x1;
                let rev_bit2 = (apb_ctl_date >> 31) & 0x1;

                let combine_value = (rev_bit2 << 2) | (rev_bit1 << 1) | rev_bit0;

                Ok(Some(match combine_value {
                    1 => 1,
                    3 => 2,
                    7 => 3,
                    _ => 0,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Estimate the crystal frequency of the chip.
    ///
    /// Derived from the UART clock divider and the connection's known baud
    /// rate, normalized to the two crystals Espressif ships. The newer
    /// families run a fixed 40 MHz crystal.
    pub async fn xtal_frequency<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<XtalFrequency, Error> {
        match self {
            Chip::Esp32 | Chip::Esp8266 => {
                let (clkdiv_reg, clkdiv_mask, xtal_divider) = self.uart_clkdiv();

                let uart_div = connection.read_reg(clkdiv_reg).await? & clkdiv_mask;
                let est_xtal = (connection.baud()? as f64 * uart_div as f64)
                    / 1_000_000.0
                    / xtal_divider as f64;
                let norm_xtal = if est_xtal > 33.0 {
                    XtalFrequency::_40Mhz
                } else {
                    XtalFrequency::_26Mhz
                };

                if (norm_xtal.mhz() as f64 - est_xtal).abs() > 1.0 {
                    warn!("Unsupported crystal in use (estimated {est_xtal:.1} MHz)");
                }

                Ok(norm_xtal)
            }
            _ => Ok(XtalFrequency::_40Mhz), // Fixed frequency
        }
    }

    /// Hook invoked once after detection, before any stub upload.
    ///
    /// No supported family currently needs fixup here; the hook exists so a
    /// family can claim one without touching the engine.
    pub async fn post_connect<P: SerialInterface>(
        &self,
        _connection: &mut Connection<P>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Returns the package version based on the eFuses for ESP32
    async fn esp32_package_version<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<u32, Error> {
        let word3 = self.read_efuse(connection, 3).await?;

        let pkg_version = (word3 >> 9) & 0x7;
        let pkg_version = pkg_version + (((word3 >> 2) & 0x1) << 3);

        Ok(pkg_version)
    }

    /// Whether the part is an ESP8285 with embedded flash.
    async fn esp8266_is_8285<P: SerialInterface>(
        &self,
        connection: &mut Connection<P>,
    ) -> Result<bool, Error> {
        let word0 = self.read_efuse(connection, 0).await?;
        let word3 = self.read_efuse(connection, 3).await?;

        Ok(word0 & (1 << 4) != 0 || word3 & (1 << 16) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_magic_values_bind_their_family() {
        assert_eq!(Chip::from_magic(0x00f01d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x6921506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x1b31506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x000007c6).unwrap(), Chip::Esp32s2);
        assert_eq!(Chip::from_magic(0x9).unwrap(), Chip::Esp32s3);
        assert_eq!(Chip::from_magic(0xfff0c101).unwrap(), Chip::Esp8266);
    }

    #[test]
    fn unknown_magic_value_is_a_detection_error() {
        assert!(matches!(
            Chip::from_magic(0xdeadbeef),
            Err(Error::ChipDetect(_))
        ));
    }

    #[test]
    fn erase_size_is_identity_except_esp8266() {
        assert_eq!(Chip::Esp32.erase_size(0x1000, 0x4321), 0x4321);
        assert_eq!(Chip::Esp32s3.erase_size(0, 0x10000), 0x10000);
    }

    #[test]
    fn esp8266_erase_size_works_around_the_rom_bug() {
        // Four sectors starting at the block boundary: erase is halved.
        assert_eq!(Chip::Esp8266.erase_size(0, 0x4000), 0x2000);
        // A full block and one more: the head block is excluded.
        assert_eq!(Chip::Esp8266.erase_size(0, 0x20000), 0x10000);
        // Unaligned start shortens the head.
        assert_eq!(Chip::Esp8266.erase_size(0xf000, 0x8000), 0x7000);
    }

    #[test]
    fn flash_size_codes_differ_per_family() {
        assert_eq!(Chip::Esp32.flash_size_code(FlashSize::_4Mb).unwrap(), 0x20);
        assert_eq!(
            Chip::Esp8266.flash_size_code(FlashSize::_4Mb).unwrap(),
            0x40
        );
        assert!(matches!(
            Chip::Esp32.flash_size_code(FlashSize::_256Kb),
            Err(Error::UnsupportedFlashSize { .. })
        ));
    }
}
