//! Write a binary application to a target device
//!
//! The [Flasher] struct abstracts over various operations for writing a binary
//! application to a target device. It additionally provides some operations to
//! read information from the target device.

use std::str::FromStr;

use log::{debug, info, warn};
use md5::{Digest, Md5};
use miniz_oxide::deflate::compress_to_vec_zlib;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

use self::stubs::{
    CHIP_DETECT_MAGIC_REG_ADDR,
    DEFAULT_TIMEOUT,
    EXPECTED_STUB_HANDSHAKE,
    STUB_HANDSHAKE_TIMEOUT,
};
use crate::{
    Error,
    command::{Command, CommandType},
    connection::{Connection, ResetBeforeOperation, SerialInterface, reset},
    error::ConnectionError,
    image_format::{Segment, update_flash_params},
    target::{Chip, XtalFrequency},
};

pub(crate) mod stubs;

pub use self::stubs::FlashStub;

/// Flash chunk size used by the ROM loader protocol.
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;
/// Flash chunk size once the stub is running.
pub(crate) const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// RAM upload chunk size.
pub(crate) const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

/// Frames inspected for the stub greeting before giving up.
const MAX_STUB_HANDSHAKE_ATTEMPTS: usize = 100;

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
pub enum FlashFrequency {
    /// 20 MHz
    #[strum(serialize = "20MHz")]
    #[serde(rename = "20MHz")]
    _20Mhz,
    /// 26 MHz
    #[strum(serialize = "26MHz")]
    #[serde(rename = "26MHz")]
    _26Mhz,
    /// 40 MHz
    #[default]
    #[strum(serialize = "40MHz")]
    #[serde(rename = "40MHz")]
    _40Mhz,
    /// 80 MHz
    #[strum(serialize = "80MHz")]
    #[serde(rename = "80MHz")]
    _80Mhz,
}

impl FlashFrequency {
    /// Encodes the frequency into the format used by the bootloader header.
    pub fn encode(self) -> u8 {
        match self {
            FlashFrequency::_20Mhz => 0x2,
            FlashFrequency::_26Mhz => 0x1,
            FlashFrequency::_40Mhz => 0x0,
            FlashFrequency::_80Mhz => 0xF,
        }
    }
}

/// Supported flash modes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    VariantNames,
    EnumIter,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
pub enum FlashSize {
    /// 256 KB
    #[strum(serialize = "256KB")]
    #[serde(rename = "256KB")]
    _256Kb,
    /// 512 KB
    #[strum(serialize = "512KB")]
    #[serde(rename = "512KB")]
    _512Kb,
    /// 1 MB
    #[strum(serialize = "1MB")]
    #[serde(rename = "1MB")]
    _1Mb,
    /// 2 MB
    #[strum(serialize = "2MB")]
    #[serde(rename = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[strum(serialize = "4MB")]
    #[serde(rename = "4MB")]
    _4Mb,
    /// 8 MB
    #[strum(serialize = "8MB")]
    #[serde(rename = "8MB")]
    _8Mb,
    /// 16 MB
    #[strum(serialize = "16MB")]
    #[serde(rename = "16MB")]
    _16Mb,
}

impl FlashSize {
    /// Create a [FlashSize] from the density byte of an SPI flash ID.
    pub fn from_detected(value: u8) -> Result<FlashSize, Error> {
        match value {
            0x12 => Ok(FlashSize::_256Kb),
            0x13 => Ok(FlashSize::_512Kb),
            0x14 => Ok(FlashSize::_1Mb),
            0x15 => Ok(FlashSize::_2Mb),
            0x16 => Ok(FlashSize::_4Mb),
            0x17 => Ok(FlashSize::_8Mb),
            0x18 => Ok(FlashSize::_16Mb),
            _ => Err(Error::InvalidFlashSize(format!("{value:#04x}"))),
        }
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0040000,
            FlashSize::_512Kb => 0x0080000,
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashSize::VARIANTS
            .iter()
            .copied()
            .zip(FlashSize::iter())
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, variant)| variant)
            .ok_or_else(|| Error::InvalidFlashSize(s.to_string()))
    }
}

/// Settings for [Flasher::write_flash].
///
/// `mode`, `size` and `freq` patch the bootloader image header when set;
/// `None` keeps whatever the image carries. Setting `size` additionally
/// bounds-checks every segment against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteFlashOptions {
    /// Flash mode to patch into the bootloader header.
    pub mode: Option<FlashMode>,
    /// Flash size to patch into the bootloader header.
    pub size: Option<FlashSize>,
    /// Flash frequency to patch into the bootloader header.
    pub freq: Option<FlashFrequency>,
    /// Erase the entire chip before writing. Stub only.
    pub erase_all: bool,
    /// Compress segments before transfer.
    pub compress: bool,
    /// Verify flash contents against the image digest after each segment.
    pub verify: bool,
    /// Reboot into the written image when leaving the loader.
    pub reboot: bool,
}

impl Default for WriteFlashOptions {
    fn default() -> Self {
        WriteFlashOptions {
            mode: None,
            size: None,
            freq: None,
            erase_all: false,
            compress: true,
            verify: true,
            reboot: false,
        }
    }
}

/// Progress update callbacks.
pub trait ProgressCallbacks {
    /// Initialize a progress report for one segment.
    fn init(&mut self, segment: usize, addr: u32, total: usize);
    /// `current` bytes of the segment have been sent.
    fn update(&mut self, current: usize);
    /// Indicate post-flash checksum verification has begun.
    fn verifying(&mut self);
    /// Finish the segment's progress report.
    fn finish(&mut self, skipped: bool);
}

/// An empty implementation of [ProgressCallbacks] that does nothing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultProgressCallback;

impl ProgressCallbacks for DefaultProgressCallback {
    fn init(&mut self, _segment: usize, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn verifying(&mut self) {}
    fn finish(&mut self, _skipped: bool) {}
}

/// Information about the connected device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
    /// Part description decoded from the eFuses
    pub description: String,
    /// The revision of the chip, on families which encode one
    pub revision: Option<u32>,
    /// The crystal frequency of the chip
    pub crystal_frequency: XtalFrequency,
    /// Device features
    pub features: Vec<String>,
    /// MAC address
    pub mac_address: String,
}

/// Decoded SPI flash identification word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FlashId {
    /// JEDEC manufacturer ID.
    pub manufacturer: u8,
    /// Device ID, high byte first.
    pub device: u16,
    /// Flash size decoded from the density byte, when recognized.
    pub size: Option<FlashSize>,
}

/// Connect to and flash a target device
#[derive(Debug)]
pub struct Flasher<P: SerialInterface> {
    /// Connection for flash operations
    connection: Connection<P>,
    /// Detected chip, absent until [Flasher::connect] binds one
    chip: Option<Chip>,
    /// Indicate RAM stub loader is in use
    is_stub: bool,
    /// Current flash write chunk size
    flash_write_size: usize,
}

impl<P: SerialInterface> Flasher<P> {
    /// Creates a new flasher over an unsynchronized connection.
    pub fn new(connection: Connection<P>) -> Self {
        Flasher {
            connection,
            chip: None,
            is_stub: false,
            flash_write_size: FLASH_WRITE_SIZE,
        }
    }

    /// Resets the device into its bootloader, synchronizes, and detects the
    /// connected chip.
    ///
    /// With `detecting` set, the handshake stops after synchronization and no
    /// chip is bound; chip-bound operations then fail until a later
    /// non-detecting connect.
    pub async fn connect(
        &mut self,
        mode: ResetBeforeOperation,
        attempts: usize,
        detecting: bool,
    ) -> Result<(), Error> {
        self.connection.begin(mode, attempts).await?;
        self.connection.set_timeout(DEFAULT_TIMEOUT)?;
        self.connection.flush_input().await;

        if detecting {
            return Ok(());
        }

        let magic = self
            .connection
            .read_reg(CHIP_DETECT_MAGIC_REG_ADDR)
            .await?;
        debug!("Read chip magic value: {magic:#010x}");

        let chip = Chip::from_magic(magic)?;
        info!("Chip is {chip}");

        chip.post_connect(&mut self.connection).await?;
        self.chip = Some(chip);

        Ok(())
    }

    /// The detected chip, if any.
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    /// Whether the flasher stub is running.
    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    /// The current flash write chunk size.
    pub fn flash_write_size(&self) -> usize {
        self.flash_write_size
    }

    /// The active serial connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection<P> {
        &mut self.connection
    }

    /// Consume self and return the underlying connection.
    pub fn into_connection(self) -> Connection<P> {
        self.connection
    }

    fn bound_chip(&self) -> Result<Chip, Error> {
        self.chip.ok_or(Error::ChipNotDetected)
    }

    /// Read and print any information we can about the connected device
    pub async fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let chip = self.bound_chip()?;

        let description = chip.chip_description(&mut self.connection).await?;
        let revision = chip.chip_revision(&mut self.connection).await?;
        let crystal_frequency = chip.xtal_frequency(&mut self.connection).await?;
        let features = chip
            .chip_features(&mut self.connection)
            .await?
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        let mac_address = chip.mac_address(&mut self.connection).await?;

        Ok(DeviceInfo {
            chip,
            description,
            revision,
            crystal_frequency,
            features,
            mac_address,
        })
    }

    /// Uploads the flasher stub into target RAM, starts it, and waits for it
    /// to report itself alive.
    ///
    /// On success the session switches to the stub's faster command set and
    /// larger flash chunk size; the switch is irreversible for the lifetime
    /// of the session.
    pub async fn run_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        if self.is_stub {
            debug!("Stub is already running");
            return Ok(());
        }

        info!("Uploading flasher stub...");

        let (text_addr, text) = stub.text()?;
        let (data_addr, data) = stub.data()?;

        for (what, addr, payload) in [("text", text_addr, &text), ("data", data_addr, &data)] {
            let blocks = payload.len().div_ceil(MAX_RAM_BLOCK_SIZE);
            debug!("Writing {} byte stub {what} to {addr:#010x}", payload.len());

            self.mem_begin(
                payload.len() as u32,
                blocks as u32,
                MAX_RAM_BLOCK_SIZE as u32,
                addr,
            )
            .await?;

            for (sequence, chunk) in payload.chunks(MAX_RAM_BLOCK_SIZE).enumerate() {
                self.mem_block(chunk, sequence as u32).await?;
            }
        }

        debug!("Running stub at {:#010x}", stub.entry());
        self.mem_finish(stub.entry()).await?;

        // The stub greets us on its own once alive; anything else read in the
        // meantime is leftover loader traffic.
        let old_timeout = self.connection.serial.timeout();
        self.connection.set_timeout(STUB_HANDSHAKE_TIMEOUT)?;
        let mut result: Result<(), Error> =
            Err(ConnectionError::InvalidStubHandshake.into());
        for _ in 0..MAX_STUB_HANDSHAKE_ATTEMPTS {
            match self.connection.read_frame().await {
                Ok(frame) if frame.starts_with(EXPECTED_STUB_HANDSHAKE.as_bytes()) => {
                    result = Ok(());
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.connection.set_timeout(old_timeout)?;
        result?;

        info!("Stub running");
        self.is_stub = true;
        self.flash_write_size = STUB_FLASH_WRITE_SIZE;

        Ok(())
    }

    /// Writes the given segments to flash.
    ///
    /// Each segment is padded, optionally header-patched and compressed,
    /// written in chunks, and optionally verified against its MD5 digest.
    /// Empty segments are skipped with a warning.
    pub async fn write_flash(
        &mut self,
        segments: &[Segment<'_>],
        options: &WriteFlashOptions,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let chip = self.bound_chip()?;

        if let Some(flash_size) = options.size {
            for (index, segment) in segments.iter().enumerate() {
                let end = segment.addr as u64 + segment.data.len() as u64;
                if end > flash_size.size() as u64 {
                    return Err(Error::ImageDoesNotFit {
                        segment: index,
                        address: segment.addr,
                        size: segment.data.len(),
                        flash_size,
                    });
                }
            }
        }

        if self.is_stub && options.erase_all {
            self.erase_flash().await?;
        }

        for (index, segment) in segments.iter().enumerate() {
            if segment.data.is_empty() {
                warn!(
                    "Segment {index} at {:#010x} is empty, skipping",
                    segment.addr
                );
                continue;
            }

            let addr = segment.addr;
            let mut image = segment.data.to_vec();
            if image.len() % 4 != 0 {
                image.extend(std::iter::repeat_n(0xFF, 4 - image.len() % 4));
            }

            update_flash_params(chip, addr, &mut image, options.mode, options.size, options.freq)?;

            let digest = if options.verify {
                let mut hasher = Md5::new();
                hasher.update(&image);
                Some(hex_digest(hasher.finalize().as_slice()))
            } else {
                None
            };

            let uncsize = image.len() as u32;

            let (blocks, payload) = if options.compress {
                let compressed = compress_to_vec_zlib(&image, 10);
                let blocks = self
                    .flash_defl_begin(uncsize, compressed.len() as u32, addr)
                    .await?;
                (blocks, compressed)
            } else {
                let blocks = self.flash_begin(uncsize, addr).await?;
                (blocks, image)
            };

            progress.init(index, addr, payload.len());

            let mut bytes_sent = 0;
            let mut block_timeout = DEFAULT_TIMEOUT;
            for (sequence, block) in payload.chunks(self.flash_write_size).enumerate() {
                debug!(
                    "Writing at {:#010x} ({}%)",
                    addr + (sequence * self.flash_write_size) as u32,
                    100 * (sequence + 1) / (blocks as usize).max(1)
                );

                if options.compress {
                    // Timing the device-side decompression of a partial block
                    // is not modeled; compressed writes use a fixed budget.
                    block_timeout = CommandType::FlashDeflData.timeout();
                    self.flash_defl_block(block, sequence as u32, block_timeout)
                        .await?;
                } else {
                    block_timeout = if self.is_stub {
                        DEFAULT_TIMEOUT
                    } else {
                        CommandType::FlashData.timeout_for_size(block.len() as u32)
                    };
                    self.flash_block(block, sequence as u32, block_timeout)
                        .await?;
                }

                bytes_sent += block.len();
                progress.update(bytes_sent);
            }

            if self.is_stub {
                // Liveness probe; the stub stalls on the last block while the
                // flash write catches up.
                self.connection
                    .command_with_timeout(
                        block_timeout,
                        Command::ReadReg {
                            address: CHIP_DETECT_MAGIC_REG_ADDR,
                        },
                    )
                    .await?;
            }

            if options.compress {
                info!("Wrote {uncsize} bytes ({bytes_sent} compressed) at {addr:#010x}");
            } else {
                info!("Wrote {uncsize} bytes at {addr:#010x}");
            }

            if let Some(expected) = digest {
                progress.verifying();
                let computed = self.flash_md5sum(addr, uncsize).await?;
                if computed != expected {
                    return Err(Error::VerifyFailed { expected, computed });
                }
                debug!("Hash of data verified");
            }

            progress.finish(false);
        }

        info!("Leaving flash mode");
        if self.is_stub {
            self.flash_begin(0, 0).await?;
            if options.compress {
                self.flash_defl_finish(options.reboot).await?;
            } else {
                self.flash_finish(options.reboot).await?;
            }
        }

        Ok(())
    }

    /// Computes the MD5 digest of a flash region on the device.
    ///
    /// The digest is returned as lowercase hex regardless of whether the ROM
    /// loader (hex text) or the stub (raw bytes) answered.
    pub async fn flash_md5sum(&mut self, offset: u32, size: u32) -> Result<String, Error> {
        let response = self
            .connection
            .check_command(
                CommandType::FlashMd5.timeout_for_size(size),
                Command::FlashMd5 { offset, size },
            )
            .await?;

        if response.len() >= 32 && response[..32].iter().all(u8::is_ascii_hexdigit) {
            Ok(String::from_utf8_lossy(&response[..32]).to_lowercase())
        } else if response.len() >= 16 {
            Ok(hex_digest(&response[..16]))
        } else {
            Err(Error::InvalidResponse(format!(
                "MD5 response of {} bytes",
                response.len()
            )))
        }
    }

    /// Erase the entire flash chip. Stub only.
    pub async fn erase_flash(&mut self) -> Result<(), Error> {
        if !self.is_stub {
            return Err(Error::StubRequired);
        }

        info!("Erasing flash (this may take a while)...");
        self.connection
            .check_command(CommandType::EraseFlash.timeout(), Command::EraseFlash)
            .await?;

        Ok(())
    }

    /// Erase a region of flash. Stub only.
    pub async fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        if !self.is_stub {
            return Err(Error::StubRequired);
        }

        debug!("Erasing region of {size:#x}B at {offset:#010x}");
        self.connection
            .check_command(
                CommandType::EraseRegion.timeout_for_size(size),
                Command::EraseRegion { offset, size },
            )
            .await?;

        self.connection.serial.delay_ms(50).await;
        self.connection.flush_input().await;
        Ok(())
    }

    /// Configure the SPI flash pins.
    pub async fn flash_spi_attach(&mut self, arg: u32) -> Result<(), Error> {
        self.connection
            .check_command(CommandType::SpiAttach.timeout(), Command::SpiAttach { arg })
            .await?;
        Ok(())
    }

    /// Change the baud rate of the connection.
    pub async fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        debug!("Change baud to: {baud}");

        let prior_baud = match self.is_stub {
            true => self.connection.baud()?,
            false => 0,
        };

        self.connection
            .command_with_timeout(
                CommandType::ChangeBaudrate.timeout(),
                Command::ChangeBaudrate {
                    new_baud: baud,
                    prior_baud,
                },
            )
            .await?;

        self.connection.set_baud(baud).await?;
        self.connection.serial.delay_ms(50).await;
        self.connection.flush_input().await;

        Ok(())
    }

    /// Executes one raw SPI transaction against the target's SPI controller
    /// registers.
    ///
    /// At most 64 bytes may be written and at most 32 bits read back in a
    /// single transaction.
    pub async fn spi_command(
        &mut self,
        opcode: u8,
        data: &[u8],
        read_bits: u32,
    ) -> Result<u32, Error> {
        const SPI_USR_COMMAND: u32 = 1 << 31;
        const SPI_USR_MISO: u32 = 1 << 28;
        const SPI_USR_MOSI: u32 = 1 << 27;
        const SPI_CMD_USR: u32 = 1 << 18;
        const SPI_USR2_COMMAND_LEN_SHIFT: u32 = 28;
        const SPI_MOSI_BITLEN_SHIFT: u32 = 17;
        const SPI_MISO_BITLEN_SHIFT: u32 = 8;

        if read_bits > 32 {
            return Err(Error::UnsupportedSpiOperation(
                "reading more than 32 bits back from one SPI command".to_string(),
            ));
        }
        if data.len() > 64 {
            return Err(Error::UnsupportedSpiOperation(
                "writing more than 64 bytes of data with one SPI command".to_string(),
            ));
        }

        let chip = self.bound_chip()?;
        let spi_registers = chip.spi_registers();

        let old_spi_usr = self.connection.read_reg(spi_registers.usr()).await?;
        let old_spi_usr2 = self.connection.read_reg(spi_registers.usr2()).await?;

        let mosi_bits = data.len() as u32 * 8;

        // Bit lengths are stored as count - 1 when the count is nonzero.
        if let (Some(mosi_length), Some(miso_length)) =
            (spi_registers.mosi_length(), spi_registers.miso_length())
        {
            if mosi_bits > 0 {
                self.connection
                    .write_reg(mosi_length, mosi_bits - 1, None)
                    .await?;
            }
            if read_bits > 0 {
                self.connection
                    .write_reg(miso_length, read_bits - 1, None)
                    .await?;
            }
        } else {
            let mosi_mask = mosi_bits.saturating_sub(1);
            let miso_mask = read_bits.saturating_sub(1);
            self.connection
                .write_reg(
                    spi_registers.usr1(),
                    (miso_mask << SPI_MISO_BITLEN_SHIFT) | (mosi_mask << SPI_MOSI_BITLEN_SHIFT),
                    None,
                )
                .await?;
        }

        let mut flags = SPI_USR_COMMAND;
        if read_bits > 0 {
            flags |= SPI_USR_MISO;
        }
        if !data.is_empty() {
            flags |= SPI_USR_MOSI;
        }
        self.connection
            .write_reg(spi_registers.usr(), flags, None)
            .await?;
        self.connection
            .write_reg(
                spi_registers.usr2(),
                (7 << SPI_USR2_COMMAND_LEN_SHIFT) | opcode as u32,
                None,
            )
            .await?;

        if data.is_empty() {
            self.connection
                .write_reg(spi_registers.w0(), 0, None)
                .await?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut word = [0; 4];
                word[..bytes.len()].copy_from_slice(bytes);
                self.connection
                    .write_reg(spi_registers.w0() + 4 * i as u32, u32::from_le_bytes(word), None)
                    .await?;
            }
        }

        self.connection
            .write_reg(spi_registers.cmd(), SPI_CMD_USR, None)
            .await?;

        let mut completed = false;
        for _ in 0..10 {
            self.connection.serial.delay_ms(1).await;
            if self.connection.read_reg(spi_registers.cmd()).await? & SPI_CMD_USR == 0 {
                completed = true;
                break;
            }
        }
        if !completed {
            return Err(Error::SpiCommandTimeout);
        }

        let result = self.connection.read_reg(spi_registers.w0()).await?;
        self.connection
            .write_reg(spi_registers.usr(), old_spi_usr, None)
            .await?;
        self.connection
            .write_reg(spi_registers.usr2(), old_spi_usr2, None)
            .await?;

        Ok(result)
    }

    /// Reads the 24-bit SPI flash identification word.
    pub async fn read_flash_id(&mut self) -> Result<u32, Error> {
        const SPIFLASH_RDID: u8 = 0x9F;

        self.spi_command(SPIFLASH_RDID, &[], 24).await
    }

    /// Reads and decodes the SPI flash identification word.
    pub async fn flash_id(&mut self) -> Result<FlashId, Error> {
        let flash_id = self.read_flash_id().await?;
        let size_id = (flash_id >> 16) as u8;

        let id = FlashId {
            manufacturer: flash_id as u8,
            device: (u16::from((flash_id >> 8) as u8) << 8) | u16::from(size_id),
            size: FlashSize::from_detected(size_id).ok(),
        };

        info!("Manufacturer: {:02x}", id.manufacturer);
        info!("Device: {:04x}", id.device);
        match id.size {
            Some(size) => info!("Detected flash size: {size}"),
            None => warn!(
                "Could not detect flash size (FlashID={flash_id:#08x}, SizeID={size_id:#04x})"
            ),
        }

        Ok(id)
    }

    /// Performs a best-effort soft reset of the device.
    pub async fn soft_reset(&mut self) -> Result<(), Error> {
        let chip = self.bound_chip()?;
        reset::soft_reset(&mut self.connection, self.is_stub, chip).await
    }

    /// Hard-resets the device via the reset line.
    pub async fn hard_reset(&mut self) -> Result<(), Error> {
        reset::hard_reset(&mut self.connection.serial).await
    }

    async fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        debug!("mem_begin {size} {blocks} {block_size} {offset:#x}");
        self.connection
            .check_command(
                CommandType::MemBegin.timeout(),
                Command::MemBegin {
                    size,
                    blocks,
                    block_size,
                    offset,
                },
            )
            .await?;
        Ok(())
    }

    async fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.connection
            .check_command(
                CommandType::MemData.timeout(),
                Command::MemData { data, sequence },
            )
            .await?;
        Ok(())
    }

    async fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        self.connection
            .check_command(
                CommandType::MemEnd.timeout(),
                Command::MemEnd {
                    stay_in_ram: entry == 0,
                    entry,
                },
            )
            .await?;
        Ok(())
    }

    async fn flash_begin(&mut self, size: u32, offset: u32) -> Result<u32, Error> {
        let chip = self.bound_chip()?;

        let blocks = size.div_ceil(self.flash_write_size as u32);
        let erase_size = chip.erase_size(offset, size);
        let timeout = if self.is_stub {
            CommandType::FlashBegin.timeout()
        } else {
            CommandType::FlashBegin.timeout_for_size(size)
        };

        debug!(
            "flash_begin {erase_size:#x} {blocks} {} {offset:#x} {size:#x}",
            self.flash_write_size
        );
        self.connection
            .check_command(
                timeout,
                Command::FlashBegin {
                    erase_size,
                    blocks,
                    block_size: self.flash_write_size as u32,
                    offset,
                    supports_encryption: !self.is_stub,
                },
            )
            .await?;

        Ok(blocks)
    }

    async fn flash_defl_begin(
        &mut self,
        size: u32,
        compressed_size: u32,
        offset: u32,
    ) -> Result<u32, Error> {
        let chip = self.bound_chip()?;

        let blocks = compressed_size.div_ceil(self.flash_write_size as u32);
        let erase_blocks = size.div_ceil(self.flash_write_size as u32);

        // The stub erases as it writes; the ROM loader erases everything up
        // front and needs a size-scaled budget for it.
        let (write_size, timeout) = if self.is_stub {
            (size, CommandType::FlashDeflBegin.timeout())
        } else {
            let write_size = erase_blocks * self.flash_write_size as u32;
            (
                write_size,
                CommandType::FlashDeflBegin.timeout_for_size(write_size),
            )
        };

        info!("Compressed {size} bytes to {compressed_size}");

        self.connection
            .check_command(
                timeout,
                Command::FlashDeflBegin {
                    size: write_size,
                    blocks,
                    block_size: self.flash_write_size as u32,
                    offset,
                    supports_encryption: !self.is_stub
                        && matches!(chip, Chip::Esp32c3 | Chip::Esp32s2 | Chip::Esp32s3),
                },
            )
            .await?;

        Ok(blocks)
    }

    async fn flash_block(
        &mut self,
        data: &[u8],
        sequence: u32,
        timeout: std::time::Duration,
    ) -> Result<(), Error> {
        self.connection
            .check_command(timeout, Command::FlashData { data, sequence })
            .await?;
        Ok(())
    }

    async fn flash_defl_block(
        &mut self,
        data: &[u8],
        sequence: u32,
        timeout: std::time::Duration,
    ) -> Result<(), Error> {
        self.connection
            .check_command(timeout, Command::FlashDeflData { data, sequence })
            .await?;
        Ok(())
    }

    async fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection
            .check_command(CommandType::FlashEnd.timeout(), Command::FlashEnd { reboot })
            .await?;
        Ok(())
    }

    async fn flash_defl_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection
            .check_command(
                CommandType::FlashDeflEnd.timeout(),
                Command::FlashDeflEnd { reboot },
            )
            .await?;
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_size_parses_its_labels() {
        assert_eq!("4MB".parse::<FlashSize>().unwrap(), FlashSize::_4Mb);
        assert_eq!("256kb".parse::<FlashSize>().unwrap(), FlashSize::_256Kb);
        assert!(matches!(
            "3MB".parse::<FlashSize>(),
            Err(Error::InvalidFlashSize(_))
        ));
    }

    #[test]
    fn flash_size_decodes_density_bytes() {
        assert_eq!(FlashSize::from_detected(0x16).unwrap(), FlashSize::_4Mb);
        assert_eq!(FlashSize::from_detected(0x18).unwrap(), FlashSize::_16Mb);
        assert!(FlashSize::from_detected(0xFF).is_err());
    }

    #[test]
    fn flash_size_knows_its_byte_count() {
        assert_eq!(FlashSize::_1Mb.size(), 0x10_0000);
        assert_eq!(FlashSize::_16Mb.size(), 0x100_0000);
    }

    #[test]
    fn frequency_encodings_match_the_header_format() {
        assert_eq!(FlashFrequency::_40Mhz.encode(), 0x0);
        assert_eq!(FlashFrequency::_26Mhz.encode(), 0x1);
        assert_eq!(FlashFrequency::_20Mhz.encode(), 0x2);
        assert_eq!(FlashFrequency::_80Mhz.encode(), 0xF);
    }
}
