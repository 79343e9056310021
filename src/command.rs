//! Commands understood by the ROM loader and the flasher stub.
//!
//! Every request shares the same layout: a direction byte (0x00), the opcode,
//! a little-endian 16-bit payload length, a little-endian 32-bit
//! checksum/value word, and the payload itself. The whole packet is SLIP
//! framed before it goes onto the wire.

use std::time::Duration;

use embedded_io_async::Write;
use strum::Display;

/// Default timeout for commands.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
/// Timeout for a single synchronization attempt.
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout for starting uploaded code via `MEM_END`.
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
/// Timeout for writing one compressed flash block.
const FLASH_DEFL_BLOCK_TIMEOUT: Duration = Duration::from_millis(5000);
/// Budget for erasing the whole flash chip: twice the worst chip-erase time.
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_millis(2 * 120_000);

/// Timeout rate for erasing a flash region, per MB.
const ERASE_REGION_TIMEOUT_PER_MB: u64 = 30_000;
/// Timeout rate for an erase-and-write cycle, per MB.
const ERASE_WRITE_TIMEOUT_PER_MB: u64 = 40_000;
/// Timeout rate for the device-side MD5 computation, per MB.
const MD5_TIMEOUT_PER_MB: u64 = 8_000;

/// Seed for the XOR checksum carried by data commands.
const CHECKSUM_INIT: u8 = 0xEF;

/// Synchronization payload: two frame markers followed by 32 bytes of 0x55.
const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

/// Computes the checksum of `data` as the repeated XOR of every byte with the
/// seed value. The fold is order-independent.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_INIT, |chk, &byte| chk ^ byte)
}

/// Scales a timeout with the amount of flash affected, with a 3 second floor.
pub fn timeout_per_mb(millis_per_mb: u64, size_bytes: u32) -> Duration {
    let timeout = millis_per_mb as f64 * size_bytes as f64 / 1_000_000.0;
    Duration::from_millis(timeout.max(3000.0) as u64)
}

/// Types of commands that can be sent to a target device.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    /// Begin an uncompressed flash write.
    FlashBegin = 0x02,
    /// Write one uncompressed flash block.
    FlashData = 0x03,
    /// Leave flash mode.
    FlashEnd = 0x04,
    /// Begin a RAM upload.
    MemBegin = 0x05,
    /// Leave RAM download mode, optionally starting the uploaded code.
    MemEnd = 0x06,
    /// Write one RAM block.
    MemData = 0x07,
    /// Synchronize with the loader after reset.
    Sync = 0x08,
    /// Write a 32-bit target register.
    WriteReg = 0x09,
    /// Read a 32-bit target register.
    ReadReg = 0x0A,
    /// Configure the SPI flash pins.
    SpiAttach = 0x0D,
    /// Switch the loader to a new baud rate.
    ChangeBaudrate = 0x0F,
    /// Begin a compressed flash write.
    FlashDeflBegin = 0x10,
    /// Write one compressed flash block.
    FlashDeflData = 0x11,
    /// Leave compressed flash mode.
    FlashDeflEnd = 0x12,
    /// Compute the MD5 digest of a flash region on the device.
    FlashMd5 = 0x13,
    /// Erase the entire flash chip. Stub only.
    EraseFlash = 0xD0,
    /// Erase a region of flash. Stub only.
    EraseRegion = 0xD1,
    /// Leave the loader and run the user application. Stub only.
    RunUserCode = 0xD3,
}

impl CommandType {
    /// The default timeout for this command type.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::FlashDeflData => FLASH_DEFL_BLOCK_TIMEOUT,
            CommandType::EraseFlash => CHIP_ERASE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// The timeout for this command type, scaled to the size of the flash
    /// region it affects.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData => timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, size),
            CommandType::FlashMd5 => timeout_per_mb(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A command to send to a target device, along with its parameters.
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    /// Synchronize with the loader.
    Sync,
    /// Begin an uncompressed flash write.
    FlashBegin {
        /// Number of bytes to erase, per the chip's erase-size policy.
        erase_size: u32,
        /// Number of blocks that will follow.
        blocks: u32,
        /// Size of each block.
        block_size: u32,
        /// Flash offset to write to.
        offset: u32,
        /// Append the ROM loader's encryption placeholder word.
        supports_encryption: bool,
    },
    /// Write one uncompressed block of flash data.
    FlashData {
        /// Block payload.
        data: &'a [u8],
        /// Block sequence number.
        sequence: u32,
    },
    /// Leave flash mode.
    FlashEnd {
        /// Reboot into the freshly written image instead of staying in the
        /// loader.
        reboot: bool,
    },
    /// Begin a RAM upload.
    MemBegin {
        /// Total number of bytes to upload.
        size: u32,
        /// Number of blocks that will follow.
        blocks: u32,
        /// Size of each block.
        block_size: u32,
        /// RAM address to load to.
        offset: u32,
    },
    /// Write one block of RAM data.
    MemData {
        /// Block payload.
        data: &'a [u8],
        /// Block sequence number.
        sequence: u32,
    },
    /// Leave RAM download mode.
    MemEnd {
        /// Stay in the loader instead of jumping to the entry point.
        stay_in_ram: bool,
        /// Entry point of the uploaded code.
        entry: u32,
    },
    /// Write a 32-bit target register.
    WriteReg {
        /// Register address.
        address: u32,
        /// Value to write.
        value: u32,
        /// Optional write mask, defaults to all bits.
        mask: Option<u32>,
    },
    /// Read a 32-bit target register.
    ReadReg {
        /// Register address.
        address: u32,
    },
    /// Configure the SPI flash pins.
    SpiAttach {
        /// Packed pin assignment word.
        arg: u32,
    },
    /// Switch the loader to a new baud rate.
    ChangeBaudrate {
        /// The baud rate to switch to.
        new_baud: u32,
        /// The current baud rate; zero when talking to the ROM loader.
        prior_baud: u32,
    },
    /// Begin a compressed flash write.
    FlashDeflBegin {
        /// Number of uncompressed bytes the device should prepare to write.
        size: u32,
        /// Number of compressed blocks that will follow.
        blocks: u32,
        /// Size of each block.
        block_size: u32,
        /// Flash offset to write to.
        offset: u32,
        /// Append the ROM loader's encryption placeholder word.
        supports_encryption: bool,
    },
    /// Write one compressed block of flash data.
    FlashDeflData {
        /// Block payload.
        data: &'a [u8],
        /// Block sequence number.
        sequence: u32,
    },
    /// Leave compressed flash mode.
    FlashDeflEnd {
        /// Reboot into the freshly written image instead of staying in the
        /// loader.
        reboot: bool,
    },
    /// Compute the MD5 digest of a flash region on the device.
    FlashMd5 {
        /// Start of the region.
        offset: u32,
        /// Length of the region in bytes.
        size: u32,
    },
    /// Erase the entire flash chip.
    EraseFlash,
    /// Erase a region of flash.
    EraseRegion {
        /// Start of the region.
        offset: u32,
        /// Length of the region in bytes.
        size: u32,
    },
    /// Leave the loader and run the user application.
    RunUserCode,
}

impl Command<'_> {
    /// The [CommandType] of this command.
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Sync => CommandType::Sync,
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::RunUserCode => CommandType::RunUserCode,
        }
    }

    /// The default timeout for this command.
    pub fn timeout(&self) -> Duration {
        self.command_type().timeout()
    }

    /// Serialize the command into `writer`, pre-SLIP-encoding.
    pub async fn write<W: Write>(&self, writer: &mut W) -> Result<(), W::Error> {
        match *self {
            Command::Sync => write_basic(writer, self.command_type(), &SYNC_FRAME, 0).await,
            Command::FlashBegin {
                erase_size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    self.command_type(),
                    erase_size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )
                .await
            }
            Command::FlashData { data, sequence } => {
                data_command(writer, self.command_type(), data, sequence).await
            }
            Command::FlashEnd { reboot } => {
                write_basic(
                    writer,
                    self.command_type(),
                    &u32::from(!reboot).to_le_bytes(),
                    0,
                )
                .await
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(
                    writer,
                    self.command_type(),
                    size,
                    blocks,
                    block_size,
                    offset,
                    false,
                )
                .await
            }
            Command::MemData { data, sequence } => {
                data_command(writer, self.command_type(), data, sequence).await
            }
            Command::MemEnd { stay_in_ram, entry } => {
                let mut data = [0; 8];
                data[0..4].copy_from_slice(&u32::from(stay_in_ram).to_le_bytes());
                data[4..8].copy_from_slice(&entry.to_le_bytes());
                write_basic(writer, self.command_type(), &data, 0).await
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                let mut data = [0; 16];
                data[0..4].copy_from_slice(&address.to_le_bytes());
                data[4..8].copy_from_slice(&value.to_le_bytes());
                data[8..12].copy_from_slice(&mask.unwrap_or(0xFFFF_FFFF).to_le_bytes());
                write_basic(writer, self.command_type(), &data, 0).await
            }
            Command::ReadReg { address } => {
                write_basic(writer, self.command_type(), &address.to_le_bytes(), 0).await
            }
            Command::SpiAttach { arg } => {
                write_basic(writer, self.command_type(), &arg.to_le_bytes(), 0).await
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut data = [0; 8];
                data[0..4].copy_from_slice(&new_baud.to_le_bytes());
                data[4..8].copy_from_slice(&prior_baud.to_le_bytes());
                write_basic(writer, self.command_type(), &data, 0).await
            }
            Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    self.command_type(),
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )
                .await
            }
            Command::FlashDeflData { data, sequence } => {
                data_command(writer, self.command_type(), data, sequence).await
            }
            Command::FlashDeflEnd { reboot } => {
                write_basic(
                    writer,
                    self.command_type(),
                    &u32::from(!reboot).to_le_bytes(),
                    0,
                )
                .await
            }
            Command::FlashMd5 { offset, size } => {
                let mut data = [0; 16];
                data[0..4].copy_from_slice(&offset.to_le_bytes());
                data[4..8].copy_from_slice(&size.to_le_bytes());
                write_basic(writer, self.command_type(), &data, 0).await
            }
            Command::EraseFlash => write_basic(writer, self.command_type(), &[], 0).await,
            Command::EraseRegion { offset, size } => {
                let mut data = [0; 8];
                data[0..4].copy_from_slice(&offset.to_le_bytes());
                data[4..8].copy_from_slice(&size.to_le_bytes());
                write_basic(writer, self.command_type(), &data, 0).await
            }
            Command::RunUserCode => write_basic(writer, self.command_type(), &[], 0).await,
        }
    }
}

/// Write the common request header followed by `data`.
async fn write_basic<W: Write>(
    writer: &mut W,
    ty: CommandType,
    data: &[u8],
    checksum: u32,
) -> Result<(), W::Error> {
    writer.write_all(&[0, ty as u8]).await?;
    writer.write_all(&(data.len() as u16).to_le_bytes()).await?;
    writer.write_all(&checksum.to_le_bytes()).await?;
    writer.write_all(data).await?;
    Ok(())
}

/// Write a `*_BEGIN` command: four size words, plus the encryption
/// placeholder word the ROM loader variants expect.
async fn begin_command<W: Write>(
    writer: &mut W,
    ty: CommandType,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> Result<(), W::Error> {
    let mut data = [0; 20];
    data[0..4].copy_from_slice(&size.to_le_bytes());
    data[4..8].copy_from_slice(&blocks.to_le_bytes());
    data[8..12].copy_from_slice(&block_size.to_le_bytes());
    data[12..16].copy_from_slice(&offset.to_le_bytes());

    let length = if supports_encryption { 20 } else { 16 };

    write_basic(writer, ty, &data[..length], 0).await
}

/// Write a `*_DATA` command: a four-word parameter header followed by the
/// block payload, with the payload checksum in the request header.
async fn data_command<W: Write>(
    writer: &mut W,
    ty: CommandType,
    data: &[u8],
    sequence: u32,
) -> Result<(), W::Error> {
    writer.write_all(&[0, ty as u8]).await?;
    writer
        .write_all(&((16 + data.len()) as u16).to_le_bytes())
        .await?;
    writer
        .write_all(&u32::from(checksum(data)).to_le_bytes())
        .await?;
    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&sequence.to_le_bytes()).await?;
    writer.write_all(&0u32.to_le_bytes()).await?;
    writer.write_all(&0u32.to_le_bytes()).await?;
    writer.write_all(data).await?;
    Ok(())
}

/// A response from the target device.
///
/// Responses share the request layout, with the direction byte set to 0x01
/// and the checksum word repurposed as a 32-bit value field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Direction byte; 1 marks a response.
    pub resp: u8,
    /// Echo of the opcode this responds to.
    pub return_op: u8,
    /// Length field. Not used for dispatch.
    pub return_length: u16,
    /// The 32-bit value field.
    pub value: u32,
    /// Bytes following the 8-byte header.
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecWriter(Vec<u8>);

    impl embedded_io_async::ErrorType for VecWriter {
        type Error = core::convert::Infallible;
    }

    impl embedded_io_async::Write for VecWriter {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    async fn encode(command: Command<'_>) -> Vec<u8> {
        let mut writer = VecWriter(Vec::new());
        command.write(&mut writer).await.unwrap();
        writer.0
    }

    #[test]
    fn checksum_folds_from_seed() {
        assert_eq!(checksum(&[]), 0xEF);
        assert_eq!(checksum(&[0xEF]), 0x00);
        assert_eq!(checksum(&[0x01, 0x02, 0x04]), 0xEF ^ 0x07);
    }

    #[test]
    fn checksum_is_invariant_under_permutation() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x55, 0xC0];
        let mut reversed = data;
        reversed.reverse();
        assert_eq!(checksum(&data), checksum(&reversed));
    }

    #[test]
    fn timeout_per_mb_has_a_floor() {
        assert_eq!(timeout_per_mb(30_000, 0), Duration::from_millis(3000));
        assert_eq!(timeout_per_mb(30_000, 100_000), Duration::from_millis(3000));
        assert_eq!(
            timeout_per_mb(30_000, 1_000_000),
            Duration::from_millis(30_000)
        );
        assert_eq!(timeout_per_mb(8_000, 4_000_000), Duration::from_millis(32_000));
    }

    #[tokio::test]
    async fn read_reg_encodes_header_and_payload() {
        let encoded = encode(Command::ReadReg {
            address: 0x4000_1000,
        })
        .await;

        assert_eq!(encoded[0], 0x00);
        assert_eq!(encoded[1], CommandType::ReadReg as u8);
        assert_eq!(&encoded[2..4], &4u16.to_le_bytes());
        assert_eq!(&encoded[4..8], &0u32.to_le_bytes());
        assert_eq!(&encoded[8..], &0x4000_1000u32.to_le_bytes());
    }

    #[tokio::test]
    async fn data_command_carries_payload_checksum() {
        let payload = [0xC0, 0xDB, 0x01, 0x02];
        let encoded = encode(Command::FlashData {
            data: &payload,
            sequence: 3,
        })
        .await;

        assert_eq!(encoded[1], 0x03);
        assert_eq!(&encoded[2..4], &(16u16 + 4).to_le_bytes());
        assert_eq!(&encoded[4..8], &u32::from(checksum(&payload)).to_le_bytes());
        assert_eq!(&encoded[8..12], &4u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &3u32.to_le_bytes());
        assert_eq!(&encoded[24..], &payload);
    }

    #[tokio::test]
    async fn sync_payload_matches_the_protocol() {
        let encoded = encode(Command::Sync).await;

        assert_eq!(encoded[1], 0x08);
        assert_eq!(&encoded[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(encoded[12..].iter().all(|&b| b == 0x55));
        assert_eq!(encoded.len(), 8 + 36);
    }

    #[tokio::test]
    async fn begin_command_appends_placeholder_for_rom_loader() {
        let stub = encode(Command::FlashBegin {
            erase_size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0,
            supports_encryption: false,
        })
        .await;
        let rom = encode(Command::FlashBegin {
            erase_size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0,
            supports_encryption: true,
        })
        .await;

        assert_eq!(stub.len(), 8 + 16);
        assert_eq!(rom.len(), 8 + 20);
        assert_eq!(&rom[24..28], &[0, 0, 0, 0]);
    }
}
