//! Reset strategies for resetting a target device.
//!
//! This module defines the types used for resetting a target device into its
//! bootloader via the DTR/RTS control lines, and for leaving the loader once
//! flashing has finished.

use log::debug;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use super::{Connection, SerialInterface};
use crate::{
    Error,
    command::{Command, CommandType},
    target::Chip,
};

/// Time the reset line is held active before release.
const RESET_HOLD_MS: u32 = 100;
/// Additional hold time needed by one early silicon revision.
const EXTRA_RESET_HOLD_MS: u32 = 2000;
/// Time the boot-select line is held after releasing reset.
const BOOT_HOLD_MS: u32 = 50;

async fn set_dtr<P: SerialInterface>(serial_port: &mut P, level: bool) -> Result<(), Error> {
    serial_port.write_data_terminal_ready(level).await?;
    Ok(())
}

async fn set_rts<P: SerialInterface>(serial_port: &mut P, level: bool) -> Result<(), Error> {
    serial_port.write_request_to_send(level).await?;
    Ok(())
}

/// Classic reset sequence, strapping the reset and boot-select pins through
/// DTR and RTS to force the target into its serial bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassicReset {
    extra_delay: bool,
}

impl ClassicReset {
    /// Create a classic reset strategy, optionally with the extended delay
    /// required by one silicon revision.
    pub fn new(extra_delay: bool) -> Self {
        ClassicReset { extra_delay }
    }

    /// Execute the reset sequence.
    pub async fn reset<P: SerialInterface>(&self, serial_port: &mut P) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy (extra delay: {})",
            self.extra_delay
        );

        set_dtr(serial_port, false).await?; // IO0 = HIGH
        set_rts(serial_port, true).await?; // EN = LOW, chip in reset

        serial_port.delay_ms(RESET_HOLD_MS).await;
        if self.extra_delay {
            serial_port.delay_ms(EXTRA_RESET_HOLD_MS).await;
        }

        set_dtr(serial_port, true).await?; // IO0 = LOW
        set_rts(serial_port, false).await?; // EN = HIGH, chip out of reset

        serial_port.delay_ms(BOOT_HOLD_MS).await;

        set_dtr(serial_port, false).await?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Performs a hard reset of the chip via the reset line.
pub async fn hard_reset<P: SerialInterface>(serial_port: &mut P) -> Result<(), Error> {
    debug!("Using HardReset reset strategy");

    set_rts(serial_port, true).await?; // EN = LOW, chip in reset
    serial_port.delay_ms(RESET_HOLD_MS).await;
    set_rts(serial_port, false).await?;

    Ok(())
}

/// Performs a soft reset of the device.
///
/// Without the stub, issuing a zero-length flash session and leaving flash
/// mode makes the ROM loader run user code; this is as close to a soft reset
/// as the ROM loader allows. With the stub running, only the ESP8266 stub
/// implements the run-user-code hack, and the command is fire-and-forget, so
/// the reset is best effort either way.
pub async fn soft_reset<P: SerialInterface>(
    connection: &mut Connection<P>,
    is_stub: bool,
    chip: Chip,
) -> Result<(), Error> {
    debug!("Using SoftReset reset strategy");

    if !is_stub {
        connection
            .command_with_timeout(
                CommandType::FlashBegin.timeout(),
                Command::FlashBegin {
                    erase_size: 0,
                    blocks: 0,
                    block_size: crate::flasher::FLASH_WRITE_SIZE as u32,
                    offset: 0,
                    supports_encryption: true,
                },
            )
            .await?;
        connection
            .command_with_timeout(
                CommandType::FlashEnd.timeout(),
                Command::FlashEnd { reboot: false },
            )
            .await?;
    } else if chip != Chip::Esp8266 {
        return Err(Error::UnsupportedFeature {
            chip,
            feature: "soft resetting from the stub".into(),
        });
    } else {
        // Running user code from the stub loader requires some hacks in the
        // stub loader, and the command never answers.
        connection.write_command(Command::RunUserCode).await?;
    }

    Ok(())
}

/// Reset behavior ahead of connecting to the target.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Hash,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum ResetBeforeOperation {
    /// Uses DTR & RTS serial control lines to try to reset the chip into
    /// bootloader mode.
    #[default]
    DefaultReset,
    /// Skips DTR/RTS control signal assignments and just starts sending the
    /// serial synchronisation command to the chip.
    NoReset,
}
