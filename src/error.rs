//! Library errors.
//!
//! All fallible operations in this crate return [Error]. Transport-level
//! faults are wrapped in [ConnectionError], while protocol-level rejections
//! reported by the ROM loader itself are wrapped in [RomError].

use std::array::TryFromSliceError;
use std::fmt;

use thiserror::Error;

use crate::{
    command::CommandType,
    connection::{SerialPortError, SerialPortErrorKind},
    flasher::FlashSize,
    target::Chip,
};

/// All possible errors returned by this library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Error while connecting to or communicating with the device.
    #[error("Error while connecting to device")]
    Connection(#[source] Box<ConnectionError>),

    /// The device returned an error status for a command.
    #[error("Error while running command")]
    RomError(#[source] Box<RomError>),

    /// The device sent back a response this library could not make sense of.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The chip-magic register held a value not matching any known family.
    #[error("Chip detection failed: {0}")]
    ChipDetect(String),

    /// A chip-bound operation was invoked before a chip was detected.
    #[error("No chip detected; connect to the device before this operation")]
    ChipNotDetected,

    /// The requested operation is only implemented by the flasher stub.
    #[error("Operation requires the flasher stub to be running")]
    StubRequired,

    /// The stub payload could not be decoded.
    #[error("Invalid flasher stub: {0}")]
    InvalidStub(String),

    /// A segment does not fit within the configured flash size.
    #[error(
        "Segment {segment} at {address:#010x} ({size:#x} bytes) does not fit in {flash_size} of flash"
    )]
    ImageDoesNotFit {
        /// Index of the offending segment.
        segment: usize,
        /// Flash address of the segment.
        address: u32,
        /// Size of the segment in bytes.
        size: usize,
        /// The configured flash size.
        flash_size: FlashSize,
    },

    /// The given string does not name a known flash size.
    #[error("Invalid flash size: {0}")]
    InvalidFlashSize(String),

    /// The flash size has no encoding for the detected chip.
    #[error("Flash size {size} is not supported by the {chip}")]
    UnsupportedFlashSize {
        /// The detected chip.
        chip: Chip,
        /// The unsupported size.
        size: FlashSize,
    },

    /// The MD5 digest of the flash contents does not match the written image.
    #[error("MD5 of flash does not match the image: expected {expected}, computed {computed}")]
    VerifyFailed {
        /// Digest of the image that was written.
        expected: String,
        /// Digest the device computed over flash.
        computed: String,
    },

    /// The SPI controller did not clear the user-command bit in time.
    #[error("SPI command did not complete in time")]
    SpiCommandTimeout,

    /// The requested SPI transaction exceeds the controller's limits.
    #[error("Unsupported SPI flash operation: {0}")]
    UnsupportedSpiOperation(String),

    /// A feature was requested which the detected chip does not provide.
    #[error("The {chip} does not support {feature}")]
    UnsupportedFeature {
        /// The detected chip.
        chip: Chip,
        /// Description of the missing feature.
        feature: String,
    },

    /// Response bytes were too short for the field being parsed.
    #[error(transparent)]
    TryFromSlice(#[from] TryFromSliceError),
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(Box::new(err))
    }
}

impl From<RomError> for Error {
    fn from(err: RomError) -> Self {
        Error::RomError(Box::new(err))
    }
}

impl From<SerialPortError> for Error {
    fn from(err: SerialPortError) -> Self {
        match err.kind {
            SerialPortErrorKind::Timeout => {
                Error::Connection(Box::new(ConnectionError::Timeout(TimedOutCommand::default())))
            }
            _ => Error::Connection(Box::new(ConnectionError::Serial(err))),
        }
    }
}

/// Connection-related errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Failed to connect to the device.
    #[error("Failed to connect to the device")]
    ConnectionFailed,

    /// The device is not in download mode.
    #[error("The device is not in download mode (boot mode: {0})")]
    WrongBootMode(String),

    /// Download mode was reported but the device never replied to a sync.
    #[error("Download mode detected, but the device did not reply to synchronization")]
    NoSyncReply,

    /// The stub never reported itself alive after being started.
    #[error("Invalid stub handshake response received")]
    InvalidStubHandshake,

    /// A read did not observe a complete frame within its timeout.
    #[error("Timeout while running {0}command")]
    Timeout(TimedOutCommand),

    /// An error in the underlying serial port.
    #[error("Serial port error")]
    Serial(#[source] SerialPortError),
}

/// A timeout, optionally attributed to the command that was in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl fmt::Display for TimedOutCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            Some(command) => write!(f, "{command} "),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// An error originating from the ROM loader running on a target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Error while running {command} command: {kind}")]
pub struct RomError {
    command: CommandType,
    kind: RomErrorKind,
}

impl RomError {
    /// Create a new [RomError] for the given command.
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

/// Error codes reported by the ROM loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    /// The message received by the device was invalid.
    #[error("Invalid message received")]
    InvalidMessage = 0x05,
    /// The device failed to act on the message.
    #[error("Failed to act on received message")]
    FailedToAct = 0x06,
    /// The payload had an invalid CRC.
    #[error("Invalid CRC in message")]
    InvalidCrc = 0x07,
    /// Writing to flash failed.
    #[error("Flash write error")]
    WriteError = 0x08,
    /// Reading from flash failed.
    #[error("Flash read error")]
    ReadError = 0x09,
    /// The requested flash read length was too large.
    #[error("Flash read length error")]
    ReadLengthError = 0x0A,
    /// Decompression of the payload failed.
    #[error("Deflate error")]
    DeflateError = 0x0B,
    /// An unknown error code.
    #[error("Other")]
    Other = 0xFF,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::WriteError,
            0x09 => RomErrorKind::ReadError,
            0x0A => RomErrorKind::ReadLengthError,
            0x0B => RomErrorKind::DeflateError,
            _ => RomErrorKind::Other,
        }
    }
}

/// Attach the in-flight command type to timeout errors.
pub(crate) trait ResultExt {
    /// Mark a timeout as having occurred while running `command`.
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(err)) if matches!(*err, ConnectionError::Timeout(_)) => {
                Err(ConnectionError::Timeout(command.into()).into())
            }
            res => res,
        }
    }
}
