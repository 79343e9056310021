//! A library for flashing Espressif devices over their serial bootloader.
//!
//! `esploader` speaks the ROM bootloader protocol of the ESP32 family and the
//! ESP8266: SLIP framing, the command/response exchange, the
//! reset-into-bootloader handshake, the in-RAM flasher stub bootstrap, and
//! chunked flash programming with MD5 verification.
//!
//! The serial transport is abstracted behind the async
//! [SerialInterface](connection::SerialInterface) trait; with the default
//! `serialport` feature enabled an implementation for native serial ports is
//! provided. A typical session:
//!
//! ```no_run
//! # async fn example() -> Result<(), esploader::Error> {
//! use esploader::{
//!     connection::{Connection, DEFAULT_CONNECT_ATTEMPTS, ResetBeforeOperation},
//!     flasher::{DefaultProgressCallback, Flasher, WriteFlashOptions},
//!     image_format::Segment,
//! };
//!
//! let serial = serialport::new("/dev/ttyUSB0", 115_200)
//!     .open_native()
//!     .expect("failed to open serial port");
//!
//! let mut flasher = Flasher::new(Connection::new(serial, 115_200));
//! flasher
//!     .connect(ResetBeforeOperation::DefaultReset, DEFAULT_CONNECT_ATTEMPTS, false)
//!     .await?;
//!
//! let segment = Segment::new(0x1000, &[0xE9, 0x02, 0x02, 0x20][..]);
//! flasher
//!     .write_flash(
//!         &[segment],
//!         &WriteFlashOptions::default(),
//!         &mut DefaultProgressCallback,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `serialport` (default): native serial port support via the `serialport`
//!   crate.
//! - `cli`: `clap::ValueEnum` derives on argument-like enums.

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod target;

pub use self::error::Error;
