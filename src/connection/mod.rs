//! Establish a connection with a target device.
//!
//! The [Connection] struct abstracts over the serial connection and
//! sending/decoding of commands, and provides higher-level operations with the
//! device.

use std::{fmt, time::Duration};

use log::debug;
use regex::Regex;

use self::{
    codec::{SlipDecoder, SlipEncoder},
    reset::ClassicReset,
};
use crate::{
    command::{Command, CommandResponse, CommandType},
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
};

pub(crate) mod reset;

pub use reset::ResetBeforeOperation;

/// Number of reset-and-sync cycles attempted by default.
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 7;

/// Synchronization attempts per reset.
const MAX_SYNC_ATTEMPTS: usize = 7;
/// Response packets scanned before a command is given up on.
const MAX_RESPONSE_PACKETS: usize = 100;

/// Status code the loader uses to signal an invalid received message.
const ROM_INVALID_RECV_MSG: u8 = 0x05;

/// Timeout for one boot-chatter read after reset.
const BOOT_CHATTER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Timeout used when flushing stray input.
const FLUSH_INPUT_TIMEOUT: Duration = Duration::from_millis(200);

#[cfg(all(feature = "serialport", unix))]
/// Alias for the serial TTYPort.
pub type Port = serialport::TTYPort;
#[cfg(all(feature = "serialport", windows))]
/// Alias for the serial COMPort.
pub type Port = serialport::COMPort;

/// Serial port error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPortErrorKind {
    /// No device found
    NoDevice,
    /// Invalid input
    InvalidInput,
    /// Unknown error
    Unknown,
    /// I/O error
    Io,
    /// Timeout
    Timeout,
}

/// Serial port error type.
#[derive(Debug)]
pub struct SerialPortError {
    /// Error kind
    pub kind: SerialPortErrorKind,
    /// Error description
    pub description: String,
}

impl SerialPortError {
    /// Create a new serial port error.
    pub fn new(kind: SerialPortErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Create an I/O error.
    pub fn io(description: impl Into<String>) -> Self {
        Self::new(SerialPortErrorKind::Io, description)
    }

    /// Create a timeout error.
    pub fn timeout(description: impl Into<String>) -> Self {
        Self::new(SerialPortErrorKind::Timeout, description)
    }
}

impl fmt::Display for SerialPortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

impl std::error::Error for SerialPortError {}

/// Async serial port interface.
///
/// This trait provides an async interface for serial port operations,
/// allowing implementations for both native serial ports (via `serialport`
/// crate) and other transports such as WebSerial bridges.
///
/// Note: We intentionally use `async fn` in this trait without `Send` bounds
/// to support implementations whose futures are not `Send`.
#[allow(async_fn_in_trait)]
pub trait SerialInterface {
    /// Get the port name (e.g., "/dev/ttyUSB0" or "COM3").
    fn name(&self) -> Option<String>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> Result<u32, SerialPortError>;

    /// Set the baud rate.
    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SerialPortError>;

    /// Get the current timeout duration.
    fn timeout(&self) -> Duration;

    /// Set the timeout duration.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialPortError>;

    /// Read data from the serial port.
    ///
    /// A read which observes no data within the configured timeout fails with
    /// a [SerialPortErrorKind::Timeout] error.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialPortError>;

    /// Write all data to the serial port.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialPortError>;

    /// Flush the output buffer.
    async fn flush(&mut self) -> Result<(), SerialPortError>;

    /// Set the DTR (Data Terminal Ready) signal.
    async fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Set the RTS (Request To Send) signal.
    async fn write_request_to_send(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Delay for the specified number of milliseconds.
    async fn delay_ms(&mut self, ms: u32);
}

/// Implementation of [SerialInterface] for the native [Port] type.
#[cfg(feature = "serialport")]
impl SerialInterface for Port {
    fn name(&self) -> Option<String> {
        serialport::SerialPort::name(self)
    }

    fn baud_rate(&self) -> Result<u32, SerialPortError> {
        serialport::SerialPort::baud_rate(self).map_err(|e| SerialPortError::io(e.to_string()))
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SerialPortError> {
        serialport::SerialPort::set_baud_rate(self, baud_rate)
            .map_err(|e| SerialPortError::io(e.to_string()))
    }

    fn timeout(&self) -> Duration {
        serialport::SerialPort::timeout(self)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialPortError> {
        serialport::SerialPort::set_timeout(self, timeout)
            .map_err(|e| SerialPortError::io(e.to_string()))
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialPortError> {
        std::io::Read::read(self, buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                SerialPortError::timeout(e.to_string())
            }
            _ => SerialPortError::io(e.to_string()),
        })
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialPortError> {
        std::io::Write::write_all(self, buf).map_err(|e| SerialPortError::io(e.to_string()))
    }

    async fn flush(&mut self) -> Result<(), SerialPortError> {
        std::io::Write::flush(self).map_err(|e| SerialPortError::io(e.to_string()))
    }

    async fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), SerialPortError> {
        serialport::SerialPort::write_data_terminal_ready(self, level)
            .map_err(|e| SerialPortError::io(e.to_string()))
    }

    async fn write_request_to_send(&mut self, level: bool) -> Result<(), SerialPortError> {
        serialport::SerialPort::write_request_to_send(self, level)
            .map_err(|e| SerialPortError::io(e.to_string()))
    }

    async fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// An established connection with a target device.
pub struct Connection<P: SerialInterface> {
    /// The serial port.
    pub serial: P,
    decoder: SlipDecoder,
    pub(crate) baud: u32,
}

impl<P: SerialInterface + fmt::Debug> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("baud", &self.baud)
            .finish()
    }
}

impl<P: SerialInterface> Connection<P> {
    /// Creates a new connection with a target device.
    pub fn new(serial: P, baud: u32) -> Self {
        Connection {
            serial,
            decoder: SlipDecoder::new(),
            baud,
        }
    }

    /// Resets the device into its bootloader and synchronizes with it.
    ///
    /// Each cycle tries the reset strapping twice, first with the standard
    /// delays and then with the extended delay some silicon revisions need,
    /// stopping at the first successful synchronization.
    pub async fn begin(
        &mut self,
        mode: ResetBeforeOperation,
        attempts: usize,
    ) -> Result<(), Error> {
        for attempt in 0..attempts {
            for extra_delay in [false, true] {
                debug!(
                    "Connection attempt {} (extra delay: {extra_delay})",
                    attempt + 1
                );
                match self.connect_attempt(mode, extra_delay).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!("Failed to connect, error {e:#?}, retrying");
                    }
                }
            }
        }

        Err(Error::Connection(Box::new(
            ConnectionError::ConnectionFailed,
        )))
    }

    /// Runs one reset-drain-sync cycle.
    async fn connect_attempt(
        &mut self,
        mode: ResetBeforeOperation,
        extra_delay: bool,
    ) -> Result<(), Error> {
        let mut download_mode = false;
        let mut boot_mode = String::new();
        let mut boot_log_detected = false;

        if mode != ResetBeforeOperation::NoReset {
            ClassicReset::new(extra_delay)
                .reset(&mut self.serial)
                .await?;
        }

        // Drain whatever the ROM prints while booting. The terminating read
        // timeout is the expected end of the banner, not a failure.
        let mut banner = Vec::new();
        loop {
            match self.read_raw_with_timeout(BOOT_CHATTER_TIMEOUT).await {
                Ok(bytes) => {
                    banner.extend_from_slice(&bytes);
                    self.serial.delay_ms(50).await;
                }
                Err(Error::Connection(e)) if matches!(*e, ConnectionError::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }

        let read_slice = String::from_utf8_lossy(&banner).into_owned();

        let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)([\s\S]*waiting for download)?").unwrap();

        if let Some(data) = pattern.captures(&read_slice) {
            boot_log_detected = true;
            boot_mode = data
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            download_mode = data.get(2).is_some();

            debug!("Boot Mode: {boot_mode}");
            debug!("Download Mode: {download_mode}");
        }

        for _ in 0..MAX_SYNC_ATTEMPTS {
            if self.sync().await.is_ok() {
                return Ok(());
            }
            self.serial.delay_ms(50).await;
        }

        if boot_log_detected {
            if download_mode {
                return Err(Error::Connection(Box::new(ConnectionError::NoSyncReply)));
            } else {
                return Err(Error::Connection(Box::new(ConnectionError::WrongBootMode(
                    boot_mode,
                ))));
            }
        }

        Err(Error::Connection(Box::new(
            ConnectionError::ConnectionFailed,
        )))
    }

    /// Syncs with a device.
    pub(crate) async fn sync(&mut self) -> Result<(), Error> {
        self.command_with_timeout(CommandType::Sync.timeout(), Command::Sync)
            .await?;
        Ok(())
    }

    /// Sets the timeout for the serial port.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }

    /// Sets the baud rate for the serial port.
    pub async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.serial.set_baud_rate(baud).await?;
        self.baud = baud;
        Ok(())
    }

    /// Returns the current baud rate of the serial port.
    pub fn baud(&self) -> Result<u32, Error> {
        Ok(self.serial.baud_rate()?)
    }

    /// Reads one decoded frame, assembling it across as many reads as needed.
    ///
    /// Bytes read past the terminating frame delimiter are retained and
    /// served by subsequent reads, as are the bytes of an incomplete frame
    /// when a read times out.
    pub(crate) async fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }

            let mut buf = [0u8; 1024];
            let n = self.serial.read(&mut buf).await?;
            if n == 0 {
                continue;
            }
            self.decoder.feed(&buf[..n]);
        }
    }

    /// Reads raw bytes, serving any carry-over from earlier reads first.
    pub(crate) async fn read_raw(&mut self) -> Result<Vec<u8>, Error> {
        if self.decoder.has_buffered() {
            return Ok(self.decoder.take_buffer());
        }

        let mut buf = [0u8; 1024];
        let n = self.serial.read(&mut buf).await?;
        Ok(buf[..n].to_vec())
    }

    async fn read_raw_with_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;
        let result = self.read_raw().await;
        self.serial.set_timeout(old_timeout)?;
        result
    }

    /// Discards any stray input. Errors (including the expected timeout) are
    /// swallowed.
    pub(crate) async fn flush_input(&mut self) {
        let _ = self.read_raw_with_timeout(FLUSH_INPUT_TIMEOUT).await;
    }

    /// Reads and parses the next response frame.
    ///
    /// Frames too short to carry a response header yield `None`.
    pub(crate) async fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let frame = self.read_frame().await?;
        if frame.len() < 8 {
            return Ok(None);
        }

        Ok(Some(CommandResponse {
            resp: frame[0],
            return_op: frame[1],
            return_length: u16::from_le_bytes(frame[2..4].try_into()?),
            value: u32::from_le_bytes(frame[4..8].try_into()?),
            payload: frame[8..].to_vec(),
        }))
    }

    /// Writes a command to the serial port without waiting for a response.
    ///
    /// This is the fire-and-forget path, used for the one command which never
    /// answers.
    pub async fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {command:02x?}");

        let mut buf = Vec::new();
        let mut writer = io::VecWriter::new(&mut buf);
        let mut encoder = SlipEncoder::new(&mut writer).await.unwrap();
        command.write(&mut encoder).await.unwrap();
        encoder.finish().await.unwrap();

        self.serial.write_all(&buf).await?;
        self.serial.flush().await?;
        Ok(())
    }

    /// Writes a command and scans incoming frames for its response.
    ///
    /// Up to 100 frames are considered. A frame is a match when its direction
    /// byte marks it as a response and its opcode echoes the request; the
    /// match's value field and payload are returned.
    pub async fn command(&mut self, command: Command<'_>) -> Result<(u32, Vec<u8>), Error> {
        let ty = command.command_type();
        self.write_command(command).await.for_command(ty)?;

        for _ in 0..MAX_RESPONSE_PACKETS {
            let Some(response) = self.read_response().await.for_command(ty)? else {
                continue;
            };

            if response.resp != 1 {
                continue;
            }

            if response.return_op == ty as u8 {
                return Ok((response.value, response.payload));
            }

            // A response to some other opcode carrying the "invalid message"
            // status means the loader rejected the request outright.
            if response.payload.first().is_some_and(|&status| status != 0)
                && response.payload.get(1) == Some(&ROM_INVALID_RECV_MSG)
            {
                self.flush_input().await;
                return Err(RomError::new(ty, RomErrorKind::InvalidMessage).into());
            }
        }

        Err(Error::InvalidResponse(format!(
            "no response to {ty} within {MAX_RESPONSE_PACKETS} packets"
        )))
    }

    /// Runs a command with the given serial timeout, restoring the previous
    /// timeout afterwards.
    pub async fn command_with_timeout(
        &mut self,
        timeout: Duration,
        command: Command<'_>,
    ) -> Result<(u32, Vec<u8>), Error> {
        let ty = command.command_type();
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;
        let result = self.command(command).await;
        self.serial.set_timeout(old_timeout)?;
        result.for_command(ty)
    }

    /// Like [Connection::command_with_timeout], but collapses the response to
    /// a single payload: the response payload when it carries more than four
    /// bytes, otherwise the value field re-encoded as four bytes.
    pub async fn check_command(
        &mut self,
        timeout: Duration,
        command: Command<'_>,
    ) -> Result<Vec<u8>, Error> {
        let (value, payload) = self.command_with_timeout(timeout, command).await?;
        if payload.len() > 4 {
            Ok(payload)
        } else {
            Ok(value.to_le_bytes().to_vec())
        }
    }

    /// Reads a register.
    pub async fn read_reg(&mut self, addr: u32) -> Result<u32, Error> {
        let (value, _) = self
            .command_with_timeout(
                CommandType::ReadReg.timeout(),
                Command::ReadReg { address: addr },
            )
            .await?;
        Ok(value)
    }

    /// Writes a register.
    pub async fn write_reg(
        &mut self,
        addr: u32,
        value: u32,
        mask: Option<u32>,
    ) -> Result<(), Error> {
        self.command_with_timeout(
            CommandType::WriteReg.timeout(),
            Command::WriteReg {
                address: addr,
                value,
                mask,
            },
        )
        .await?;
        Ok(())
    }

    /// Flushes the serial port.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush().await?;
        Ok(())
    }

    /// Turns a connection into its serial port.
    pub fn into_serial(self) -> P {
        self.serial
    }
}

/// I/O adapters for bridging embedded_io_async with std::io
mod io {
    use core::convert::Infallible;

    /// A writer that appends to a Vec<u8>, implementing embedded_io_async::Write.
    pub struct VecWriter<'a> {
        vec: &'a mut Vec<u8>,
    }

    impl<'a> VecWriter<'a> {
        pub fn new(vec: &'a mut Vec<u8>) -> Self {
            Self { vec }
        }
    }

    impl embedded_io_async::ErrorType for VecWriter<'_> {
        type Error = Infallible;
    }

    impl embedded_io_async::Write for VecWriter<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.vec.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }
}

/// SLIP protocol constants
const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

pub(crate) mod codec {
    //! SLIP framing: an escaping encoder and a carry-over decoder.

    use embedded_io_async::Write;

    use super::{SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};

    /// SLIP decoder over an accumulated byte stream.
    ///
    /// Raw bytes are fed in as they arrive; [SlipDecoder::next_frame] yields
    /// at most one frame per call and retains everything beyond the frame's
    /// terminating delimiter for later calls. Partial frames survive timeout
    /// boundaries in the same buffer.
    #[derive(Debug, Default)]
    pub struct SlipDecoder {
        buffer: Vec<u8>,
    }

    impl SlipDecoder {
        /// Creates a new SLIP decoder.
        pub fn new() -> Self {
            Self { buffer: Vec::new() }
        }

        /// Appends raw bytes read from the transport.
        pub fn feed(&mut self, bytes: &[u8]) {
            self.buffer.extend_from_slice(bytes);
        }

        /// Returns whether any bytes are buffered.
        pub fn has_buffered(&self) -> bool {
            !self.buffer.is_empty()
        }

        /// Takes all buffered bytes out of the decoder, unprocessed.
        pub fn take_buffer(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.buffer)
        }

        /// Extracts the first complete frame from the buffer.
        ///
        /// Returns `None` when no complete `0xC0 … 0xC0` span exists yet; the
        /// entire input is retained so the caller can supply more bytes.
        pub fn next_frame(&mut self) -> Option<Vec<u8>> {
            loop {
                let start = self.buffer.iter().position(|&b| b == SLIP_END)?;
                let len = self.buffer[start + 1..]
                    .iter()
                    .position(|&b| b == SLIP_END)?;
                if len == 0 {
                    // Adjacent delimiters; the second may open the real frame.
                    self.buffer.drain(..=start);
                    continue;
                }

                let frame = unescape(&self.buffer[start + 1..start + 1 + len]);
                self.buffer.drain(..start + len + 2);
                return Some(frame);
            }
        }
    }

    fn unescape(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            match (data[i], data.get(i + 1)) {
                (SLIP_ESC, Some(&SLIP_ESC_END)) => {
                    out.push(SLIP_END);
                    i += 2;
                }
                (SLIP_ESC, Some(&SLIP_ESC_ESC)) => {
                    out.push(SLIP_ESC);
                    i += 2;
                }
                (byte, _) => {
                    out.push(byte);
                    i += 1;
                }
            }
        }
        out
    }

    /// Encoder for the SLIP protocol.
    #[derive(Debug, PartialEq, Eq, Hash)]
    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context.
        pub async fn new(writer: &'a mut W) -> Result<Self, W::Error> {
            let len = writer.write(&[SLIP_END]).await?;
            Ok(Self { writer, len })
        }

        /// Finishes the encoding.
        pub async fn finish(mut self) -> Result<usize, W::Error> {
            self.len += self.writer.write(&[SLIP_END]).await?;
            Ok(self.len)
        }
    }

    impl<W: Write> embedded_io_async::ErrorType for SlipEncoder<'_, W> {
        type Error = W::Error;
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            for value in buf.iter() {
                match *value {
                    SLIP_END => {
                        self.len += self.writer.write(&[SLIP_ESC, SLIP_ESC_END]).await?;
                    }
                    SLIP_ESC => {
                        self.len += self.writer.write(&[SLIP_ESC, SLIP_ESC_ESC]).await?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value]).await?;
                    }
                }
            }

            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            self.writer.flush().await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct VecWriter(Vec<u8>);

        impl embedded_io_async::ErrorType for VecWriter {
            type Error = core::convert::Infallible;
        }

        impl Write for VecWriter {
            async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }

            async fn flush(&mut self) -> Result<(), Self::Error> {
                Ok(())
            }
        }

        async fn encode(data: &[u8]) -> Vec<u8> {
            let mut writer = VecWriter(Vec::new());
            let mut encoder = SlipEncoder::new(&mut writer).await.unwrap();
            encoder.write(data).await.unwrap();
            encoder.finish().await.unwrap();
            writer.0
        }

        #[tokio::test]
        async fn encoder_escapes_delimiters() {
            assert_eq!(
                encode(&[0x01, 0xC0, 0x02]).await,
                vec![0xC0, 0x01, 0xDB, 0xDC, 0x02, 0xC0]
            );
            assert_eq!(
                encode(&[0xDB, 0x03]).await,
                vec![0xC0, 0xDB, 0xDD, 0x03, 0xC0]
            );
        }

        #[tokio::test]
        async fn frames_round_trip() {
            let payloads: &[&[u8]] = &[
                &[0x00],
                &[0x01, 0x02, 0x03],
                &[0xC0, 0xDB, 0xC0, 0xDB],
                &[0xDB, 0xDC, 0xDD, 0xC0, 0x55],
            ];

            for payload in payloads {
                let wire = encode(payload).await;
                let mut decoder = SlipDecoder::new();
                decoder.feed(&wire);
                assert_eq!(decoder.next_frame().as_deref(), Some(*payload));
                assert!(decoder.next_frame().is_none());
            }
        }

        #[tokio::test]
        async fn decoder_buffers_partial_frames() {
            let wire = encode(&[0x11, 0x22, 0x33]).await;
            let (head, tail) = wire.split_at(3);

            let mut decoder = SlipDecoder::new();
            decoder.feed(head);
            assert!(decoder.next_frame().is_none());
            decoder.feed(tail);
            assert_eq!(decoder.next_frame(), Some(vec![0x11, 0x22, 0x33]));
        }

        #[tokio::test]
        async fn decoder_retains_trailing_bytes() {
            let mut wire = encode(&[0xAA]).await;
            wire.extend_from_slice(&[0xC0, 0xBB]);

            let mut decoder = SlipDecoder::new();
            decoder.feed(&wire);
            assert_eq!(decoder.next_frame(), Some(vec![0xAA]));
            assert!(decoder.next_frame().is_none());
            assert_eq!(decoder.take_buffer(), vec![0xC0, 0xBB]);
        }

        #[test]
        fn decoder_skips_junk_before_frame() {
            let mut decoder = SlipDecoder::new();
            decoder.feed(&[0x55, 0x56, 0xC0, 0x01, 0x02, 0xC0]);
            assert_eq!(decoder.next_frame(), Some(vec![0x01, 0x02]));
        }

        #[test]
        fn decoder_returns_one_frame_per_call() {
            let mut decoder = SlipDecoder::new();
            decoder.feed(&[0xC0, 0x01, 0xC0, 0xC0, 0x02, 0xC0]);
            assert_eq!(decoder.next_frame(), Some(vec![0x01]));
            assert_eq!(decoder.next_frame(), Some(vec![0x02]));
            assert!(decoder.next_frame().is_none());
        }
    }
}
