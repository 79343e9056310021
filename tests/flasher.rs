//! End-to-end tests of the protocol engine against a scripted serial port.

use std::{collections::VecDeque, time::Duration};

use esploader::{
    Error,
    connection::{Connection, ResetBeforeOperation, SerialInterface, SerialPortError},
    error::ConnectionError,
    flasher::{DefaultProgressCallback, Flasher, FlashSize, FlashStub, WriteFlashOptions},
    image_format::Segment,
    target::Chip,
};

/// A serial port that replays a scripted sequence of reads.
///
/// Each entry answers one `read` call; `None` entries (and an exhausted
/// script) time out. Everything written by the engine is captured in `tx`.
#[derive(Debug, Default)]
struct MockSerial {
    reads: VecDeque<Option<Vec<u8>>>,
    tx: Vec<u8>,
    baud: u32,
    timeout: Duration,
}

impl MockSerial {
    fn new(reads: Vec<Option<Vec<u8>>>) -> Self {
        MockSerial {
            reads: reads.into(),
            tx: Vec::new(),
            baud: 115_200,
            timeout: Duration::from_secs(3),
        }
    }
}

impl SerialInterface for MockSerial {
    fn name(&self) -> Option<String> {
        Some("mock".to_string())
    }

    fn baud_rate(&self) -> Result<u32, SerialPortError> {
        Ok(self.baud)
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SerialPortError> {
        self.baud = baud_rate;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialPortError> {
        self.timeout = timeout;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialPortError> {
        match self.reads.pop_front() {
            Some(Some(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            _ => Err(SerialPortError::timeout("scripted timeout")),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), SerialPortError> {
        self.tx.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SerialPortError> {
        Ok(())
    }

    async fn write_data_terminal_ready(&mut self, _level: bool) -> Result<(), SerialPortError> {
        Ok(())
    }

    async fn write_request_to_send(&mut self, _level: bool) -> Result<(), SerialPortError> {
        Ok(())
    }

    async fn delay_ms(&mut self, _ms: u32) {}
}

const TIMEOUT: Option<Vec<u8>> = None;

/// SLIP-frames a response to the given opcode.
fn response(op: u8, value: u32, payload: &[u8]) -> Option<Vec<u8>> {
    let mut raw = vec![0x01, op];
    raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    raw.extend_from_slice(&value.to_le_bytes());
    raw.extend_from_slice(payload);

    let mut framed = vec![0xC0];
    for byte in raw {
        match byte {
            0xC0 => framed.extend_from_slice(&[0xDB, 0xDC]),
            0xDB => framed.extend_from_slice(&[0xDB, 0xDD]),
            _ => framed.push(byte),
        }
    }
    framed.push(0xC0);

    Some(framed)
}

fn ok_status() -> &'static [u8] {
    &[0, 0]
}

/// The reads consumed by a successful connect: boot-chatter drain, sync,
/// post-sync flush, and the chip-magic register read.
fn connect_script(magic: u32) -> Vec<Option<Vec<u8>>> {
    vec![
        TIMEOUT,
        response(0x08, 0, ok_status()),
        TIMEOUT,
        response(0x0A, magic, ok_status()),
    ]
}

async fn connected_flasher(script: Vec<Option<Vec<u8>>>) -> Flasher<MockSerial> {
    let mut flasher = Flasher::new(Connection::new(MockSerial::new(script), 115_200));
    flasher
        .connect(ResetBeforeOperation::DefaultReset, 1, false)
        .await
        .unwrap();
    flasher
}

#[tokio::test]
async fn connect_binds_the_detected_chip() {
    let flasher = connected_flasher(connect_script(0x00f01d83)).await;

    assert_eq!(flasher.chip(), Some(Chip::Esp32));
    assert!(!flasher.is_stub());
    assert_eq!(flasher.flash_write_size(), 0x400);
}

#[tokio::test]
async fn connect_writes_the_sync_preamble() {
    let mut flasher = connected_flasher(connect_script(0x00f01d83)).await;

    let tx = &flasher.connection().serial.tx;
    // First frame on the wire is the sync command: delimiter, then the
    // 8-byte header, then the sync preamble.
    assert_eq!(&tx[..3], &[0xC0, 0x00, 0x08]);
    assert_eq!(&tx[9..13], &[0x07, 0x07, 0x12, 0x20]);
}

#[tokio::test]
async fn unknown_magic_leaves_the_chip_unbound() {
    let mut flasher = Flasher::new(Connection::new(
        MockSerial::new(connect_script(0xdeadbeef)),
        115_200,
    ));
    let result = flasher
        .connect(ResetBeforeOperation::DefaultReset, 1, false)
        .await;

    assert!(matches!(result, Err(Error::ChipDetect(_))));
    assert_eq!(flasher.chip(), None);
}

#[tokio::test]
async fn detection_only_connect_skips_the_magic_read() {
    let mut flasher = Flasher::new(Connection::new(
        MockSerial::new(vec![TIMEOUT, response(0x08, 0, ok_status()), TIMEOUT]),
        115_200,
    ));
    flasher
        .connect(ResetBeforeOperation::DefaultReset, 1, true)
        .await
        .unwrap();

    assert_eq!(flasher.chip(), None);
}

#[tokio::test]
async fn rejected_command_is_a_rom_error() {
    let mut flasher = Flasher::new(Connection::new(
        MockSerial::new(vec![
            // A response to some other opcode carrying the invalid-message
            // status, then the flush's timeout.
            response(0x08, 0, &[0x01, 0x05]),
            TIMEOUT,
        ]),
        115_200,
    ));

    let result = flasher.connection().read_reg(0x4000_1000).await;
    assert!(matches!(result, Err(Error::RomError(_))));
}

fn tiny_stub() -> FlashStub {
    FlashStub::from_segments(
        0x400b_e598,
        (0x400b_e000, &[0x11, 0x22, 0x33, 0x44]),
        (0x3ffd_eba8, &[0x55, 0x66, 0x77, 0x88]),
    )
}

/// The reads consumed by uploading [tiny_stub]: two mem_begin/mem_block
/// pairs and the mem_finish.
fn stub_upload_script() -> Vec<Option<Vec<u8>>> {
    vec![
        response(0x05, 0, ok_status()),
        response(0x07, 0, ok_status()),
        response(0x05, 0, ok_status()),
        response(0x07, 0, ok_status()),
        response(0x06, 0, ok_status()),
    ]
}

#[tokio::test]
async fn stub_greeting_activates_the_stub() {
    let mut script = connect_script(0x00f01d83);
    script.extend(stub_upload_script());
    // Some leftover loader traffic before the greeting.
    script.push(response(0x0A, 0, ok_status()));
    script.push(Some(vec![0xC0, b'O', b'H', b'A', b'I', 0xC0]));

    let mut flasher = connected_flasher(script).await;
    flasher.run_stub(&tiny_stub()).await.unwrap();

    assert!(flasher.is_stub());
    assert_eq!(flasher.flash_write_size(), 0x4000);
}

#[tokio::test]
async fn missing_stub_greeting_is_fatal() {
    let mut script = connect_script(0x00f01d83);
    script.extend(stub_upload_script());
    for _ in 0..100 {
        script.push(Some(vec![0xC0, 0x55, 0xC0]));
    }

    let mut flasher = connected_flasher(script).await;
    let result = flasher.run_stub(&tiny_stub()).await;

    match result {
        Err(Error::Connection(err)) => {
            assert!(matches!(*err, ConnectionError::InvalidStubHandshake))
        }
        other => panic!("expected stub handshake failure, got {other:?}"),
    }
    assert!(!flasher.is_stub());
    assert_eq!(flasher.flash_write_size(), 0x400);
}

#[tokio::test]
async fn uncompressed_write_runs_begin_and_blocks() {
    let mut script = connect_script(0x00f01d83);
    script.push(response(0x02, 0, ok_status()));
    script.push(response(0x03, 0, ok_status()));

    let mut flasher = connected_flasher(script).await;
    let options = WriteFlashOptions {
        compress: false,
        verify: false,
        ..Default::default()
    };
    flasher
        .write_flash(
            &[Segment::new(0x0, vec![0xDE, 0xAD, 0xBE, 0xEF])],
            &options,
            &mut DefaultProgressCallback,
        )
        .await
        .unwrap();

    assert!(flasher.connection().serial.reads.is_empty());
}

#[tokio::test]
async fn empty_segment_issues_no_commands() {
    let mut flasher = connected_flasher(connect_script(0x00f01d83)).await;
    let written_before = flasher.connection().serial.tx.len();

    let options = WriteFlashOptions {
        compress: false,
        verify: false,
        ..Default::default()
    };
    flasher
        .write_flash(
            &[Segment::new(0x1000, Vec::new())],
            &options,
            &mut DefaultProgressCallback,
        )
        .await
        .unwrap();

    assert_eq!(flasher.connection().serial.tx.len(), written_before);
}

#[tokio::test]
async fn oversized_segment_is_a_configuration_error() {
    let mut flasher = connected_flasher(connect_script(0x00f01d83)).await;

    let options = WriteFlashOptions {
        size: Some(FlashSize::_1Mb),
        compress: false,
        verify: false,
        ..Default::default()
    };
    let result = flasher
        .write_flash(
            &[Segment::new(0x000f_fffe, vec![0; 8])],
            &options,
            &mut DefaultProgressCallback,
        )
        .await;

    assert!(matches!(result, Err(Error::ImageDoesNotFit { .. })));
}

#[tokio::test]
async fn md5_mismatch_reports_both_digests() {
    let mut script = connect_script(0x00f01d83);
    script.push(response(0x02, 0, ok_status()));
    script.push(response(0x03, 0, ok_status()));
    // The ROM loader answers with the digest as hex text.
    let mut md5_payload = vec![b'a'; 32];
    md5_payload.extend_from_slice(ok_status());
    script.push(response(0x13, 0, &md5_payload));

    let mut flasher = connected_flasher(script).await;
    let options = WriteFlashOptions {
        compress: false,
        verify: true,
        ..Default::default()
    };
    let result = flasher
        .write_flash(
            &[Segment::new(0x0, vec![0x01, 0x02, 0x03, 0x04])],
            &options,
            &mut DefaultProgressCallback,
        )
        .await;

    match result {
        Err(Error::VerifyFailed { expected, computed }) => {
            assert_eq!(computed, "a".repeat(32));
            assert_ne!(expected, computed);
        }
        other => panic!("expected verification failure, got {other:?}"),
    }
}
