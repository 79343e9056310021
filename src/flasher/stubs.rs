//! Flasher stub payloads.
//!
//! Stub binaries are built out of tree and shipped as small JSON documents:
//! load addresses plus base64-encoded, zlib-compressed text and data
//! segments. The engine treats them as opaque; any stub following the
//! interchange format can be uploaded.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use miniz_oxide::{deflate::compress_to_vec_zlib, inflate::decompress_to_vec_zlib};
use serde::Deserialize;

use crate::error::Error;

/// Address of the register holding the chip-family magic value.
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Default timeout for commands once a connection is established.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Timeout for one read while waiting for the stub to come up.
pub(crate) const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Greeting the stub prints once it is up and serving commands.
pub(crate) const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

/// A flasher stub ready to be uploaded into target RAM.
#[derive(Debug, Clone, Deserialize)]
pub struct FlashStub {
    /// Entry point address.
    entry: u32,
    /// Base64-encoded, zlib-compressed text segment.
    text: String,
    /// Load address of the text segment.
    text_start: u32,
    /// Base64-encoded, zlib-compressed data segment.
    data: String,
    /// Load address of the data segment.
    data_start: u32,
}

impl FlashStub {
    /// Parses a stub from its JSON interchange form.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::InvalidStub(e.to_string()))
    }

    /// Builds a stub from raw segments, compressing and encoding them into
    /// the interchange form.
    pub fn from_segments(entry: u32, text: (u32, &[u8]), data: (u32, &[u8])) -> Self {
        FlashStub {
            entry,
            text: BASE64.encode(compress_to_vec_zlib(text.1, 10)),
            text_start: text.0,
            data: BASE64.encode(compress_to_vec_zlib(data.1, 10)),
            data_start: data.0,
        }
    }

    /// Entry point address of the stub.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Load address and decompressed contents of the text segment.
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.text_start, decode_segment(&self.text)?))
    }

    /// Load address and decompressed contents of the data segment.
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        Ok((self.data_start, decode_segment(&self.data)?))
    }
}

fn decode_segment(encoded: &str) -> Result<Vec<u8>, Error> {
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| Error::InvalidStub(format!("invalid base64 in stub segment: {e}")))?;

    decompress_to_vec_zlib(&compressed)
        .map_err(|_| Error::InvalidStub("stub segment is not valid zlib data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_survive_the_interchange_form() {
        let text: Vec<u8> = (0..=255).collect();
        let data = [0xC0u8, 0xDB, 0x55, 0xAA];

        let stub = FlashStub::from_segments(0x4010_0000, (0x4010_0000, &text), (0x3ffe_8000, &data));

        assert_eq!(stub.entry(), 0x4010_0000);
        assert_eq!(stub.text().unwrap(), (0x4010_0000, text));
        assert_eq!(stub.data().unwrap(), (0x3ffe_8000, data.to_vec()));
    }

    #[test]
    fn json_round_trip() {
        let stub = FlashStub::from_segments(0x1000, (0x2000, b"text seg"), (0x3000, b"data seg"));
        let json = format!(
            r#"{{"entry":{},"text":"{}","text_start":{},"data":"{}","data_start":{}}}"#,
            stub.entry, stub.text, stub.text_start, stub.data, stub.data_start
        );

        let parsed = FlashStub::from_json(&json).unwrap();
        assert_eq!(parsed.text().unwrap().1, b"text seg");
        assert_eq!(parsed.data().unwrap().1, b"data seg");
    }

    #[test]
    fn malformed_stub_is_rejected() {
        assert!(FlashStub::from_json("{}").is_err());

        let bogus = FlashStub {
            entry: 0,
            text: "not base64!".to_string(),
            text_start: 0,
            data: String::new(),
            data_start: 0,
        };
        assert!(matches!(bogus.text(), Err(Error::InvalidStub(_))));
    }
}
