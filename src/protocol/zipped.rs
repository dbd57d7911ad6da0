//! TRex compressed message framing.
//!
//! Large messages travel as
//!
//! ```text
//! +------------------+-----------------------+-------------------+
//! | magic (u32, BE)  | plain length (u32 BE) | zlib stream ...   |
//! +------------------+-----------------------+-------------------+
//! ```
//!
//! Anything not starting with the magic is a plain message.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{Result, RpcError};

/// Header magic of a compressed message.
pub const MAGIC: u32 = 0xABE8_5CEA;

/// Size the TRex server itself uses as compression threshold.
pub const DEFAULT_THRESHOLD: usize = 256;

const HEADER_LEN: usize = 8;

/// Upper bound on the buffer reserved from a frame header.
const MAX_PREALLOC: usize = 1 << 20;

/// Returns true if `payload` carries the compressed-message header.
pub fn is_compressed(payload: &[u8]) -> bool {
    // ---
    payload.len() >= HEADER_LEN && payload[..4] == MAGIC.to_be_bytes()
}

/// Wrap `payload` in a compressed frame.
pub fn compress(payload: &[u8]) -> Result<Bytes> {
    // ---
    let plain_len = u32::try_from(payload.len())
        .map_err(|_| RpcError::InvalidArgument("message too large to compress".into()))?;

    let compression_failed = |err: std::io::Error| RpcError::Protocol(format!("compression failed: {err}"));

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).map_err(compression_failed)?;
    let stream = encoder.finish().map_err(compression_failed)?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + stream.len());
    frame.put_u32(MAGIC);
    frame.put_u32(plain_len);
    frame.extend_from_slice(&stream);
    Ok(frame.freeze())
}

/// Unwrap a compressed frame.
///
/// Returns `Ok(None)` for plain messages.
pub fn decompress(payload: &[u8]) -> Result<Option<Bytes>> {
    // ---
    if !is_compressed(payload) {
        return Ok(None);
    }

    let plain_len = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

    // the header length is untrusted until the stream confirms it
    let mut plain = Vec::with_capacity(plain_len.min(MAX_PREALLOC));
    ZlibDecoder::new(&payload[HEADER_LEN..])
        .read_to_end(&mut plain)
        .map_err(|err| RpcError::Protocol(format!("corrupt compressed message: {err}")))?;

    if plain.len() != plain_len {
        return Err(RpcError::Protocol(format!(
            "compressed message length mismatch: header {plain_len}, got {}",
            plain.len()
        )));
    }

    Ok(Some(Bytes::from(plain)))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_header_layout() {
        // ---
        let frame = compress(b"{\"jsonrpc\":\"2.0\"}").unwrap();
        assert_eq!(&frame[..4], &[0xAB, 0xE8, 0x5C, 0xEA]);
        assert_eq!(&frame[4..8], &17u32.to_be_bytes());
        assert!(is_compressed(&frame));
    }

    #[test]
    fn test_large_message_restored() {
        // ---
        let plain = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": vec!["stream"; 200],
        }))
        .unwrap();
        assert!(plain.len() > DEFAULT_THRESHOLD);

        let frame = compress(&plain).unwrap();
        assert!(frame.len() < plain.len());
        assert_eq!(decompress(&frame).unwrap().unwrap(), plain);
    }

    #[test]
    fn test_plain_passthrough() {
        // ---
        let plain = Bytes::from_static(b"{\"name\":\"trex-global\"}");
        assert!(!is_compressed(&plain));
        assert_eq!(decompress(&plain).unwrap(), None);
    }

    #[test]
    fn test_corrupt_stream_rejected() {
        // ---
        let mut frame = BytesMut::new();
        frame.put_u32(MAGIC);
        frame.put_u32(10);
        frame.extend_from_slice(b"not zlib at all");
        assert!(matches!(decompress(&frame), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_huge_header_length_rejected() {
        // ---
        let mut frame = BytesMut::from(&compress(b"hello trex").unwrap()[..]);
        frame[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decompress(&frame), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        // ---
        let mut frame = BytesMut::from(&compress(b"hello trex").unwrap()[..]);
        frame[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(decompress(&frame), Err(RpcError::Protocol(_))));
    }
}
