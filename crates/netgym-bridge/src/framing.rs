//! Length-prefixed JSON framing for the wire protocol.
//!
//! Every message on the wire is a 4-byte **little-endian** `u32` length prefix
//! followed by that many bytes of UTF-8 JSON payload. The prefix lets a reader
//! know how many bytes a message needs before consuming any of its payload,
//! so partially received frames can be buffered and completed later.
//!
//! # Wire format
//!
//! ```text
//! +----------------+------------------+
//! | Length (4B LE) | JSON Payload     |
//! +----------------+------------------+
//! ```
//!
//! Encoding is deterministic: the same value always yields the same bytes.

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::protocol::{CodecError, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE};

/// Encode `msg` into one complete frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_MESSAGE_SIZE)
        .ok_or(CodecError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Total size (prefix included) of the frame at the start of `buf`.
///
/// Returns `Ok(None)` while fewer than [`LENGTH_PREFIX_SIZE`] bytes are
/// buffered.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    let Some(prefix) = buf.first_chunk::<LENGTH_PREFIX_SIZE>() else {
        return Ok(None);
    };
    let len = u32::from_le_bytes(*prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(Some(LENGTH_PREFIX_SIZE + len))
}

/// Decode the frame at the start of `buf`, if it is complete.
///
/// Returns the message and the number of bytes it occupied, or `Ok(None)`
/// when more bytes are needed. Nothing past the first frame is inspected.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, CodecError> {
    match frame_len(buf)? {
        Some(total) if buf.len() >= total => {
            let msg = serde_json::from_slice(&buf[LENGTH_PREFIX_SIZE..total])?;
            Ok(Some((msg, total)))
        }
        _ => Ok(None),
    }
}

/// Decode exactly one complete frame.
///
/// A truncated frame or trailing bytes are errors; nothing is dropped.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let needed = frame_len(bytes)?.unwrap_or(LENGTH_PREFIX_SIZE);
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    if bytes.len() > needed {
        return Err(CodecError::TrailingBytes {
            trailing: bytes.len() - needed,
        });
    }
    Ok(serde_json::from_slice(&bytes[LENGTH_PREFIX_SIZE..])?)
}

/// Read a length-prefixed JSON message from a stream.
///
/// Returns `Ok(None)` if the stream reaches EOF before any bytes are read
/// (clean disconnect). Returns an error if the length prefix or payload
/// cannot be read, the payload exceeds [`MAX_MESSAGE_SIZE`], or the JSON
/// is invalid.
pub fn read_message<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>, CodecError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CodecError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let msg: T = serde_json::from_slice(&payload)?;
    Ok(Some(msg))
}

/// Write a length-prefixed JSON message to a stream.
///
/// The stream is flushed after writing.
pub fn write_message<T: Serialize>(writer: &mut impl Write, msg: &T) -> Result<(), CodecError> {
    let frame = encode(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
