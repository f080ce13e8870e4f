// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed framing: a 4-byte big-endian payload length followed by
//! that many bytes of UTF-8 JSON.

use std::io::{self, Read, Write};

/// Per-client receive buffers are 64 KiB; the prefix eats 4 bytes of it.
pub const MAX_FRAME_LEN: usize = 64 * 1024 - 4;

const LEN_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            FrameError::TooLarge(payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Blocking read of one complete frame. Used by clients; the server side
/// accumulates partial reads through [`FrameBuffer`] instead.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; LEN_PREFIX];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FrameError::TooLarge(len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Accumulates bytes from a non-blocking socket and yields complete frames.
/// Any segmentation of the byte stream produces the same frame sequence.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one has fully arrived. A frame
    /// longer than [`MAX_FRAME_LEN`] is a protocol violation; the caller is
    /// expected to close the connection.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        let total = LEN_PREFIX + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[LEN_PREFIX..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
