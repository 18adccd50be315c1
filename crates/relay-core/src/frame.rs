//! Length-prefixed framing for the DNS relay path, plus the one-shot
//! session response framer.
//!
//! DNS messages cross the tunnel as `[2-byte big-endian length][message]`,
//! repeated. Frames may be split or concatenated arbitrarily by the
//! transport; [`FrameDecoder`] buffers partial frames across chunks.

use crate::error::{TunnelError, TunnelResult};

/// Encode a DNS message as a length-prefixed frame.
pub fn frame_encode(payload: &[u8]) -> TunnelResult<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(TunnelError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete messages.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;

            if self.buffer.len() < 2 + len {
                break;
            }

            let payload = self.buffer[2..2 + len].to_vec();
            messages.push(payload);
            self.buffer.drain(..2 + len);
        }

        messages
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Prepends the fixed 2-byte session response header `[version, 0]` to the
/// first chunk it frames; every later chunk passes through untouched.
#[derive(Debug)]
pub struct ResponseFramer {
    header: [u8; 2],
    sent: bool,
}

impl ResponseFramer {
    pub fn new(version: u8) -> Self {
        Self {
            header: [version, 0],
            sent: false,
        }
    }

    /// Frame an outbound chunk. The header is emitted exactly once per
    /// session, whichever path (TCP or DNS) produces the first chunk.
    pub fn frame(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.sent {
            return chunk.to_vec();
        }
        self.sent = true;
        let mut out = Vec::with_capacity(2 + chunk.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(chunk);
        out
    }
}
