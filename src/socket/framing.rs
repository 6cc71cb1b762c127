//! Frame codec for the local IPC transport.
//!
//! Every envelope travels as one length-prefixed frame:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! `0 < length <= MAX_FRAME_SIZE`. Anything else is a protocol violation;
//! the stream cannot be resynchronized and the connection must close.
//!
//! Two decoders share the same validation: [`decode_frame`] pulls exactly one
//! frame from a blocking [`Read`], and [`FrameDecoder`] reassembles frames
//! from arbitrarily sized chunks for the async reader task.

use std::fmt;
use std::io::{self, Read};

use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};

/// Frame-level protocol errors.
#[derive(Debug)]
pub enum FrameError {
    /// Payload exceeds [`MAX_FRAME_SIZE`] and cannot be sent.
    OversizedPayload(usize),
    /// Declared length is zero or above [`MAX_FRAME_SIZE`].
    InvalidFrameSize(u32),
    /// Stream ended inside the 4-byte length header.
    TruncatedHeader {
        /// Header bytes received before end of stream.
        got: usize,
    },
    /// Stream ended inside the frame body.
    TruncatedBody {
        /// Declared body length.
        expected: usize,
        /// Body bytes received before end of stream.
        got: usize,
    },
    /// Underlying read failed.
    Io(io::Error),
}

impl FrameError {
    /// True for errors that mean the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::TruncatedHeader { .. } | Self::TruncatedBody { .. } | Self::Io(_)
        )
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OversizedPayload(len) => {
                write!(f, "Payload too large: {len} bytes (max {MAX_FRAME_SIZE})")
            }
            Self::InvalidFrameSize(len) => {
                write!(f, "Invalid frame size: {len} (must be 1..={MAX_FRAME_SIZE})")
            }
            Self::TruncatedHeader { got } => {
                write!(f, "Stream ended in frame header ({got}/{FRAME_HEADER_LEN} bytes)")
            }
            Self::TruncatedBody { expected, got } => {
                write!(f, "Stream ended in frame body ({got}/{expected} bytes)")
            }
            Self::Io(e) => write!(f, "Frame I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Encode a payload into a wire frame.
///
/// # Errors
///
/// [`FrameError::OversizedPayload`] above the size limit, and
/// [`FrameError::InvalidFrameSize`] for an empty payload, which no decoder
/// would accept.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::OversizedPayload(payload.len()));
    }
    if payload.is_empty() {
        return Err(FrameError::InvalidFrameSize(0));
    }
    let length = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn validate_length(length: u32) -> Result<usize, FrameError> {
    if length == 0 || length as usize > MAX_FRAME_SIZE {
        return Err(FrameError::InvalidFrameSize(length));
    }
    Ok(length as usize)
}

/// Read exactly one frame from a blocking reader.
///
/// The length is validated before any body byte is read, so an oversized
/// declaration never consumes payload.
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let got = read_full(reader, &mut header)?;
    if got < FRAME_HEADER_LEN {
        return Err(FrameError::TruncatedHeader { got });
    }

    let expected = validate_length(u32::from_be_bytes(header))?;
    let mut body = vec![0u8; expected];
    let got = read_full(reader, &mut body)?;
    if got < expected {
        return Err(FrameError::TruncatedBody { expected, got });
    }
    Ok(body)
}

/// Fill `buf` as far as the stream allows, returning the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(filled)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete payloads.
/// Once a length violation is seen the decoder refuses further input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    poisoned: bool,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete frame payloads.
    ///
    /// Incomplete data is buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        if self.poisoned {
            return Err(FrameError::InvalidFrameSize(0));
        }
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut offset = 0;

        while self.buf.len() - offset >= FRAME_HEADER_LEN {
            let header = [
                self.buf[offset],
                self.buf[offset + 1],
                self.buf[offset + 2],
                self.buf[offset + 3],
            ];
            let length = match validate_length(u32::from_be_bytes(header)) {
                Ok(len) => len,
                Err(e) => {
                    self.poisoned = true;
                    self.buf.clear();
                    return Err(e);
                }
            };

            let start = offset + FRAME_HEADER_LEN;
            if self.buf.len() < start + length {
                break; // Incomplete frame, wait for more data
            }
            frames.push(self.buf[start..start + length].to_vec());
            offset = start + length;
        }

        self.buf.drain(..offset);
        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Report how the stream ended: `Ok` on a frame boundary, otherwise the
    /// truncation error for whatever is still buffered.
    pub fn finish(&self) -> Result<(), FrameError> {
        let buffered = self.buf.len();
        if buffered == 0 {
            return Ok(());
        }
        if buffered < FRAME_HEADER_LEN {
            return Err(FrameError::TruncatedHeader { got: buffered });
        }
        let header = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        Err(FrameError::TruncatedBody {
            expected: u32::from_be_bytes(header) as usize,
            got: buffered - FRAME_HEADER_LEN,
        })
    }
}
