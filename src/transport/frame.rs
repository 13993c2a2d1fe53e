//! Stream framing (length + crc32c).
//!
//! Every frame is `u32 LE length | u32 LE crc32c(body) | body`. A frame with
//! length zero is an end-of-stream marker; readers only accept it when built
//! with [`FrameReader::with_end_markers`].

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    FrameCrcMismatch { expected: u32, got: u32 },
}

impl FrameError {
    /// Peer hung up or the socket timed out; a fresh connection may work.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    End,
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
    allow_end: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
            allow_end: false,
        }
    }

    pub fn with_end_markers(mut self) -> Self {
        self.allow_end = true;
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Next data frame, or `None` on a clean EOF between frames.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.read_frame()? {
            Some(Frame::Data(body)) => Ok(Some(body)),
            Some(Frame::End) => Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Next frame including end markers, or `None` on a clean EOF.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            if self.allow_end {
                return Ok(Some(Frame::End));
            }
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "frame body truncated")
            } else {
                err
            }
        })?;

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(FrameError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        Ok(Some(Frame::Data(body)))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        if payload.is_empty() {
            return Err(FrameError::FrameLengthInvalid {
                reason: "empty payload would read as end marker".to_string(),
            });
        }
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }

    pub fn write_end(&mut self) -> Result<(), FrameError> {
        self.writer.write_all(&[0u8; FRAME_HEADER_LEN])?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    let crc = crc32c(payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}
