//! Length-prefixed framing: a big-endian `u32` byte count followed by the
//! UTF-8 envelope.

use std::io::{self, Read, Write};

use super::ChannelError;

pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 16 * 1024;

pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<(), ChannelError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ChannelError::FrameTooLarge(frame.len()));
    }
    let len = frame.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .and_then(|_| writer.write_all(frame))
        .and_then(|_| writer.flush())
        .map_err(ChannelError::from_io)
}

/// Accumulates bytes until a whole frame is available. A read that times out
/// mid-frame keeps what it has, so the next call resumes the same frame.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn read_frame(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(ChannelError::ChannelClosed),
                Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChannelError::from_io(err)),
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ChannelError::FrameTooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }
}
