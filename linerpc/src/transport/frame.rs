//! Newline framing with an upper bound on frame size.
//!
//! Each frame is the bytes of one message followed by `\n`.  A `\r` immediately before the `\n`
//! is stripped, so peers that write CRLF line endings interoperate.
use bytes::{BufMut, Bytes, BytesMut};
use snafu::{ensure, Snafu};
use tokio_util::codec::{Decoder, Encoder};

/// 1 MiB
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    #[snafu(context(false), display("I/O error on framed stream"))]
    Io { source: std::io::Error },

    #[snafu(display("Frame exceeds the maximum frame length of {max} bytes"))]
    TooLarge { max: usize },

    #[snafu(display("Stream ended with {pending} bytes of an incomplete frame"))]
    Truncated { pending: usize },

    #[snafu(display("Frame contents contain the frame delimiter"))]
    EmbeddedDelimiter,
}

#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_length: usize,

    /// Offset into the read buffer up to which we already know there is no delimiter, so that
    /// a frame arriving in many small reads is not rescanned from the start each time
    next_index: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            next_index: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        // A frame of exactly the maximum length has its delimiter one byte past the limit
        let read_to = src.len().min(self.max_frame_length.saturating_add(1));

        match src[self.next_index..read_to]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            Some(offset) => {
                let newline = self.next_index + offset;
                self.next_index = 0;

                let mut frame = src.split_to(newline + 1);
                frame.truncate(newline);
                if frame.last() == Some(&b'\r') {
                    frame.truncate(newline - 1);
                }

                Ok(Some(frame.freeze()))
            }
            None if src.len() > self.max_frame_length => TooLargeSnafu {
                max: self.max_frame_length,
            }
            .fail(),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let pending = src.len();
                src.clear();
                self.next_index = 0;

                TruncatedSnafu { pending }.fail()
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        ensure!(
            frame.len() <= self.max_frame_length,
            TooLargeSnafu {
                max: self.max_frame_length
            }
        );
        ensure!(!frame.contains(&b'\n'), EmbeddedDelimiterSnafu);

        dst.reserve(frame.len() + 1);
        dst.put(frame);
        dst.put_u8(b'\n');

        Ok(())
    }
}
