//! Newline framing that tolerates oversized and non-UTF-8 lines.

use std::io;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};

/// One newline-delimited chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum LineFrame {
    /// The bytes of a line without its delimiter.
    Line(Bytes),
    /// A line longer than the limit. Its bytes were discarded.
    Oversized,
}

/// Splits raw bytes on `\n`.
///
/// Oversized lines are reported as frames rather than errors: `FramedRead`
/// ends its stream after any decoder error, and the pumps must keep reading.
#[derive(Debug)]
pub(super) struct LineFrames {
    inner: AnyDelimiterCodec,
}

impl LineFrames {
    pub(super) fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_line_bytes),
        }
    }
}

fn lift(decoded: Result<Option<Bytes>, AnyDelimiterCodecError>) -> io::Result<Option<LineFrame>> {
    match decoded {
        Ok(line) => Ok(line.map(LineFrame::Line)),
        Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(LineFrame::Oversized)),
        Err(AnyDelimiterCodecError::Io(err)) => Err(err),
    }
}

impl Decoder for LineFrames {
    type Item = LineFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<LineFrame>> {
        lift(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<LineFrame>> {
        lift(self.inner.decode_eof(buf))
    }
}
