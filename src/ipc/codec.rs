//! NDJSON framing for the control socket.
//!
//! Wraps [`LinesCodec`] with a maximum line length. Oversize lines and
//! lines that are not UTF-8 surface as [`AppError::Protocol`]; the inner
//! codec has already discarded them (or discards up to the next newline),
//! so a reader that keeps decoding resynchronizes on the next message.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// One JSON message per `\n`-terminated UTF-8 line.
#[derive(Debug)]
pub struct RpcCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl RpcCodec {
    /// Codec rejecting inbound lines longer than `max_line_bytes`.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn map_error(&self, err: LinesCodecError) -> AppError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io_err) if io_err.kind() == std::io::ErrorKind::InvalidData => {
                AppError::Protocol(format!("line is not valid UTF-8: {io_err}"))
            }
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Decoder for RpcCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|err| self.map_error(err))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode_eof(src).map_err(|err| self.map_error(err))
    }
}

impl Encoder<String> for RpcCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner
            .encode(item, dst)
            .map_err(|err| self.map_error(err))
    }
}
