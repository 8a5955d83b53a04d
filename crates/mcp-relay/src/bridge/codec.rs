//! Newline-delimited JSON framing for the child's stdio pipes.
//!
//! The decoder never fails on bad content: a line that is not a JSON-RPC
//! object becomes [`Frame::Malformed`] so the read loop can report it and keep
//! going. Only I/O errors end a `FramedRead` stream.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::RpcMessage;

/// One decoded line of child output.
#[derive(Debug, Clone)]
pub enum Frame {
    Message(RpcMessage),
    /// The line could not be decoded. `line` is the offending text.
    Malformed { line: String, reason: String },
}

/// Codec that splits on `\n` and parses each line as a JSON-RPC message.
///
/// The `BytesMut` owned by the surrounding `FramedRead` is the partial-line
/// buffer; a fresh one exists per child process, so no frame spans a restart.
#[derive(Debug, Default)]
pub struct NdjsonCodec {
    /// Bytes of the buffered partial line already scanned for `\n`.
    scanned: usize,
}

impl NdjsonCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            if let Some(frame) = decode_line(&line[..line.len() - 1]) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.iter().all(u8::is_ascii_whitespace) {
            tracing::warn!(
                partial_bytes = src.len(),
                "Discarding partial frame at end of stream"
            );
        }
        src.clear();
        self.scanned = 0;
        Ok(None)
    }
}

impl Encoder<RpcMessage> for NdjsonCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.as_str();
        tracing::trace!(line_bytes = line.len(), "Encoding frame");
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

fn decode_line(line: &[u8]) -> Option<Frame> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Some(Frame::Malformed {
                line: String::from_utf8_lossy(line).into_owned(),
                reason: e.to_string(),
            });
        }
    };

    if text.trim().is_empty() {
        return None;
    }

    Some(match RpcMessage::parse(text) {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Malformed {
            line: text.to_string(),
            reason: e.to_string(),
        },
    })
}
