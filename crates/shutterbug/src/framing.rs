//! Message framing on the control link
//!
//! `Chunk` keeps the deployed behaviour: whatever one read returned is one
//! message. `Line` buffers until `\n`, so coalesced and split reads are cut
//! correctly and a UTF-8 sequence straddling two reads is not mangled.

use bytes::{Buf, BytesMut};
use tracing::warn;

pub use shutterconf::Framing;

/// Longest line we buffer before giving up on finding its end.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct MessageDecoder {
    framing: Framing,
    buf: BytesMut,
    /// Inside an over-long line; bytes are dropped up to the next `\n`.
    discarding: bool,
}

impl MessageDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: BytesMut::with_capacity(1024),
            discarding: false,
        }
    }

    /// Feed one read's worth of bytes; returns every message it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        match self.framing {
            Framing::Chunk => {
                if bytes.is_empty() {
                    Vec::new()
                } else {
                    vec![String::from_utf8_lossy(bytes).into_owned()]
                }
            }
            Framing::Line => self.push_lines(bytes),
        }
    }

    fn push_lines(&mut self, mut bytes: &[u8]) -> Vec<String> {
        if self.discarding {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    bytes = &bytes[pos + 1..];
                }
                None => return Vec::new(),
            }
        }
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let mut end = pos;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            if end > MAX_LINE_BYTES {
                warn!("dropping {} byte line", end);
            } else if end > 0 {
                messages.push(String::from_utf8_lossy(&line[..end]).into_owned());
            }
        }

        if self.buf.len() > MAX_LINE_BYTES {
            warn!(
                "discarding {} buffered bytes without a line terminator",
                self.buf.len()
            );
            self.buf.advance(self.buf.len());
            self.discarding = true;
        }

        messages
    }

    /// Whatever is left once the peer has closed. Only `Line` framing can
    /// hold a partial message.
    pub fn finish(&mut self) -> Option<String> {
        self.discarding = false;
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        let text = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Bytes to put on the wire for one outbound message.
pub fn encode(framing: Framing, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    if framing == Framing::Line {
        out.push(b'\n');
    }
    out
}
