use crate::common::error::CodecError;
use crate::ordering::message::Envelope;

/// Longest line accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &[u8]) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_slice(line)?)
}

/*
    A read can return half a line, several lines, or several lines and half
    of the next. The framer keeps whatever follows the last newline and
    prepends it to the next chunk, so each envelope is decoded exactly once
    from its complete line.
*/

#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer::default()
    }

    /// Feeds a chunk and decodes every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Envelope, CodecError>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = trim_cr(&self.buf[start..end]);
            if self.discarding {
                self.discarding = false;
            } else if line.len() > MAX_FRAME_LEN {
                frames.push(Err(CodecError::FrameTooLong {
                    len: line.len(),
                    max: MAX_FRAME_LEN,
                }));
            } else if !line.is_empty() {
                frames.push(decode(line));
            }
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_FRAME_LEN && !self.discarding {
            frames.push(Err(CodecError::FrameTooLong {
                len: self.buf.len(),
                max: MAX_FRAME_LEN,
            }));
            self.discarding = true;
        }
        if self.discarding {
            self.buf.clear();
        }
        frames
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
