//! Line framing for the controller protocol
//!
//! Outbound: one ASCII command per line, terminated by `\n`.
//! Inbound: lines terminated by `\n` or `\r\n`, decoded permissively so a
//! corrupted byte never fails the read.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Longest inbound line kept; longer lines are dropped whole
pub const MAX_LINE_LENGTH: usize = 1024;

/// Newline-framed codec for the controller protocol
#[derive(Debug, Clone, Default)]
pub struct FeederLineCodec {
    /// Set while skipping the remainder of an overlong line
    discarding: bool,
}

impl FeederLineCodec {
    /// Codec at the start of a line
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lossy decode of one raw line; invalid sequences become U+FFFD
pub fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).trim().to_string()
}

impl Decoder for FeederLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            match src.iter().position(|b| *b == b'\n') {
                Some(newline) => {
                    let line = src.split_to(newline + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    return Ok(Some(decode_line(&line[..newline])));
                }
                None => {
                    if src.len() > MAX_LINE_LENGTH {
                        if !self.discarding {
                            warn!("dropping inbound line longer than {} bytes", MAX_LINE_LENGTH);
                        }
                        self.discarding = true;
                        src.advance(src.len());
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(decode_line(&rest)))
    }
}

impl Encoder<&str> for FeederLineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> Result<(), io::Error> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
