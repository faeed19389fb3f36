//! MPX frame codec.
//!
//! Every message on both sockets is `MPX` + `,` + a 10-digit ASCII length +
//! `length` payload bytes. The detector occasionally pads the header with NUL
//! bytes, and a data connection opened mid-stream starts inside a frame, so the
//! decoder hunts for the magic and discards whatever precedes it. The number of
//! consecutively discarded bytes is bounded; past the bound the stream is
//! declared unsynchronizable and decoding fails with [`MerlinError::Framing`].
//!
//! The codec plugs into `tokio_util::codec::{FramedRead, Framed}`. Decoding is
//! incremental, so partial reads and arbitrary chunking are handled by the
//! framed reader's buffer, and `FramedRead::next` stays cancel-safe inside
//! `tokio::select!`.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::request::ControlRequest;
use super::{LENGTH_DIGITS, MAGIC, MAX_PAYLOAD_LEN, PADDING, SEPARATOR};
use crate::error::MerlinError;

/// One delimited MPX message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    payload: Bytes,
}

impl WireFrame {
    /// Wrap an already-delimited payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Payload bytes (everything after the 14-byte header).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Payload { length: usize },
}

enum HeaderParse {
    Incomplete,
    Invalid(&'static str),
    Complete { length: usize, consumed: usize },
}

/// Encoder for [`ControlRequest`] and resynchronizing decoder for [`WireFrame`].
#[derive(Debug)]
pub struct MpxCodec {
    max_resync_bytes: usize,
    /// Bytes discarded since the last good header.
    discarded: usize,
    /// Bytes discarded over the codec's lifetime.
    total_discarded: u64,
    state: DecodeState,
}

impl MpxCodec {
    /// Create a codec that gives up after `max_resync_bytes` consecutive
    /// discarded bytes.
    pub fn new(max_resync_bytes: usize) -> Self {
        Self {
            max_resync_bytes,
            discarded: 0,
            total_discarded: 0,
            state: DecodeState::Header,
        }
    }

    /// Total bytes thrown away while resynchronizing.
    pub fn total_discarded(&self) -> u64 {
        self.total_discarded
    }

    /// Forget any partially decoded frame. Call after clearing the read buffer.
    pub fn reset(&mut self) {
        self.state = DecodeState::Header;
        self.discarded = 0;
    }

    fn discard(&mut self, src: &mut BytesMut, count: usize) -> Result<(), MerlinError> {
        if count == 0 {
            return Ok(());
        }
        for byte in &src[..count] {
            trace!(byte = *byte, "discarding byte outside MPX frame");
        }
        src.advance(count);
        self.discarded += count;
        self.total_discarded += count as u64;
        warn!(
            discarded = count,
            consecutive = self.discarded,
            "unexpected bytes before MPX header, resynchronizing"
        );

        if self.discarded > self.max_resync_bytes {
            return Err(MerlinError::Framing(format!(
                "no valid MPX header after discarding {} bytes",
                self.discarded
            )));
        }
        Ok(())
    }
}

impl Default for MpxCodec {
    fn default() -> Self {
        Self::new(crate::config::ProtocolConfig::default().max_resync_bytes)
    }
}

/// Position of the first complete magic in `buf`.
fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|window| window == MAGIC)
}

/// Length of the longest proper prefix of the magic that `buf` ends with.
fn partial_magic_len(buf: &[u8]) -> usize {
    (1..MAGIC.len())
        .rev()
        .find(|&n| buf.ends_with(&MAGIC[..n]))
        .unwrap_or(0)
}

/// Parse `,` + 10 digits after the magic at the start of `buf`, skipping NUL padding.
fn parse_header(buf: &[u8]) -> HeaderParse {
    // Padding only ever aligns the fixed header; anything longer is garbage.
    const MAX_PADDING: usize = 64;

    let mut digits = [0u8; LENGTH_DIGITS];
    let mut seen = 0usize;
    let mut padding = 0usize;

    for (idx, &byte) in buf.iter().enumerate().skip(MAGIC.len()) {
        if byte == PADDING {
            padding += 1;
            if padding > MAX_PADDING {
                return HeaderParse::Invalid("excessive header padding");
            }
            continue;
        }

        if seen == 0 {
            if byte != SEPARATOR {
                return HeaderParse::Invalid("missing separator after magic");
            }
        } else {
            if !byte.is_ascii_digit() {
                return HeaderParse::Invalid("non-digit in length field");
            }
            digits[seen - 1] = byte;
        }
        seen += 1;

        if seen == LENGTH_DIGITS + 1 {
            let length = digits
                .iter()
                .fold(0usize, |acc, &d| acc * 10 + usize::from(d - b'0'));
            if length > MAX_PAYLOAD_LEN {
                return HeaderParse::Invalid("declared length exceeds maximum frame size");
            }
            return HeaderParse::Complete {
                length,
                consumed: idx + 1,
            };
        }
    }

    HeaderParse::Incomplete
}

impl Decoder for MpxCodec {
    type Item = WireFrame;
    type Error = MerlinError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, MerlinError> {
        loop {
            if let DecodeState::Payload { length } = self.state {
                if src.len() < length {
                    src.reserve(length - src.len());
                    return Ok(None);
                }
                self.state = DecodeState::Header;
                let payload = src.split_to(length).freeze();
                return Ok(Some(WireFrame { payload }));
            }

            let Some(start) = find_magic(src) else {
                let keep = partial_magic_len(src);
                let stale = src.len() - keep;
                self.discard(src, stale)?;
                return Ok(None);
            };
            self.discard(src, start)?;

            match parse_header(src) {
                HeaderParse::Incomplete => return Ok(None),
                HeaderParse::Invalid(reason) => {
                    warn!(reason, "malformed MPX header");
                    // Drop the 'M' and keep hunting.
                    self.discard(src, 1)?;
                }
                HeaderParse::Complete { length, consumed } => {
                    src.advance(consumed);
                    self.discarded = 0;
                    self.state = DecodeState::Payload { length };
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<WireFrame>, MerlinError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() && self.state == DecodeState::Header {
            return Ok(None);
        }
        Err(MerlinError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection closed mid-frame ({} bytes buffered)", buf.len()),
        )))
    }
}

impl Encoder<ControlRequest> for MpxCodec {
    type Error = MerlinError;

    fn encode(&mut self, item: ControlRequest, dst: &mut BytesMut) -> Result<(), MerlinError> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}
