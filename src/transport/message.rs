//! Wire message model and the `Content-Length` framing codec.
//!
//! A frame is a block of `Name:value` header lines terminated by a blank
//! line, followed by exactly `Content-Length` bytes of UTF-8 payload. The
//! length header is computed on write and consumed on read; it never shows
//! up in [`Message::headers`].
//!
//! The same codec also decodes bare text lines, which the literal greeting
//! handshake needs before framed traffic begins. [`MessageCodec::enter_frames`]
//! switches modes without losing buffered bytes.

use std::collections::HashMap;
use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{AppError, Result};

/// Name of the hidden length pseudo-header.
pub const CONTENT_LENGTH: &str = "Content-Length";
/// Well-known header naming the sub-protocol a message belongs to.
pub const TOOL_HEADER: &str = "Tool";
/// Well-known header naming the addressee inside the remote.
pub const DESTINATION_HEADER: &str = "Destination";

/// Default bound on one frame's payload: 16 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &str = "\r\n";

/// A transport message: protocol headers plus an opaque content string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    headers: HashMap<String, String>,
    content: String,
}

impl Message {
    /// Build a message. A `Content-Length` entry in `headers` is dropped.
    #[must_use]
    pub fn new(headers: HashMap<String, String>, content: impl Into<String>) -> Self {
        let mut headers = headers;
        headers.retain(|name, _| !name.eq_ignore_ascii_case(CONTENT_LENGTH));
        Self {
            headers,
            content: content.into(),
        }
    }

    /// Message with no headers.
    #[must_use]
    pub fn with_content(content: impl Into<String>) -> Self {
        Self::new(HashMap::new(), content)
    }

    /// Add or replace one header.
    #[must_use]
    pub fn header_set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if !name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            self.headers.insert(name, value.into());
        }
        self
    }

    /// Header value by exact name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// All regular headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Sub-protocol this message is addressed to, if any.
    #[must_use]
    pub fn tool(&self) -> Option<&str> {
        self.header(TOOL_HEADER)
    }

    /// Destination inside the remote, if any.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header(DESTINATION_HEADER)
    }

    /// Payload text; empty (never absent) for a message without content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Consume the message, returning its payload.
    #[must_use]
    pub fn into_content(self) -> String {
        self.content
    }
}

/// Item produced by [`MessageCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireItem {
    /// One text line, terminator stripped. Produced only in line mode.
    Line(String),
    /// One complete framed message.
    Frame(Message),
}

/// Decoding mode of a [`MessageCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// `\n` (or `\r\n`) terminated text lines.
    Lines,
    /// Header block plus `Content-Length` payload.
    Frames,
}

/// Bidirectional codec for the debugger wire format.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    mode: CodecMode,
    max_frame_bytes: usize,
}

impl MessageCodec {
    /// Codec starting in `mode` with a payload bound of `max_frame_bytes`.
    #[must_use]
    pub fn new(mode: CodecMode, max_frame_bytes: usize) -> Self {
        Self {
            mode,
            max_frame_bytes,
        }
    }

    /// Codec decoding frames right away.
    #[must_use]
    pub fn frames(max_frame_bytes: usize) -> Self {
        Self::new(CodecMode::Frames, max_frame_bytes)
    }

    /// Current decoding mode.
    #[must_use]
    pub fn mode(&self) -> CodecMode {
        self.mode
    }

    /// Switch to frame decoding; already buffered bytes are kept.
    pub fn enter_frames(&mut self) {
        self.mode = CodecMode::Frames;
    }

    fn decode_line(&self, src: &mut BytesMut) -> Result<Option<String>> {
        let Some(end) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_frame_bytes {
                return Err(malformed("line exceeds frame limit"));
            }
            return Ok(None);
        };
        let line = src.split_to(end + 1);
        let text = std::str::from_utf8(strip_line_end(&line))
            .map_err(|err| malformed(&format!("line is not utf-8: {err}")))?;
        Ok(Some(text.to_owned()))
    }

    fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        let mut headers = HashMap::new();
        let mut content_length: Option<usize> = None;
        let mut offset = 0;

        loop {
            let Some(relative) = src[offset..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_bytes {
                    return Err(malformed("header block exceeds frame limit"));
                }
                return Ok(None);
            };
            let line_end = offset + relative;
            let line = strip_line_end(&src[offset..=line_end]);
            offset = line_end + 1;
            if line.is_empty() {
                break;
            }

            let line = std::str::from_utf8(line)
                .map_err(|err| malformed(&format!("header is not utf-8: {err}")))?;
            let Some((name, value)) = line.split_once(':') else {
                return Err(malformed(&format!("invalid header line {line:?}")));
            };
            if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| malformed(&format!("invalid {CONTENT_LENGTH} {value:?}")))?;
                content_length = Some(length);
            } else {
                headers.insert(name.to_owned(), value.to_owned());
            }
        }

        let length =
            content_length.ok_or_else(|| malformed(&format!("missing {CONTENT_LENGTH} header")))?;
        if length > self.max_frame_bytes {
            return Err(malformed(&format!(
                "content of {length} bytes exceeds limit of {}",
                self.max_frame_bytes
            )));
        }

        let total = offset + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let content = String::from_utf8(frame[offset..].to_vec())
            .map_err(|err| malformed(&format!("content is not utf-8: {err}")))?;
        Ok(Some(Message { headers, content }))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::frames(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for MessageCodec {
    type Item = WireItem;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.mode {
            CodecMode::Lines => Ok(self.decode_line(src)?.map(WireItem::Line)),
            CodecMode::Frames => Ok(self.decode_frame(src)?.map(WireItem::Frame)),
        }
    }

    /// A frame cut short by end of stream is treated as end of stream.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let item = self.decode(src)?;
        if item.is_none() && !src.is_empty() {
            warn!(
                remaining = src.len(),
                "stream ended inside a frame, discarding partial data"
            );
            src.clear();
        }
        Ok(item)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = AppError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let mut head = String::new();
        for (name, value) in &item.headers {
            let _ = write!(head, "{name}:{value}{HEADER_TERMINATOR}");
        }
        let _ = write!(
            head,
            "{CONTENT_LENGTH}:{}{HEADER_TERMINATOR}{HEADER_TERMINATOR}",
            item.content.len()
        );

        dst.reserve(head.len() + item.content.len());
        dst.put_slice(head.as_bytes());
        dst.put_slice(item.content.as_bytes());
        Ok(())
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn strip_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn malformed(detail: &str) -> AppError {
    AppError::Transport(format!("malformed frame: {detail}"))
}
