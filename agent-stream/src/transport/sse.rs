//! Server-Sent Events transport.
//!
//! `SseDecoder` turns a byte stream into events (`field: value` lines, `data`
//! lines joined with `\n`, blank line terminates an event, `:` comments
//! skipped). `SseConnector` opens the stream endpoint with reqwest and yields
//! the `data` payload of every event.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

use super::{FrameStream, StreamConnector, TransportError};

/// Longest accepted SSE line (and therefore frame payload line).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug)]
pub struct SseDecoder {
    max_line_bytes: usize,
    event: Option<String>,
    data: String,
    has_data: bool,
    id: Option<String>,
    /// Set when a line of the current event was not UTF-8.
    invalid: bool,
    /// Bytes of `src` already searched for a newline.
    next_index: usize,
}

impl SseDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            event: None,
            data: String::new(),
            has_data: false,
            id: None,
            invalid: false,
            next_index: 0,
        }
    }

    fn reset(&mut self) {
        self.event = None;
        self.data.clear();
        self.has_data = false;
        self.id = None;
        self.invalid = false;
    }

    /// Feeds one line (terminator stripped); returns an event on a blank line.
    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.invalid {
                tracing::warn!(event = ?self.event, id = ?self.id, "Discarding SSE event with invalid UTF-8");
                self.reset();
                return None;
            }
            if !self.has_data {
                self.reset();
                return None;
            }
            let event = SseEvent {
                event: self.event.take(),
                data: std::mem::take(&mut self.data),
                id: self.id.take(),
            };
            self.reset();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for SseDecoder {
    type Item = SseEvent;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let scanned = self.next_index.min(src.len());
            let Some(offset) = src[scanned..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                if src.len() > self.max_line_bytes {
                    return Err(line_too_long(self.max_line_bytes));
                }
                return Ok(None);
            };
            let newline = scanned + offset;
            self.next_index = 0;
            if newline > self.max_line_bytes {
                return Err(line_too_long(self.max_line_bytes));
            }

            let line = src.split_to(newline);
            src.advance(1);
            let mut line = match String::from_utf8(line.to_vec()) {
                Ok(line) => line,
                Err(_) => {
                    self.invalid = true;
                    continue;
                }
            };
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        // An event without its terminating blank line is discarded.
        src.clear();
        self.next_index = 0;
        self.reset();
        Ok(None)
    }
}

fn line_too_long(max_line_bytes: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("SSE line exceeds {max_line_bytes} bytes"),
    )
}

/// Opens the SSE stream endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct SseConnector {
    http: reqwest::Client,
    max_frame_bytes: usize,
}

impl SseConnector {
    pub fn new(http: reqwest::Client, max_frame_bytes: usize) -> Self {
        Self {
            http,
            max_frame_bytes,
        }
    }
}

impl Default for SseConnector {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), DEFAULT_MAX_FRAME_BYTES)
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn connect(&self, endpoint: &str) -> Result<FrameStream, TransportError> {
        let response = self
            .http
            .get(endpoint)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let frames = FramedRead::new(StreamReader::new(bytes), SseDecoder::new(self.max_frame_bytes))
            .map(|item| {
                item.map(|event| event.data)
                    .map_err(|e| TransportError::Stream(e.to_string()))
            });
        Ok(frames.boxed())
    }
}
