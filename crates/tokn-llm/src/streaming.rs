use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tokn_core::error::{Result, ToknError};

/// How a vendor frames its streamed response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Server-Sent Events: `event: <type>\ndata: <json>\n\n`.
    Sse,
    /// One JSON document per line.
    JsonLines,
}

/// One framed unit of a streamed response, handed to `parse_chunk`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFragment {
    /// SSE event name, when the vendor sends one.
    pub event: Option<String>,
    pub data: String,
}

impl RawFragment {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

/// Parse a raw SSE text stream into fragments.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<RawFragment> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }
        let mut events = Vec::new();

        // Split on double newlines (event boundaries)
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<RawFragment> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }
}

fn parse_block(block: &str) -> Option<RawFragment> {
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if let Some(val) = line.strip_prefix("event:") {
            event = Some(val.trim_start().to_string());
        } else if let Some(val) = line.strip_prefix("data:") {
            data_lines.push(val.strip_prefix(' ').unwrap_or(val));
        }
        // `id:`, `retry:` and `:` comments carry nothing we use
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(RawFragment {
        event,
        data: data_lines.join("\n"),
    })
}

/// Split newline-delimited JSON into one fragment per non-blank line.
#[derive(Debug, Default)]
pub struct JsonLinesParser {
    buffer: String,
}

impl JsonLinesParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<RawFragment> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..pos + 1).collect();
            let line = line.trim();
            if !line.is_empty() {
                out.push(RawFragment::data(line));
            }
        }
        out
    }

    pub fn finish(&mut self) -> Option<RawFragment> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| RawFragment::data(rest))
    }
}

/// Turns raw body bytes into fragments for either framing.
///
/// Bytes are buffered until they form valid UTF-8, so a multi-byte
/// character split across network chunks is decoded intact.
#[derive(Debug)]
pub struct FragmentDecoder {
    pending: Vec<u8>,
    framing: Framing,
    sse: SseParser,
    lines: JsonLinesParser,
}

impl FragmentDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            pending: Vec::new(),
            framing,
            sse: SseParser::new(),
            lines: JsonLinesParser::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawFragment> {
        self.pending.extend_from_slice(bytes);
        let text = match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let s = s.to_string();
                self.pending.clear();
                s
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete trailing sequence: keep it for the next chunk.
                let valid = e.valid_up_to();
                let head: Vec<u8> = self.pending.drain(..valid).collect();
                String::from_utf8_lossy(&head).into_owned()
            }
            Err(_) => {
                let s = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                s
            }
        };
        match self.framing {
            Framing::Sse => self.sse.feed(&text),
            Framing::JsonLines => self.lines.feed(&text),
        }
    }

    /// Flush whatever is buffered once the body has ended.
    pub fn finish(&mut self) -> Vec<RawFragment> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let partial = std::mem::take(&mut self.pending);
            warn!(bytes = partial.len(), "Stream ended inside a multi-byte character");
            let tail = String::from_utf8_lossy(&partial).into_owned();
            out = match self.framing {
                Framing::Sse => self.sse.feed(&tail),
                Framing::JsonLines => self.lines.feed(&tail),
            };
        }
        out.extend(match self.framing {
            Framing::Sse => self.sse.finish(),
            Framing::JsonLines => self.lines.finish(),
        });
        out
    }
}

/// A stream of fragments decoded from a raw byte stream.
pub struct FragmentStream<S> {
    inner: S,
    decoder: FragmentDecoder,
    pending: VecDeque<RawFragment>,
    done: bool,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S, framing: Framing) -> Self {
        Self {
            inner,
            decoder: FragmentDecoder::new(framing),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, B, E> Stream for FragmentStream<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    type Item = Result<RawFragment>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            // Return pending events first
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.pending.extend(this.decoder.feed(bytes.as_ref()));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(ToknError::ProviderStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    this.pending.extend(this.decoder.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_sse_parser_basic() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn test_sse_parser_chunked_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"x\":").is_empty());
        let events = parser.feed("1}\r\n\r\ndata:[DONE]\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[test]
    fn test_sse_comment_only_block_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.feed(": keep-alive\n\n").is_empty());
    }

    #[test]
    fn test_json_lines_with_trailing_line() {
        let mut parser = JsonLinesParser::new();
        let events = parser.feed("{\"a\":1}\n\n{\"b\":");
        assert_eq!(events, vec![RawFragment::data("{\"a\":1}")]);
        assert!(parser.feed("2}").is_empty());
        assert_eq!(parser.finish(), Some(RawFragment::data("{\"b\":2}")));
    }

    #[test]
    fn test_decoder_keeps_split_utf8() {
        let mut decoder = FragmentDecoder::new(Framing::JsonLines);
        let bytes = "{\"t\":\"é\"}\n".as_bytes();
        // 'é' is two bytes; split between them
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;
        assert!(decoder.feed(&bytes[..split]).is_empty());
        let events = decoder.feed(&bytes[split..]);
        assert_eq!(events[0].data, "{\"t\":\"é\"}");
    }

    #[test]
    fn test_decoder_flushes_truncated_character() {
        let mut decoder = FragmentDecoder::new(Framing::JsonLines);
        let bytes = "{\"t\":\"é".as_bytes();
        assert!(decoder.feed(&bytes[..bytes.len() - 1]).is_empty());
        let tail = decoder.finish();
        assert_eq!(tail, vec![RawFragment::data("{\"t\":\"\u{fffd}")]);
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn test_fragment_stream_flushes_tail() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: one\n\nda".to_vec()),
            Ok(b"ta: two".to_vec()),
        ];
        let stream = FragmentStream::new(futures::stream::iter(chunks), Framing::Sse);
        let out: Vec<_> = stream.map(|r| r.unwrap().data).collect().await;
        assert_eq!(out, vec!["one", "two"]);
    }
}
