//! Incremental server-sent-events decoder.
//!
//! Bytes arrive in arbitrary chunks; `SseDecoder::push` buffers partial
//! lines and returns every item completed by the chunk. Comment lines
//! (`: ping`) are surfaced as heartbeats so the caller can reset its idle
//! deadline.

use bytes::{Buf, BytesMut};

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// `event:` field; `"message"` when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Anything the decoder produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Message(SseMessage),
    /// A comment line, usually a heartbeat.
    Comment(String),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every completed item.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos);
            self.buf.advance(1);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(item) = self.line(line) {
                out.push(item);
            }
        }

        out
    }

    fn line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseItem::Comment(comment.trim_start().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // retry and unknown fields are ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseItem> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseItem::Message(SseMessage {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(event: &str, data: &str) -> SseItem {
        SseItem::Message(SseMessage {
            event: event.to_string(),
            data: data.to_string(),
            id: None,
        })
    }

    #[test]
    fn decodes_named_event() {
        let mut d = SseDecoder::new();
        let items = d.push(b"event: chat\ndata: {\"player\":\"a\"}\n\n");
        assert_eq!(items, vec![message("chat", "{\"player\":\"a\"}")]);
    }

    #[test]
    fn handles_split_chunks_and_crlf() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: lo").is_empty());
        assert!(d.push(b"g\r\ndata: hel").is_empty());
        let items = d.push(b"lo\r\n\r\n");
        assert_eq!(items, vec![message("log", "hello")]);
    }

    #[test]
    fn joins_multiline_data_and_defaults_event_name() {
        let mut d = SseDecoder::new();
        let items = d.push(b"data: one\ndata: two\nid: 7\n\n");
        assert_eq!(
            items,
            vec![SseItem::Message(SseMessage {
                event: "message".to_string(),
                data: "one\ntwo".to_string(),
                id: Some("7".to_string()),
            })]
        );
    }

    #[test]
    fn comments_are_heartbeats() {
        let mut d = SseDecoder::new();
        let items = d.push(b": ping\n\n");
        assert_eq!(items, vec![SseItem::Comment("ping".to_string())]);
    }

    #[test]
    fn event_without_data_is_not_dispatched() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: start\n\n").is_empty());
        // The dangling event name must not leak into the next message.
        assert_eq!(d.push(b"data: x\n\n"), vec![message("message", "x")]);
    }
}
