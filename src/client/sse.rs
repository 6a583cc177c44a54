//! Incremental SSE parser for the client stream engine.
//!
//! The wire is a line protocol: `data:` lines accumulate one event, a blank
//! line terminates it, `:` comments are server pings, and the other field
//! kinds (`event:`, `id:`, `retry:`) are ignored. The accumulator is
//! bounded; crossing the bound or failing to parse a completed event is
//! fatal to the stream and never triggers a reconnect.

use crate::envelope::{self, Envelope};
use crate::error::{category, code, Error, Result};
use serde_json::Value;

pub(crate) struct SseParser {
    max_message_size: usize,
    buf: Vec<u8>,
    data: Vec<u8>,
}

impl SseParser {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            buf: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Feed one chunk, returning any events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Envelope<Value>>> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.process_line(&line, &mut events)?;
        }
        // A pathological unterminated line must not grow without bound.
        if self.buf.len() > self.max_message_size.saturating_add(64) {
            return Err(too_large(self.max_message_size));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<Envelope<Value>>) -> Result<()> {
        if line.is_empty() {
            if !self.data.is_empty() {
                let env = envelope::decode(&self.data)?;
                self.data.clear();
                events.push(env);
            }
            return Ok(());
        }
        if line[0] == b':' {
            // comment frame, i.e. a server keepalive ping
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix(b"data:") {
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            let joiner = usize::from(!self.data.is_empty());
            if self.data.len() + joiner + rest.len() > self.max_message_size {
                return Err(too_large(self.max_message_size));
            }
            if joiner == 1 {
                self.data.push(b'\n');
            }
            self.data.extend_from_slice(rest);
        }
        // event:, id:, retry: and unknown fields are ignored
        Ok(())
    }
}

fn too_large(limit: usize) -> Error {
    Error::new(format!("SSE message exceeds {limit} bytes"))
        .with_category(category::PROTOCOL)
        .with_code(code::MESSAGE_TOO_LARGE)
}
