// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Server-Sent Events framing over a byte stream.

use futures::Stream;
use futures::StreamExt;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// Value of the `event:` field, if the server sent one.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// OpenAI-style end of stream marker.
    pub(crate) fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

pub(crate) struct SseStream<S> {
    stream: S,
    // Raw bytes so multi-byte characters split across chunks survive.
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    eof: bool,
}

impl<S> SseStream<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            eof: false,
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }

    /// Process one line. Returns an event when the line completes one.
    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl<S, B, E> SseStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    /// Next complete event, or `None` when the body is exhausted.
    pub(crate) async fn next_event(&mut self) -> Option<Result<SseEvent, E>> {
        loop {
            while let Some(line) = self.next_line() {
                if let Some(event) = self.process_line(&line) {
                    return Some(Ok(event));
                }
            }

            if self.eof {
                // A final line without a trailing newline still counts.
                if !self.buffer.is_empty() {
                    let rest = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
                    if let Some(event) = self.process_line(&rest) {
                        return Some(Ok(event));
                    }
                }
                return self.take_event().map(Ok);
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some(Err(e)),
                None => self.eof = true,
            }
        }
    }
}
