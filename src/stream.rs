// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Typed event channel between a streaming provider call and its consumer.
//!
//! The producer half is consumed by its terminal event, so a stream can end
//! exactly once. Dropping the producer without ending it reports an error to
//! the consumer.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::provider::Usage;

#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A fragment of response text, in provider order.
    Data(String),
    /// The stream finished. `final_text` is every fragment concatenated.
    Done {
        final_text: String,
        usage: Option<Usage>,
    },
    /// The stream failed. Nothing follows.
    Error(Error),
}

impl StreamEvent {
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Data(_))
    }
}

/// Create a connected emitter/source pair.
pub(crate) fn channel() -> (StreamEmitter, EventSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamEmitter { tx: Some(tx) },
        EventSource {
            rx: Some(rx),
            finished: false,
        },
    )
}

/// Producer half. `done` and `error` take `self`, so a second terminal
/// event cannot be expressed.
pub(crate) struct StreamEmitter {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamEmitter {
    /// Emit a text fragment. Empty fragments are dropped.
    pub(crate) fn data(&self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return;
        }
        self.send(StreamEvent::Data(fragment));
    }

    pub(crate) fn done(mut self, final_text: String, usage: Option<Usage>) {
        self.send(StreamEvent::Done { final_text, usage });
        self.tx = None;
    }

    pub(crate) fn error(mut self, cause: Error) {
        self.send(StreamEvent::Error(cause));
        self.tx = None;
    }

    /// True once the consumer has gone away. Producers may use this to stop
    /// early, but are not required to.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    fn send(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            // No listener is fine: the consumer stopped listening.
            let _ = tx.send(event);
        }
    }
}

impl Drop for StreamEmitter {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!("stream producer dropped without a terminal event");
            self.send(StreamEvent::Error(Error::Other(
                "stream ended unexpectedly".to_string(),
            )));
        }
    }
}

/// Consumer half returned by `Provider::send_stream`.
pub(crate) struct EventSource {
    rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    finished: bool,
}

impl EventSource {
    /// Receive the next event. Returns `None` after the terminal event or
    /// once the source has been closed.
    pub(crate) async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.as_mut()?.recv().await;
        self.observe(event)
    }

    /// Non-blocking variant of `recv`.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.as_mut()?.try_recv().ok();
        match event {
            Some(event) => self.observe(Some(event)),
            None => None,
        }
    }

    /// Stop listening. Events still produced are discarded.
    pub(crate) fn close(&mut self) {
        self.finished = true;
        self.rx = None;
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, event: Option<StreamEvent>) -> Option<StreamEvent> {
        match event {
            Some(event) => {
                if event.is_terminal() {
                    self.close();
                }
                Some(event)
            }
            None => {
                self.close();
                None
            }
        }
    }
}

impl Stream for EventSource {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(this.observe(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}
