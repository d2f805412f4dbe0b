//! The receive side shared by server-streaming and bidirectional calls.
//!
//! A spawned pump drains the `tonic::Streaming` into an [`Inbox`]; handles read from it
//! through a [`Receiver`] cursor, so a slow reader never stalls the transport and evicted
//! messages are simply skipped.
use super::buffer::MessageBuffer;
use super::{BufferLimits, BufferStats, CallScope, Hooks, ReceivedMessage, RecvState, StreamEnd, StreamEvent};
use crate::Metadata;
use crate::codec;
use crate::error::Error;
use crate::grpc::metadata;
use parking_lot::Mutex;
use prost_reflect::DynamicMessage;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::Streaming;

struct Shared {
    buffer: MessageBuffer,
    end: Option<StreamEnd>,
    metadata: Metadata,
}

struct InboxInner {
    shared: Mutex<Shared>,
    signal: watch::Sender<BufferStats>,
}

#[derive(Clone)]
pub(crate) struct Inbox {
    inner: Arc<InboxInner>,
}

impl Inbox {
    pub(crate) fn new(limits: BufferLimits) -> Self {
        let (signal, _) = watch::channel(BufferStats::default());
        Self {
            inner: Arc::new(InboxInner {
                shared: Mutex::new(Shared {
                    buffer: MessageBuffer::new(limits),
                    end: None,
                    metadata: Vec::new(),
                }),
                signal,
            }),
        }
    }

    pub(crate) fn extend_metadata(&self, entries: Metadata) {
        self.inner.shared.lock().metadata.extend(entries);
    }

    /// Stores a received message. Messages arriving after the terminal are dropped.
    pub(crate) fn push(&self, message: DynamicMessage) -> Result<(), Error> {
        let text = codec::decode_to_text(&message)?;

        let stats = {
            let mut shared = self.inner.shared.lock();
            if shared.end.is_some() {
                return Ok(());
            }
            let seq = shared.buffer.next_seq();
            shared.buffer.push(ReceivedMessage { seq, message, text });
            shared.buffer.stats()
        };

        self.inner.signal.send_replace(stats);
        Ok(())
    }

    /// Records the terminal. Only the first terminal sticks; returns whether this one did.
    pub(crate) fn finish(&self, end: StreamEnd) -> bool {
        let stats = {
            let mut shared = self.inner.shared.lock();
            if shared.end.is_some() {
                return false;
            }
            if let StreamEnd::Completed { trailers } = &end {
                shared.metadata.extend(trailers.iter().cloned());
            }
            shared.end = Some(end);
            shared.buffer.stats()
        };

        self.inner.signal.send_replace(stats);
        true
    }

    pub(crate) fn end(&self) -> Option<StreamEnd> {
        self.inner.shared.lock().end.clone()
    }

    pub(crate) fn recv_state(&self) -> RecvState {
        match self.inner.shared.lock().end {
            None => RecvState::Active,
            Some(StreamEnd::Completed { .. }) => RecvState::Ended,
            Some(StreamEnd::Failed(_) | StreamEnd::Cancelled) => RecvState::Errored,
        }
    }

    pub(crate) fn stats(&self) -> BufferStats {
        self.inner.shared.lock().buffer.stats()
    }

    pub(crate) fn snapshot(&self) -> Vec<ReceivedMessage> {
        self.inner.shared.lock().buffer.snapshot()
    }

    pub(crate) fn metadata(&self) -> Metadata {
        self.inner.shared.lock().metadata.clone()
    }

    /// Fires on every received message and on the terminal.
    pub(crate) fn progress(&self) -> watch::Receiver<BufferStats> {
        self.inner.signal.subscribe()
    }

    pub(crate) fn receiver(&self) -> Receiver {
        Receiver {
            inbox: self.clone(),
            signal: self.inner.signal.subscribe(),
            cursor: 0,
        }
    }

    /// Resolves with the terminal once the stream has ended.
    pub(crate) async fn finished(&self) -> StreamEnd {
        let mut signal = self.inner.signal.subscribe();
        loop {
            if let Some(end) = self.end() {
                return end;
            }
            if signal.changed().await.is_err() {
                return self.end().unwrap_or(StreamEnd::Cancelled);
            }
        }
    }
}

/// A read cursor over an [`Inbox`].
pub(crate) struct Receiver {
    inbox: Inbox,
    signal: watch::Receiver<BufferStats>,
    cursor: u64,
}

impl Receiver {
    /// The next message in server order, or the terminal once everything was delivered.
    ///
    /// A cancelled stream reports its terminal right away, without draining the buffer.
    pub(crate) async fn recv(&mut self) -> StreamEvent {
        loop {
            {
                let shared = self.inbox.inner.shared.lock();
                if let Some(StreamEnd::Cancelled) = shared.end {
                    return StreamEvent::End(StreamEnd::Cancelled);
                }
                if let Some(message) = shared.buffer.next_from(self.cursor) {
                    self.cursor = message.seq + 1;
                    return StreamEvent::Message(message.clone());
                }
                if let Some(end) = &shared.end {
                    return StreamEvent::End(end.clone());
                }
            }

            if self.signal.changed().await.is_err() {
                return StreamEvent::End(self.inbox.end().unwrap_or(StreamEnd::Cancelled));
            }
        }
    }
}

/// Drains `stream` into `inbox` until the server completes, the call fails, the deadline
/// passes or the scope is cancelled. Returns the terminal that was recorded.
pub(crate) async fn pump(
    mut stream: Streaming<DynamicMessage>,
    inbox: &Inbox,
    scope: &CallScope,
    hooks: &Hooks,
) -> StreamEnd {
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => break StreamEnd::Cancelled,
            _ = scope.expired() => break StreamEnd::Failed(scope.deadline_error()),
            next = stream.message() => next,
        };

        match next {
            Ok(Some(message)) => {
                if let Err(err) = inbox.push(message) {
                    break StreamEnd::Failed(err);
                }
            }
            Ok(None) => {
                break match stream.trailers().await {
                    Ok(trailers) => StreamEnd::Completed {
                        trailers: trailers.as_ref().map(metadata::to_pairs).unwrap_or_default(),
                    },
                    Err(status) => StreamEnd::Failed(Error::from_status(status)),
                };
            }
            Err(status) => break StreamEnd::Failed(Error::from_status(status)),
        }
    };

    if let StreamEnd::Failed(err) = &end {
        hooks.fault(err);
    }

    inbox.finish(end);
    // A handle may have recorded its own terminal first.
    inbox.end().unwrap_or(StreamEnd::Cancelled)
}
