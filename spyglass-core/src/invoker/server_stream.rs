use super::stream::{Inbox, Receiver, pump};
use super::{
    BufferStats, CallOptions, CallScope, CallSummary, Invoker, ReceivedMessage, RecvState,
    StreamEnd, StreamEvent, flatten, join_texts, method_path,
};
use crate::codec;
use crate::error::Error;
use crate::grpc::client::build_request;
use crate::grpc::metadata;
use crate::schema::CallShape;
use crate::{BoxError, Metadata};
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::MethodDescriptor;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::client::GrpcService;

/// A running server-streaming call.
///
/// Dropping the handle cancels the call.
pub struct ServerStream {
    inbox: Inbox,
    receiver: Receiver,
    scope: CallScope,
}

impl ServerStream {
    /// The next message, or the terminal once the stream is over.
    pub async fn recv(&mut self) -> StreamEvent {
        self.receiver.recv().await
    }

    /// Cancels the call. Later receives report [`StreamEnd::Cancelled`].
    pub fn cancel(&self) {
        self.scope.cancel();
        self.inbox.finish(StreamEnd::Cancelled);
    }

    pub fn stats(&self) -> BufferStats {
        self.inbox.stats()
    }

    /// The retained messages, oldest first.
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.inbox.snapshot()
    }

    pub fn state(&self) -> RecvState {
        self.inbox.recv_state()
    }

    /// Response headers, followed by trailers once the stream has completed.
    pub fn metadata(&self) -> Metadata {
        self.inbox.metadata()
    }

    /// Notified on every message and on the terminal.
    pub fn progress(&self) -> watch::Receiver<BufferStats> {
        self.inbox.progress()
    }

    /// Resolves with the terminal, without consuming messages.
    pub async fn finished(&self) -> StreamEnd {
        self.inbox.finished().await
    }

    /// Adapts the handle into a `Stream` of messages.
    ///
    /// The stream ends after a completed terminal. A failed or cancelled terminal is yielded
    /// once as an error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ReceivedMessage, Error>> + Send {
        futures_util::stream::unfold(Some(self), |handle| async move {
            let mut handle = handle?;
            match handle.recv().await {
                StreamEvent::Message(message) => Some((Ok(message), Some(handle))),
                StreamEvent::End(end) => end.error().map(|err| (Err(err), None)),
            }
        })
    }
}

impl Drop for ServerStream {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

impl<S> Invoker<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError> + Send,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Starts a server-streaming call.
    ///
    /// Only encoding and metadata failures are returned here. Everything after that,
    /// including a status the server rejects the call with, arrives as the stream terminal.
    pub fn server_streaming(
        &self,
        method: &MethodDescriptor,
        text: &str,
        headers: &[(String, String)],
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<ServerStream, Error> {
        let message = codec::encode_text(&method.input(), text, &options.codec)?;
        let request = build_request(message, headers, options.deadline)?;

        let inbox = Inbox::new(self.limits);
        let scope = self.call_scope(cancel, options);

        let task_inbox = inbox.clone();
        let task_scope = scope.clone();
        let mut client = self.client.clone();
        let hooks = self.hooks.clone();
        let method = method.clone();
        let summary = CallSummary {
            method: method_path(&method),
            shape: CallShape::ServerStreaming,
            request: text.to_string(),
            request_metadata: headers.to_vec(),
            response: None,
            response_metadata: Vec::new(),
            duration: Default::default(),
            error: None,
        };

        tokio::spawn(async move {
            let started = Instant::now();
            let opened = task_scope
                .run(async { flatten(client.server_streaming(&method, request).await) })
                .await;

            let end = match opened {
                Ok(response) => {
                    task_inbox.extend_metadata(metadata::to_pairs(response.metadata()));
                    pump(response.into_inner(), &task_inbox, &task_scope, &hooks).await
                }
                Err(err) => {
                    hooks.fault(&err);
                    task_inbox.finish(match err {
                        Error::Cancelled => StreamEnd::Cancelled,
                        err => StreamEnd::Failed(err),
                    });
                    task_inbox.end().unwrap_or(StreamEnd::Cancelled)
                }
            };

            let messages = task_inbox.snapshot();
            hooks.complete(CallSummary {
                response: Some(join_texts(messages.iter().map(|m| m.text.as_str()))),
                response_metadata: task_inbox.metadata(),
                duration: started.elapsed(),
                error: end.error(),
                ..summary
            });
        });

        Ok(ServerStream {
            receiver: inbox.receiver(),
            inbox,
            scope,
        })
    }
}
