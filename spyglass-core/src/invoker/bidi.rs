use super::client_stream::{Outbound, SendFailure};
use super::stream::{Inbox, Receiver, pump};
use super::{
    BufferStats, CallOptions, CallScope, CallSummary, Invoker, ReceivedMessage, RecvState,
    SendState, StreamEnd, StreamEvent, flatten, join_texts, method_path,
};
use crate::error::Error;
use crate::grpc::client::build_request;
use crate::grpc::metadata;
use crate::schema::CallShape;
use crate::{BoxError, Metadata};
use http_body::Body as HttpBody;
use prost_reflect::MethodDescriptor;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::client::GrpcService;

/// A running bidirectional call.
///
/// The two halves are independent: sending never waits for responses, and responses keep
/// arriving after [`BidiStream::close_send`]. Dropping the handle cancels the call.
pub struct BidiStream {
    outbound: Outbound,
    inbox: Inbox,
    receiver: Receiver,
    scope: CallScope,
}

impl BidiStream {
    /// Encodes `text` and sends it.
    pub async fn send(&mut self, text: &str) -> Result<(), Error> {
        match self.outbound.send(text, &self.scope).await {
            Ok(()) => Ok(()),
            Err(SendFailure::Rejected(err)) => Err(err),
            Err(SendFailure::CallOver) => Err(self
                .inbox
                .end()
                .and_then(|end| end.error())
                .unwrap_or(Error::SendAfterClose(SendState::Closed))),
        }
    }

    /// The next message, or the terminal once the stream is over.
    pub async fn recv(&mut self) -> StreamEvent {
        self.receiver.recv().await
    }

    /// Half-closes the send side. Responses keep flowing.
    pub fn close_send(&mut self) {
        self.outbound.close(SendState::HalfClosed);
    }

    pub fn cancel(&self) {
        self.scope.cancel();
        self.inbox.finish(StreamEnd::Cancelled);
    }

    pub fn stats(&self) -> BufferStats {
        self.inbox.stats()
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.inbox.snapshot()
    }

    pub fn metadata(&self) -> Metadata {
        self.inbox.metadata()
    }

    pub fn progress(&self) -> watch::Receiver<BufferStats> {
        self.inbox.progress()
    }

    /// `Closed` once the call has ended, whichever way.
    pub fn send_state(&self) -> SendState {
        if self.inbox.end().is_some() || self.scope.is_cancelled() {
            SendState::Closed
        } else {
            self.outbound.state()
        }
    }

    pub fn recv_state(&self) -> RecvState {
        self.inbox.recv_state()
    }

    pub async fn finished(&self) -> StreamEnd {
        self.inbox.finished().await
    }
}

impl Drop for BidiStream {
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
    /// Starts a bidirectional call.
    pub fn bidirectional(
        &self,
        method: &MethodDescriptor,
        headers: &[(String, String)],
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<BidiStream, Error> {
        let (outbound, receiver) = Outbound::new(method, options);
        let request = build_request(ReceiverStream::new(receiver), headers, options.deadline)?;

        let inbox = Inbox::new(self.limits);
        let scope = self.call_scope(cancel, options);

        let task_inbox = inbox.clone();
        let task_scope = scope.clone();
        let mut client = self.client.clone();
        let hooks = self.hooks.clone();
        let method = method.clone();
        let sent = outbound.sent();
        let request_metadata = headers.to_vec();

        tokio::spawn(async move {
            let started = Instant::now();
            let opened = task_scope
                .run(async { flatten(client.bidirectional_streaming(&method, request).await) })
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

            let request = join_texts(sent.lock().iter().map(String::as_str));
            let messages = task_inbox.snapshot();
            hooks.complete(CallSummary {
                method: method_path(&method),
                shape: CallShape::Bidirectional,
                request,
                request_metadata,
                response: Some(join_texts(messages.iter().map(|m| m.text.as_str()))),
                response_metadata: task_inbox.metadata(),
                duration: started.elapsed(),
                error: end.error(),
            });
        });

        Ok(BidiStream {
            outbound,
            receiver: inbox.receiver(),
            inbox,
            scope,
        })
    }
}
