use super::{
    CallOptions, CallScope, CallSummary, Invoker, SendState, UnaryResponse, flatten, join_texts,
    method_path,
};
use crate::BoxError;
use crate::codec::{self, CodecOptions};
use crate::error::Error;
use crate::grpc::client::build_request;
use crate::schema::CallShape;
use http_body::Body as HttpBody;
use parking_lot::Mutex;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::client::GrpcService;

pub(crate) const OUTBOUND_CAPACITY: usize = 16;

/// The send half shared by client-streaming and bidirectional calls.
pub(crate) struct Outbound {
    method: MethodDescriptor,
    codec: CodecOptions,
    sender: Option<mpsc::Sender<DynamicMessage>>,
    state: SendState,
    sent: Arc<Mutex<Vec<String>>>,
}

pub(crate) enum SendFailure {
    Rejected(Error),
    /// The request stream is gone because the call already ended.
    CallOver,
}

impl Outbound {
    pub(crate) fn new(
        method: &MethodDescriptor,
        options: &CallOptions,
    ) -> (Self, mpsc::Receiver<DynamicMessage>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let outbound = Self {
            method: method.clone(),
            codec: options.codec.clone(),
            sender: Some(sender),
            state: SendState::Open,
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        (outbound, receiver)
    }

    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }

    pub(crate) fn state(&self) -> SendState {
        self.state
    }

    pub(crate) async fn send(&mut self, text: &str, scope: &CallScope) -> Result<(), SendFailure> {
        if scope.is_cancelled() {
            return Err(SendFailure::Rejected(Error::SendAfterCancel));
        }
        let Some(sender) = self.sender.as_ref().filter(|_| self.state == SendState::Open) else {
            return Err(SendFailure::Rejected(Error::SendAfterClose(self.state)));
        };

        let message = codec::encode_text(&self.method.input(), text, &self.codec)
            .map_err(|e| SendFailure::Rejected(e.into()))?;

        self.sent.lock().push(text.to_string());
        let delivered = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(SendFailure::Rejected(Error::SendAfterCancel)),
            sent = sender.send(message) => sent.map_err(|_| SendFailure::CallOver),
        };

        if delivered.is_err() {
            self.sent.lock().pop();
        }
        if let Err(SendFailure::CallOver) = &delivered {
            self.close(SendState::Closed);
        }
        delivered
    }

    /// Drops the request stream, which half-closes the call.
    pub(crate) fn close(&mut self, state: SendState) {
        self.sender = None;
        if self.state != SendState::Closed {
            self.state = state;
        }
    }
}

/// A running client-streaming call.
///
/// Messages are sent with [`ClientStream::send`]; [`ClientStream::close_and_receive`]
/// half-closes the call and waits for the single response. Dropping the handle cancels
/// the call.
pub struct ClientStream {
    outbound: Outbound,
    response: Option<oneshot::Receiver<Result<UnaryResponse, Error>>>,
    outcome: Option<Result<UnaryResponse, Error>>,
    scope: CallScope,
}

impl ClientStream {
    /// Encodes `text` and sends it.
    ///
    /// Fails with [`Error::SendAfterCancel`] once cancelled and with
    /// [`Error::SendAfterClose`] once half-closed. If the server has already ended the call,
    /// its outcome is returned as the error.
    pub async fn send(&mut self, text: &str) -> Result<(), Error> {
        match self.outbound.send(text, &self.scope).await {
            Ok(()) => Ok(()),
            Err(SendFailure::Rejected(err)) => Err(err),
            Err(SendFailure::CallOver) => match self.resolve().await {
                Err(err) => Err(err),
                Ok(_) => Err(Error::SendAfterClose(SendState::Closed)),
            },
        }
    }

    /// Half-closes the call and waits for the response.
    ///
    /// Calling it again returns the same outcome.
    pub async fn close_and_receive(&mut self) -> Result<UnaryResponse, Error> {
        self.outbound.close(SendState::HalfClosed);
        let outcome = self.resolve().await;
        self.outbound.close(SendState::Closed);
        outcome
    }

    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn send_state(&self) -> SendState {
        if self.scope.is_cancelled() {
            SendState::Closed
        } else {
            self.outbound.state()
        }
    }

    async fn resolve(&mut self) -> Result<UnaryResponse, Error> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let outcome = match self.response.take() {
            Some(response) => tokio::select! {
                biased;
                _ = self.scope.cancelled() => Err(Error::Cancelled),
                received = response => received.unwrap_or(Err(Error::Cancelled)),
            },
            None => Err(Error::Cancelled),
        };

        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.scope.cancel();
        }
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
    /// Starts a client-streaming call. No message is sent until [`ClientStream::send`].
    pub fn client_streaming(
        &self,
        method: &MethodDescriptor,
        headers: &[(String, String)],
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<ClientStream, Error> {
        let (outbound, receiver) = Outbound::new(method, options);
        let request = build_request(ReceiverStream::new(receiver), headers, options.deadline)?;

        let scope = self.call_scope(cancel, options);
        let (respond, response) = oneshot::channel();

        let task_scope = scope.clone();
        let mut client = self.client.clone();
        let hooks = self.hooks.clone();
        let method = method.clone();
        let sent = outbound.sent();
        let request_metadata = headers.to_vec();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = task_scope
                .run(async { flatten(client.client_streaming(&method, request).await) })
                .await
                .and_then(|response| UnaryResponse::from_response(response, started.elapsed()));

            if let Err(err) = &result {
                hooks.fault(err);
            }

            let request = join_texts(sent.lock().iter().map(String::as_str));
            hooks.complete(CallSummary {
                method: method_path(&method),
                shape: CallShape::ClientStreaming,
                request,
                request_metadata,
                response: result.as_ref().ok().map(|r| r.text().to_string()),
                response_metadata: result.as_ref().map(|r| r.metadata.clone()).unwrap_or_default(),
                duration: started.elapsed(),
                error: result.as_ref().err().cloned(),
            });

            let _ = respond.send(result);
        });

        Ok(ClientStream {
            outbound,
            response: Some(response),
            outcome: None,
            scope,
        })
    }
}
