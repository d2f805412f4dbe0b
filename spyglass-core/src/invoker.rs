//! # Invoker
//!
//! Executes calls of all four shapes against a `MethodDescriptor`, taking request text,
//! ordered metadata, [`CallOptions`] and a caller `CancellationToken`.
//!
//! * **Unary**: [`Invoker::unary`] resolves to an [`UnaryResponse`].
//! * **Server streaming**: [`Invoker::server_streaming`] returns a [`ServerStream`].
//! * **Client streaming**: [`Invoker::client_streaming`] returns a [`ClientStream`].
//! * **Bidirectional**: [`Invoker::bidirectional`] returns a [`BidiStream`].
//!
//! Request text is encoded before anything touches the wire, so codec failures are
//! returned synchronously and leave no trace on the server.
//!
//! Every call runs in its own cancellation scope, a child of the connection scope. It is
//! cancelled by the caller's token, by the handle, or by the connection going away.
//! Received messages are kept in a bounded buffer (see [`BufferLimits`]).
use crate::codec::{self, CodecOptions};
use crate::connection::Connection;
use crate::error::Error;
use crate::grpc::client::{GrpcClient, build_request};
use crate::grpc::metadata;
use crate::schema::CallShape;
use crate::{BoxError, Metadata};
use http_body::Body as HttpBody;
use prost::Message;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::client::GrpcService;
use tonic::transport::Channel;

mod bidi;
mod buffer;
mod client_stream;
mod server_stream;
mod stream;

pub use bidi::BidiStream;
pub use client_stream::ClientStream;
pub use server_stream::ServerStream;

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Sent as `grpc-timeout` and enforced locally over the whole call.
    pub deadline: Option<Duration>,
    pub codec: CodecOptions,
}

impl CallOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Retention policy for received stream messages.
///
/// When `capacity` messages are held, the oldest `evict_batch` are dropped before the next
/// one is stored. This bounds memory only; it is not flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub capacity: usize,
    pub evict_batch: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            capacity: 1000,
            evict_batch: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// Messages currently retained.
    pub visible: usize,
    /// Messages received since the call started.
    pub total: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Open,
    HalfClosed,
    Closed,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SendState::Open => "open",
            SendState::HalfClosed => "half-closed",
            SendState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Active,
    Ended,
    /// Failed or cancelled.
    Errored,
}

/// How a response stream ended.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    Completed { trailers: Metadata },
    Failed(Error),
    Cancelled,
}

impl StreamEnd {
    pub fn error(&self) -> Option<Error> {
        match self {
            StreamEnd::Completed { .. } => None,
            StreamEnd::Failed(err) => Some(err.clone()),
            StreamEnd::Cancelled => Some(Error::Cancelled),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Position in the stream, starting at 0.
    pub seq: u64,
    pub message: DynamicMessage,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(ReceivedMessage),
    End(StreamEnd),
}

#[derive(Debug, Clone)]
pub struct UnaryResponse {
    pub body: DynamicMessage,
    /// Headers followed by trailers.
    pub metadata: Metadata,
    pub duration: Duration,
    /// Encoded size of the body in bytes.
    pub size: usize,
    text: String,
}

impl UnaryResponse {
    fn from_response(response: tonic::Response<DynamicMessage>, duration: Duration) -> Result<Self, Error> {
        let metadata = metadata::to_pairs(response.metadata());
        let body = response.into_inner();
        let text = codec::decode_to_text(&body)?;

        Ok(Self {
            size: body.encoded_len(),
            body,
            metadata,
            duration,
            text,
        })
    }

    /// The body as pretty-printed JSON.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// What a finished call looked like, handed to the completion hook.
#[derive(Debug, Clone)]
pub struct CallSummary {
    /// `package.Service/Method`.
    pub method: String,
    pub shape: CallShape,
    pub request: String,
    pub request_metadata: Metadata,
    pub response: Option<String>,
    pub response_metadata: Metadata,
    pub duration: Duration,
    pub error: Option<Error>,
}

pub type FaultSink = Arc<dyn Fn(&Error) + Send + Sync>;
pub type CompletionSink = Arc<dyn Fn(CallSummary) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    on_fault: Option<FaultSink>,
    on_complete: Option<CompletionSink>,
}

impl Hooks {
    pub(crate) fn fault(&self, err: &Error) {
        if let Some(sink) = &self.on_fault
            && matches!(err, Error::Transport { .. })
        {
            sink(err);
        }
    }

    pub(crate) fn complete(&self, summary: CallSummary) {
        tracing::debug!(
            method = %summary.method,
            duration = ?summary.duration,
            error = summary.error.as_ref().map(tracing::field::display),
            "Call finished"
        );
        if let Some(sink) = &self.on_complete {
            sink(summary);
        }
    }
}

/// Cancellation and deadline of a single call.
#[derive(Clone)]
pub(crate) struct CallScope {
    call: CancellationToken,
    caller: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl CallScope {
    pub(crate) fn cancel(&self) {
        self.call.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.call.is_cancelled() || self.caller.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        tokio::select! {
            _ = self.call.cancelled() => {}
            _ = self.caller.cancelled() => {}
        }
    }

    /// Never resolves for calls without a deadline.
    pub(crate) async fn expired(&self) {
        match self.deadline {
            Some((at, _)) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    pub(crate) fn deadline_error(&self) -> Error {
        let budget = self.deadline.map(|(_, budget)| budget).unwrap_or_default();
        Error::DeadlineExceeded(format!("no response within {budget:?}"))
    }

    /// Runs `fut` until it completes, the deadline passes or the call is cancelled.
    pub(crate) async fn run<T>(&self, fut: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            _ = self.expired() => Err(self.deadline_error()),
            result = fut => result,
        }
    }
}

/// Folds the two layers of a `GrpcClient` result into one.
pub(crate) fn flatten<T>(
    result: Result<Result<T, tonic::Status>, crate::grpc::client::GrpcRequestError>,
) -> Result<T, Error> {
    result?.map_err(Error::from_status)
}

/// Renders the texts of several messages as one block, for history.
pub(crate) fn join_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    texts.into_iter().collect::<Vec<_>>().join("\n")
}

/// Executes calls over a transport `S`.
///
/// Production code uses the `Channel` of a [`Connection`]; tests can use any in-process
/// `tonic` service.
#[derive(Clone)]
pub struct Invoker<S = Channel> {
    client: GrpcClient<S>,
    scope: CancellationToken,
    limits: BufferLimits,
    hooks: Hooks,
}

impl Invoker<Channel> {
    /// An invoker whose calls are all cancelled when `connection` goes away.
    pub fn for_connection(connection: &Connection) -> Self {
        Invoker::new(connection.channel()).with_scope(connection.scope().clone())
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
    pub fn new(service: S) -> Self {
        Self {
            client: GrpcClient::new(service),
            scope: CancellationToken::new(),
            limits: BufferLimits::default(),
            hooks: Hooks::default(),
        }
    }

    /// Parent scope of every call made through this invoker.
    pub fn with_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_limits(mut self, limits: BufferLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Called with every transport failure a call observes.
    pub fn with_fault_sink(mut self, sink: FaultSink) -> Self {
        self.hooks.on_fault = Some(sink);
        self
    }

    /// Called once per call that reached the wire, when it finishes.
    pub fn with_completion(mut self, sink: CompletionSink) -> Self {
        self.hooks.on_complete = Some(sink);
        self
    }

    /// Performs a unary call.
    ///
    /// # Arguments
    ///
    /// * `method` - The method to call.
    /// * `text` - The request as JSON text.
    /// * `headers` - Ordered request metadata.
    /// * `options` - Deadline and codec options.
    /// * `cancel` - Aborts the call with [`Error::Cancelled`].
    ///
    /// # Returns
    ///
    /// * `Ok(UnaryResponse)` - The decoded response and its metadata.
    /// * `Err(Error)` - Encoding, transport or status failure.
    pub async fn unary(
        &self,
        method: &MethodDescriptor,
        text: &str,
        headers: &[(String, String)],
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<UnaryResponse, Error> {
        let message = codec::encode_text(&method.input(), text, &options.codec)?;
        let request = build_request(message, headers, options.deadline)?;

        let scope = self.call_scope(cancel, options);
        let started = Instant::now();
        let mut client = self.client.clone();

        let result = scope
            .run(async { flatten(client.unary(method, request).await) })
            .await
            .and_then(|response| UnaryResponse::from_response(response, started.elapsed()));

        if let Err(err) = &result {
            self.hooks.fault(err);
        }

        self.hooks.complete(CallSummary {
            method: method_path(method),
            shape: CallShape::Unary,
            request: text.to_string(),
            request_metadata: headers.to_vec(),
            response: result.as_ref().ok().map(|r| r.text().to_string()),
            response_metadata: result.as_ref().map(|r| r.metadata.clone()).unwrap_or_default(),
            duration: started.elapsed(),
            error: result.as_ref().err().cloned(),
        });

        result
    }

    pub(crate) fn call_scope(&self, caller: &CancellationToken, options: &CallOptions) -> CallScope {
        CallScope {
            call: self.scope.child_token(),
            caller: caller.clone(),
            deadline: options.deadline.map(|budget| (Instant::now() + budget, budget)),
        }
    }
}

pub(crate) fn method_path(method: &MethodDescriptor) -> String {
    format!("{}/{}", method.parent_service().full_name(), method.name())
}
