//! # Reflection Client
//!
//! A `grpc.reflection.v1` client that turns a symbol or file name into a self-contained
//! `FileDescriptorSet`.
//!
//! A file descriptor returned by the server only names its imports, so the client keeps
//! the reflection stream open and asks for every import it has not seen yet, until no
//! request is outstanding.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use crate::BoxError;
use futures_util::stream::once;
use http_body::Body as HttpBody;
use prost::Message;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Streaming, client::GrpcService};
use tonic_reflection::pb::v1::{
    ExtensionRequest, ServerReflectionRequest, ServerReflectionResponse,
    server_reflection_client::ServerReflectionClient, server_reflection_request::MessageRequest,
    server_reflection_response::MessageResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum ReflectionResolveError {
    /// The server refused to open the reflection stream, usually because it does not
    /// serve reflection at all.
    #[error("Could not open a reflection stream, the server may not support reflection: '{0}'")]
    ServerStreamInitFailed(#[source] tonic::Status),

    #[error("The reflection stream failed: '{0}'")]
    ServerStreamFailure(#[source] tonic::Status),

    #[error("The reflection stream ended before all requests were answered")]
    StreamClosed,

    #[error("Could not queue a reflection request")]
    SendFailed,

    #[error("Reflection error {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("Unexpected reflection response: {0}")]
    UnexpectedResponseType(String),

    #[error("Invalid file descriptor: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

/// The protocol's `host` field. Servers ignore it in practice.
const HOST: &str = "";

/// Outstanding requests allowed on the stream before sends wait.
const REQUEST_QUEUE: usize = 64;

fn request(message: MessageRequest) -> ServerReflectionRequest {
    ServerReflectionRequest {
        host: HOST.to_string(),
        message_request: Some(message),
    }
}

/// A generic client for the gRPC Server Reflection Protocol.
#[derive(Debug, Clone)]
pub struct ReflectionClient<T = Channel> {
    client: ServerReflectionClient<T>,
}

impl<S> ReflectionClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self {
            client: ServerReflectionClient::new(service),
        }
    }

    /// Fetches the file declaring `symbol` (e.g. `my.package.MyService`) together with
    /// every file it imports, directly or not.
    pub async fn file_descriptor_set_by_symbol(
        &mut self,
        symbol: &str,
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        self.file_descriptor_set(MessageRequest::FileContainingSymbol(symbol.to_string()))
            .await
    }

    /// Fetches the file with the given name and all of its transitive imports.
    pub async fn file_descriptor_set_by_filename(
        &mut self,
        filename: &str,
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        self.file_descriptor_set(MessageRequest::FileByFilename(filename.to_string()))
            .await
    }

    /// Fetches the file declaring extension `number` of `containing_type`, plus its imports.
    pub async fn file_containing_extension(
        &mut self,
        containing_type: &str,
        number: i32,
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        self.file_descriptor_set(MessageRequest::FileContainingExtension(ExtensionRequest {
            containing_type: containing_type.to_string(),
            extension_number: number,
        }))
        .await
    }

    /// Lists the extension numbers the server knows for `containing_type`, sorted.
    pub async fn all_extension_numbers(
        &mut self,
        containing_type: &str,
    ) -> Result<Vec<i32>, ReflectionResolveError> {
        let request = MessageRequest::AllExtensionNumbersOfType(containing_type.to_string());

        match self.single_request(request).await? {
            MessageResponse::AllExtensionNumbersResponse(resp) => {
                let mut numbers = resp.extension_number;
                numbers.sort_unstable();
                Ok(numbers)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Fully-qualified names of the services the server advertises, in server order.
    pub async fn list_services(&mut self) -> Result<Vec<String>, ReflectionResolveError> {
        let listing = self
            .single_request(MessageRequest::ListServices(String::new()))
            .await?;

        match listing {
            MessageResponse::ListServicesResponse(listing) => {
                Ok(listing.service.into_iter().map(|service| service.name).collect())
            }
            other => Err(unexpected(other)),
        }
    }

    async fn file_descriptor_set(
        &mut self,
        first: MessageRequest,
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);

        let mut responses = self
            .client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        let mut collector = FileCollector::new(tx);
        collector.request(first).await?;
        collector.drain(&mut responses).await?;

        tracing::debug!(files = collector.files.len(), "Fetched descriptors via reflection");
        Ok(collector.into_set())
    }

    /// Sends one request on its own stream and returns the single answer.
    async fn single_request(
        &mut self,
        message: MessageRequest,
    ) -> Result<MessageResponse, ReflectionResolveError> {
        let req = request(message);

        let mut responses = self
            .client
            .server_reflection_info(once(async { req }))
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        let response = next_response(&mut responses).await?;
        match response {
            MessageResponse::ErrorResponse(e) => Err(ReflectionResolveError::ServerError {
                code: e.error_code,
                message: e.error_message,
            }),
            other => Ok(other),
        }
    }
}

async fn next_response(
    responses: &mut Streaming<ServerReflectionResponse>,
) -> Result<MessageResponse, ReflectionResolveError> {
    responses
        .message()
        .await
        .map_err(ReflectionResolveError::ServerStreamFailure)?
        .ok_or(ReflectionResolveError::StreamClosed)?
        .message_response
        .ok_or_else(|| ReflectionResolveError::UnexpectedResponseType("empty response".into()))
}

fn unexpected(response: MessageResponse) -> ReflectionResolveError {
    ReflectionResolveError::UnexpectedResponseType(format!("{response:?}"))
}

/// Files received so far on one reflection stream, plus the imports still being fetched.
struct FileCollector {
    tx: mpsc::Sender<ServerReflectionRequest>,
    files: HashMap<String, FileDescriptorProto>,
    requested: HashSet<String>,
    pending: usize,
}

impl FileCollector {
    fn new(tx: mpsc::Sender<ServerReflectionRequest>) -> Self {
        Self {
            tx,
            files: HashMap::new(),
            requested: HashSet::new(),
            pending: 0,
        }
    }

    async fn request(&mut self, message: MessageRequest) -> Result<(), ReflectionResolveError> {
        self.tx
            .send(request(message))
            .await
            .map_err(|_| ReflectionResolveError::SendFailed)?;
        self.pending += 1;
        Ok(())
    }

    /// Reads answers until every request, including the imports they caused, was answered.
    async fn drain(
        &mut self,
        responses: &mut Streaming<ServerReflectionResponse>,
    ) -> Result<(), ReflectionResolveError> {
        while self.pending > 0 {
            let response = next_response(responses).await?;
            self.pending -= 1;

            match response {
                MessageResponse::FileDescriptorResponse(batch) => {
                    for raw in batch.file_descriptor_proto {
                        self.add(FileDescriptorProto::decode(raw.as_slice())?).await?;
                    }
                }
                MessageResponse::ErrorResponse(e) => {
                    return Err(ReflectionResolveError::ServerError {
                        code: e.error_code,
                        message: e.error_message,
                    });
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(())
    }

    /// Stores `file` and asks for each of its imports not yet seen or requested.
    async fn add(&mut self, file: FileDescriptorProto) -> Result<(), ReflectionResolveError> {
        let Some(name) = file.name.clone() else {
            return Ok(());
        };
        if self.files.contains_key(&name) {
            return Ok(());
        }

        for import in &file.dependency {
            if !self.files.contains_key(import) && self.requested.insert(import.clone()) {
                self.request(MessageRequest::FileByFilename(import.clone())).await?;
            }
        }

        self.files.insert(name, file);
        Ok(())
    }

    fn into_set(self) -> FileDescriptorSet {
        FileDescriptorSet {
            file: self.files.into_values().collect(),
        }
    }
}
