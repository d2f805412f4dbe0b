//! # Dynamic calls
//!
//! [`GrpcClient`] sends [`DynamicMessage`] requests on any `tonic` transport and decodes the
//! replies against the method's output type with [`super::codec::DynamicCodec`], so no
//! generated code is needed.
//!
//! The path `/package.Service/Method` is built from the method descriptor. Request
//! metadata keeps its order and duplicates, values of `-bin` keys are base64 decoded, and
//! an optional timeout travels as `grpc-timeout`. One method exists per call shape.
use super::codec::DynamicCodec;
use super::metadata;
use crate::BoxError;
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::time::Duration;
use tonic::{
    Response, Status, Streaming,
    client::GrpcService,
    metadata::errors::{InvalidMetadataKey, InvalidMetadataValue},
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("The transport was not ready to accept a call: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("'{key}' is not a valid metadata key: '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("The value of metadata key '{key}' is invalid: '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
    #[error("Invalid base64 value for binary metadata key '{key}': '{source}'")]
    InvalidBinaryMetadata {
        key: String,
        source: base64::DecodeError,
    },
}

/// A dynamic gRPC client exchanging `DynamicMessage` values.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// One request, one response.
    ///
    /// The outer error means nothing was sent. A `Status` is the server's (or the
    /// transport's) answer to a call that did go out.
    pub async fn unary(
        &mut self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> Result<Result<Response<DynamicMessage>, Status>, GrpcRequestError> {
        self.ready().await?;

        let codec = DynamicCodec::new(method.output());
        Ok(self.client.unary(request, http_path(method), codec).await)
    }

    /// One request, then the server's messages on the returned stream.
    pub async fn server_streaming(
        &mut self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> Result<Result<Response<Streaming<DynamicMessage>>, Status>, GrpcRequestError> {
        self.ready().await?;

        let codec = DynamicCodec::new(method.output());
        Ok(self
            .client
            .server_streaming(request, http_path(method), codec)
            .await)
    }

    /// Streams `request`'s messages to the server and resolves with its single reply once the
    /// stream ends.
    pub async fn client_streaming<R>(
        &mut self,
        method: &MethodDescriptor,
        request: tonic::Request<R>,
    ) -> Result<Result<Response<DynamicMessage>, Status>, GrpcRequestError>
    where
        R: Stream<Item = DynamicMessage> + Send + 'static,
    {
        self.ready().await?;

        let codec = DynamicCodec::new(method.output());
        Ok(self
            .client
            .client_streaming(request, http_path(method), codec)
            .await)
    }

    /// Both sides stream independently. Ending the `request` stream half-closes the call.
    pub async fn bidirectional_streaming<R>(
        &mut self,
        method: &MethodDescriptor,
        request: tonic::Request<R>,
    ) -> Result<Result<Response<Streaming<DynamicMessage>>, Status>, GrpcRequestError>
    where
        R: Stream<Item = DynamicMessage> + Send + 'static,
    {
        self.ready().await?;

        let codec = DynamicCodec::new(method.output());
        Ok(self.client.streaming(request, http_path(method), codec).await)
    }

    async fn ready(&mut self) -> Result<(), GrpcRequestError> {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))
    }
}

fn http_path(method: &MethodDescriptor) -> http::uri::PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::try_from(path).unwrap_or_else(|_| http::uri::PathAndQuery::from_static("/"))
}

/// Wraps `payload` in a request carrying `headers` and an optional `grpc-timeout`.
///
/// Invalid metadata is reported before anything is sent.
pub fn build_request<T>(
    payload: T,
    headers: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<tonic::Request<T>, GrpcRequestError> {
    let mut request = tonic::Request::new(payload);
    metadata::append(request.metadata_mut(), headers)?;
    if let Some(timeout) = timeout {
        request.set_timeout(timeout);
    }
    Ok(request)
}
