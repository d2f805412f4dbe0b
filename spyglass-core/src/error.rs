//! # Errors
//!
//! Every module owns a `thiserror` enum describing its own failures
//! ([`ConnectError`], [`SchemaError`], [`GrpcRequestError`], [`CodecError`], [`StorageError`], ...).
//! They are folded into the crate-wide [`Error`] at the public API boundary, and each
//! [`Error`] belongs to exactly one [`ErrorKind`].
//!
//! [`ErrorReport`] turns an [`Error`] into something a front-end can show: a title,
//! a message, recovery hints and the raw technical detail.
use crate::codec::CodecError;
use crate::connection::ConnectError;
use crate::grpc::client::GrpcRequestError;
use crate::invoker::SendState;
use crate::reflection::client::ReflectionResolveError;
use crate::schema::SchemaError;
use crate::storage::StorageError;
use std::fmt;
use tonic::Code;

/// Closed error taxonomy shared by every front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Transport,
    ReflectionUnavailable,
    InvalidDescriptor,
    CodecParse,
    CodecType,
    CodecRange,
    RemoteStatus,
    DeadlineExceeded,
    Cancelled,
    StorageIo,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::Transport => "Transport",
            ErrorKind::ReflectionUnavailable => "ReflectionUnavailable",
            ErrorKind::InvalidDescriptor => "InvalidDescriptor",
            ErrorKind::CodecParse => "CodecParse",
            ErrorKind::CodecType => "CodecType",
            ErrorKind::CodecRange => "CodecRange",
            ErrorKind::RemoteStatus => "RemoteStatus",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::StorageIo => "StorageIO",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("Transport failure: {message}")]
    Transport {
        message: String,
        detail: Option<String>,
    },

    #[error("The server does not support reflection: '{0}'")]
    ReflectionUnavailable(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("The server returned status {:?}: '{}'", .0.code(), .0.message())]
    RemoteStatus(tonic::Status),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("The call was cancelled")]
    Cancelled,

    #[error("Cannot send on a stream that was cancelled")]
    SendAfterCancel,

    #[error("Cannot send on a stream whose send side is {0}")]
    SendAfterClose(SendState),

    #[error("Not connected to any endpoint")]
    NotConnected,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::SendAfterClose(_) | Error::NotConnected => {
                ErrorKind::Validation
            }
            Error::Transport { .. } => ErrorKind::Transport,
            Error::ReflectionUnavailable(_) => ErrorKind::ReflectionUnavailable,
            Error::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Error::Codec(CodecError::Parse { .. }) => ErrorKind::CodecParse,
            Error::Codec(CodecError::Type { .. }) => ErrorKind::CodecType,
            Error::Codec(CodecError::Range { .. }) => ErrorKind::CodecRange,
            Error::RemoteStatus(_) => ErrorKind::RemoteStatus,
            Error::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Error::Cancelled | Error::SendAfterCancel => ErrorKind::Cancelled,
            Error::Storage(e) => e.kind(),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            detail: None,
        }
    }

    /// Classifies a status returned by a call.
    ///
    /// Statuses synthesized by tonic from a transport failure carry the underlying error
    /// as their source and become [`Error::Transport`]; statuses sent by the server are
    /// preserved verbatim as [`Error::RemoteStatus`].
    pub fn from_status(status: tonic::Status) -> Self {
        if status.code() == Code::DeadlineExceeded {
            return Error::DeadlineExceeded(status.message().to_string());
        }

        let local = matches!(status.code(), Code::Unavailable | Code::Unknown | Code::Internal)
            && std::error::Error::source(&status).is_some();

        if local {
            return Error::Transport {
                message: status.message().to_string(),
                detail: Some(error_chain(&status)),
            };
        }

        Error::RemoteStatus(status)
    }

    /// Whether this error means the underlying channel is dead, for example because the
    /// HTTP/2 keepalive ping went unanswered or the socket was closed under an open stream.
    ///
    /// Matches the rendered error chain: `io::ErrorKind` names such as "broken pipe" (what
    /// h2 reports for streams open when the socket hits EOF) and hyper's "connection closed"
    /// messages.
    pub fn is_connection_fatal(&self) -> bool {
        let Error::Transport { message, detail } = self else {
            return false;
        };

        let text = format!("{message} {}", detail.as_deref().unwrap_or_default()).to_lowercase();
        DEAD_CONNECTION.iter().any(|needle| text.contains(needle))
    }
}

const DEAD_CONNECTION: &[&str] = &[
    "keep-alive",
    "keepalive",
    "connection closed",
    "broken pipe",
    "connection reset",
    "connection aborted",
    "unexpected end of file",
];

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::EmptyAddress
            | ConnectError::InvalidAddress(..)
            | ConnectError::InsecureWithoutTls
            | ConnectError::SchemeMismatch(..) => Error::Validation(err.to_string()),
            ConnectError::DeadlineExceeded(..) => Error::DeadlineExceeded(err.to_string()),
            ConnectError::Cancelled(_) => Error::Cancelled,
            ConnectError::Tls(_) | ConnectError::ConnectionFailed(..) => Error::Transport {
                message: err.to_string(),
                detail: Some(error_chain(&err)),
            },
        }
    }
}

impl From<GrpcRequestError> for Error {
    fn from(err: GrpcRequestError) -> Self {
        match err {
            GrpcRequestError::ClientNotReady(_) => Error::Transport {
                message: err.to_string(),
                detail: Some(error_chain(&err)),
            },
            GrpcRequestError::InvalidMetadataKey { .. }
            | GrpcRequestError::InvalidMetadataValue { .. }
            | GrpcRequestError::InvalidBinaryMetadata { .. } => Error::Validation(err.to_string()),
        }
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::ReflectionUnavailable(status) => {
                Error::ReflectionUnavailable(status.message().to_string())
            }
            SchemaError::Reflection(inner) => inner.into(),
            SchemaError::SymbolNotFound(_)
            | SchemaError::MethodNotFound { .. }
            | SchemaError::Descriptor(_) => Error::InvalidDescriptor(err.to_string()),
        }
    }
}

impl From<ReflectionResolveError> for Error {
    fn from(err: ReflectionResolveError) -> Self {
        match err {
            ReflectionResolveError::ServerStreamInitFailed(status)
            | ReflectionResolveError::ServerStreamFailure(status) => match status.code() {
                Code::Unimplemented => Error::ReflectionUnavailable(status.message().to_string()),
                Code::NotFound | Code::InvalidArgument => {
                    Error::InvalidDescriptor(status.message().to_string())
                }
                _ => Error::from_status(status),
            },
            ReflectionResolveError::StreamClosed | ReflectionResolveError::SendFailed => {
                Error::transport(err.to_string())
            }
            ReflectionResolveError::ServerError { .. }
            | ReflectionResolveError::UnexpectedResponseType(_)
            | ReflectionResolveError::DecodeError(_) => Error::InvalidDescriptor(err.to_string()),
        }
    }
}

/// Joins an error and all of its sources with `": "`.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

/// A user-facing rendition of an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub title: String,
    pub message: String,
    pub hints: Vec<String>,
    pub detail: Option<String>,
}

impl ErrorReport {
    pub fn classify(err: &Error) -> Self {
        let kind = err.kind();
        let title = match kind {
            ErrorKind::Validation => "Invalid input",
            ErrorKind::Transport => "Connection problem",
            ErrorKind::ReflectionUnavailable => "Reflection unavailable",
            ErrorKind::InvalidDescriptor => "Schema problem",
            ErrorKind::CodecParse => "Malformed request",
            ErrorKind::CodecType => "Request does not match the schema",
            ErrorKind::CodecRange => "Value out of range",
            ErrorKind::RemoteStatus => "The server returned an error",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::StorageIo => "Storage problem",
        };

        let mut hints: Vec<String> = match kind {
            ErrorKind::Validation => vec!["Check the value you entered and try again.".into()],
            ErrorKind::Transport => vec![
                "Check that the server is running and the address is correct.".into(),
                "Check whether the endpoint expects TLS or plaintext.".into(),
            ],
            ErrorKind::ReflectionUnavailable => vec![
                "Enable the grpc.reflection.v1 service on the server.".into(),
            ],
            ErrorKind::InvalidDescriptor => vec![
                "The server's reflection data is incomplete or inconsistent.".into(),
            ],
            ErrorKind::CodecParse => vec!["Fix the JSON syntax at the reported position.".into()],
            ErrorKind::CodecType | ErrorKind::CodecRange => {
                vec!["Fix the value at the reported field path.".into()]
            }
            ErrorKind::RemoteStatus => Vec::new(),
            ErrorKind::DeadlineExceeded => vec!["Increase the deadline or try again later.".into()],
            ErrorKind::Cancelled => Vec::new(),
            ErrorKind::StorageIo => vec![format!(
                "Check the permissions of the data directory (override it with {}).",
                crate::config::DATA_DIR_ENV
            )],
        };

        if let Error::RemoteStatus(status) = err
            && let Some(hint) = status_hint(status.code())
        {
            hints.push(hint.to_string());
        }

        let detail = match err {
            Error::Transport {
                detail: Some(detail),
                ..
            } => Some(detail.clone()),
            other => Some(format!("{other:?}")),
        };

        Self {
            kind,
            title: title.to_string(),
            message: err.to_string(),
            hints,
            detail,
        }
    }
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        Self::classify(err)
    }
}

fn status_hint(code: Code) -> Option<&'static str> {
    let hint = match code {
        Code::Unauthenticated => "Check the authorization metadata.",
        Code::PermissionDenied => "The credentials are valid but lack permission for this method.",
        Code::NotFound => "The requested resource does not exist on the server.",
        Code::InvalidArgument => "The server rejected the request values.",
        Code::Unimplemented => "The server does not implement this method.",
        Code::Unavailable => "The service is unavailable, try again later.",
        Code::ResourceExhausted => "A quota or rate limit was hit, slow down and retry.",
        Code::FailedPrecondition => "The system is not in a state required for this call.",
        Code::AlreadyExists => "The resource already exists.",
        Code::Aborted => "The operation was aborted, usually due to a conflict; retry it.",
        Code::Internal | Code::Unknown | Code::DataLoss => "Check the server logs.",
        _ => return None,
    };
    Some(hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_is_preserved() {
        let err = Error::from_status(tonic::Status::not_found("no such user"));
        assert_eq!(err.kind(), ErrorKind::RemoteStatus);

        let Error::RemoteStatus(status) = &err else {
            panic!("expected a remote status");
        };
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no such user");
    }

    #[test]
    fn deadline_status_is_classified() {
        let err = Error::from_status(tonic::Status::deadline_exceeded("too slow"));
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn report_carries_status_hints() {
        let err = Error::from_status(tonic::Status::unauthenticated("missing token"));
        let report = ErrorReport::from(&err);

        assert_eq!(report.kind, ErrorKind::RemoteStatus);
        assert!(report.message.contains("missing token"));
        assert!(report.hints.iter().any(|h| h.contains("authorization metadata")));
    }

    #[test]
    fn keepalive_failures_are_fatal() {
        let err = Error::Transport {
            message: "transport error".into(),
            detail: Some("transport error: keep-alive timed out".into()),
        };
        assert!(err.is_connection_fatal());
        assert!(!Error::transport("error trying to connect").is_connection_fatal());
        assert!(!Error::Cancelled.is_connection_fatal());
    }

    #[test]
    fn socket_failures_under_a_call_are_fatal() {
        let dead = [
            std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            std::io::Error::new(std::io::ErrorKind::Other, "connection closed before message completed"),
        ];

        for io in dead {
            let text = io.to_string();
            let err = Error::from_status(tonic::Status::from_error(Box::new(io)));
            assert_eq!(err.kind(), ErrorKind::Transport, "{text}");
            assert!(err.is_connection_fatal(), "{text}");
        }

        // A stream reset by the server leaves the connection usable.
        let reset = Error::from_status(tonic::Status::internal("stream reset by peer"));
        assert!(!reset.is_connection_fatal());
    }
}
