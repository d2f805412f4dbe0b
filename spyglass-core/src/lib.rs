//! # Spyglass Core
//!
//! `spyglass-core` is the engine behind the Spyglass gRPC explorer. It talks to any gRPC
//! server without compile-time knowledge of its Protobuf schema: schemas are discovered
//! through server reflection, requests are written as JSON text and transcoded on the fly,
//! and all four call shapes (unary, server streaming, client streaming, bidirectional
//! streaming) are driven through cancellable handles.
//!
//! ## Key Components
//!
//! * **[`Session`]:** The composition root used by front-ends. It wires the connection
//!   manager, schema cache, invoker, observable application state and persistence together.
//! * **[`ConnectionManager`]:** Owns at most one live channel and publishes every state transition.
//! * **[`SchemaCache`]:** Lazily resolves services, methods and messages via reflection and caches them
//!   per connection.
//! * **[`Invoker`]:** Executes calls of every shape, returning handles that can be cancelled.
//! * **[`codec`]:** JSON text <-> dynamic Protobuf message conversion with field-path diagnostics.
//! * **[`Storage`]:** Atomic JSON persistence for workspaces, recent endpoints and call history.
//!
//! ## Internal clients
//!
//! The low level clients are exposed as well, since they are useful on their own:
//!
//! * **[`GrpcClient`]:** A dynamic gRPC client exchanging `DynamicMessage` values.
//! * **[`ReflectionClient`]:** A `grpc.reflection.v1` client that resolves complete descriptor sets.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod grpc;
pub mod history;
pub mod invoker;
pub mod reflection;
pub mod schema;
pub mod session;
pub mod state;
pub mod storage;
pub mod workspace;

pub use config::Settings;
pub use connection::{
    Connection, ConnectionManager, ConnectionState, Endpoint, KeepAliveConfig, SecurityProfile,
};
pub use error::{Error, ErrorKind, ErrorReport};
pub use grpc::client::GrpcClient;
pub use history::{HistoryController, HistoryFilter};
pub use invoker::{
    BidiStream, CallOptions, ClientStream, Invoker, ServerStream, StreamEnd, StreamEvent,
    UnaryResponse,
};
pub use reflection::client::ReflectionClient;
pub use schema::SchemaCache;
pub use session::{CallOutcome, Session};
pub use state::AppState;
pub use storage::Storage;
pub use workspace::WorkspaceController;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Ordered list of metadata (header) entries. Duplicate keys are preserved in order.
pub type Metadata = Vec<(String, String)>;
