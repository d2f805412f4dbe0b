//! # Fixture Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide gRPC server implementations
//! and a descriptor set for integration testing `spyglass-core` and the `spyglass` CLI.
//! It is not intended for production use.
//!
//! It bundles three groups of services:
//!
//! * `helloworld.Greeter`: the classic unary greeting service.
//! * `playground.Playground`: one method per call shape plus helpers for failures,
//!   deadlines, recursive types, optional fields and well-known types.
//! * `com.foo.UserService`, `com.bar.UserService`, `org.other.UserService`: services that
//!   share a terminal name and are only registered with the reflection service.
use std::net::SocketAddr;
use tonic::service::Routes;
use tonic::transport::Server;

mod greeter;
mod playground;

pub mod pb {
    pub mod helloworld {
        tonic::include_proto!("helloworld");
    }

    pub mod playground {
        tonic::include_proto!("playground");
    }
}

pub use greeter::GreeterService;
pub use pb::helloworld::greeter_server::GreeterServer;
pub use pb::playground::playground_server::PlaygroundServer;
pub use playground::PlaygroundService;

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

/// Builds the in-process routes used by most tests: reflection, greeter and playground.
pub fn routes() -> Routes {
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("Failed to setup Reflection Service");

    Routes::new(reflection)
        .add_service(GreeterServer::new(GreeterService))
        .add_service(PlaygroundServer::new(PlaygroundService))
}

/// Routes without the reflection service, for servers that do not advertise their schema.
pub fn routes_without_reflection() -> Routes {
    Routes::new(GreeterServer::new(GreeterService))
        .add_service(PlaygroundServer::new(PlaygroundService))
}

/// Spawns a loopback server hosting [`routes`] and returns its address (`127.0.0.1:<port>`).
pub async fn spawn_server() -> SocketAddr {
    spawn_with(routes()).await
}

/// Spawns a loopback server hosting the given routes.
pub async fn spawn_with(routes: Routes) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        Server::builder()
            .add_routes(routes)
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}
