//! # Server Reflection
//!
//! This module contains the logic necessary to interact with the gRPC Server Reflection Protocol.
//!
//! It enables the client to query a server for its own Protobuf schema at runtime. The
//! message types come from the generated `grpc.reflection.v1` client shipped with
//! `tonic-reflection`.
pub mod client;
