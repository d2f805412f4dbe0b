use fixture_service::{FILE_DESCRIPTOR_SET, routes_without_reflection};
use prost_reflect::DescriptorPool;
use spyglass_core::reflection::client::{ReflectionClient, ReflectionResolveError};
use tonic::Code;
use tonic_reflection::server::v1::{ServerReflection, ServerReflectionServer};

/// A client talking straight to an in-process reflection service, no network involved.
fn fixture_client() -> ReflectionClient<ServerReflectionServer<impl ServerReflection>> {
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap();

    ReflectionClient::new(reflection)
}

fn pool_of(set: prost_types::FileDescriptorSet) -> DescriptorPool {
    DescriptorPool::from_file_descriptor_set(set).unwrap()
}

#[tokio::test]
async fn symbol_lookup_brings_the_whole_import_graph() {
    let set = fixture_client()
        .file_descriptor_set_by_symbol("playground.Playground")
        .await
        .unwrap();

    let names: Vec<_> = set.file.iter().filter_map(|f| f.name.as_deref()).collect();
    assert!(names.contains(&"playground.proto"));
    assert!(names.contains(&"google/protobuf/timestamp.proto"));
    assert!(names.contains(&"google/protobuf/wrappers.proto"));

    let pool = pool_of(set);
    let playground = pool.get_service_by_name("playground.Playground").unwrap();
    let shape = |name: &str| {
        let method = playground.methods().find(|m| m.name() == name).unwrap();
        (method.is_client_streaming(), method.is_server_streaming())
    };

    assert_eq!(shape("Echo"), (false, false));
    assert_eq!(shape("Ticks"), (false, true));
    assert_eq!(shape("Count"), (true, false));
    assert_eq!(shape("Chat"), (true, true));
    assert!(pool.get_message_by_name("google.protobuf.Struct").is_some());
}

#[tokio::test]
async fn every_file_is_returned_once() {
    let set = fixture_client()
        .file_descriptor_set_by_symbol("playground.Playground")
        .await
        .unwrap();

    let mut names: Vec<_> = set.file.iter().filter_map(|f| f.name.clone()).collect();
    let total = names.len();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), total);
}

#[tokio::test]
async fn filename_lookup() {
    let pool = pool_of(
        fixture_client()
            .file_descriptor_set_by_filename("greeter.proto")
            .await
            .unwrap(),
    );

    assert!(pool.get_service_by_name("helloworld.Greeter").is_some());
    assert!(pool.get_service_by_name("playground.Playground").is_none());
}

#[tokio::test]
async fn lists_same_named_services_from_different_packages() {
    let services = fixture_client().list_services().await.unwrap();

    for expected in [
        "helloworld.Greeter",
        "com.foo.UserService",
        "com.bar.UserService",
        "org.other.UserService",
    ] {
        assert!(
            services.iter().any(|s| s == expected),
            "{expected} missing from {services:?}"
        );
    }
}

#[tokio::test]
async fn unknown_symbol_is_not_found() {
    let err = fixture_client()
        .file_descriptor_set_by_symbol("nowhere.Missing")
        .await
        .unwrap_err();

    match err {
        ReflectionResolveError::ServerStreamFailure(status) => {
            assert_eq!(status.code(), Code::NotFound)
        }
        other => panic!("unknown symbol reported as {other:?}"),
    }
}

#[tokio::test]
async fn server_without_reflection_fails_to_open_the_stream() {
    let err = ReflectionClient::new(routes_without_reflection())
        .list_services()
        .await
        .unwrap_err();

    match err {
        ReflectionResolveError::ServerStreamInitFailed(status) => {
            assert_eq!(status.code(), Code::Unimplemented)
        }
        other => panic!("missing reflection reported as {other:?}"),
    }
}
