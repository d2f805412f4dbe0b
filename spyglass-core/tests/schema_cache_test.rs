use fixture_service::{routes, routes_without_reflection};
use spyglass_core::schema::{
    CallShape, Cardinality, Descriptor, FieldKind, SchemaCache, SchemaError,
};
use spyglass_core::{Error, ErrorKind};

#[tokio::test]
async fn test_list_services_is_sorted_and_complete() {
    let cache = SchemaCache::new(routes());

    let services = cache.list_services().await.unwrap();

    let mut sorted = services.clone();
    sorted.sort();
    assert_eq!(services, sorted);

    for expected in [
        "com.bar.UserService",
        "com.foo.UserService",
        "helloworld.Greeter",
        "org.other.UserService",
        "playground.Playground",
    ] {
        assert!(
            services.iter().any(|s| s == expected),
            "missing {expected} in {services:?}"
        );
    }
}

#[tokio::test]
async fn test_load_services_disambiguates_display_names() {
    let cache = SchemaCache::new(routes());

    let services = cache.load_services().await.unwrap();
    let label = |full_name: &str| {
        services
            .iter()
            .find(|s| s.full_name == full_name)
            .map(|s| s.display_name.clone())
            .unwrap()
    };

    assert_eq!(label("com.foo.UserService"), "foo.UserService");
    assert_eq!(label("com.bar.UserService"), "bar.UserService");
    assert_eq!(label("org.other.UserService"), "other.UserService");
    assert_eq!(label("helloworld.Greeter"), "Greeter");
}

#[tokio::test]
async fn test_resolve_service_lists_methods_by_name() {
    let cache = SchemaCache::new(routes());

    let service = cache.resolve_service("playground.Playground").await.unwrap();

    assert!(service.resolution_error.is_none());
    let names: Vec<_> = service.methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(
        names,
        ["Chat", "Count", "Echo", "Fail", "Mirror", "Renew", "Sleep", "Ticks"]
    );

    let shape = |name: &str| service.method(name).unwrap().shape();
    assert_eq!(shape("Echo"), CallShape::Unary);
    assert_eq!(shape("Ticks"), CallShape::ServerStreaming);
    assert_eq!(shape("Count"), CallShape::ClientStreaming);
    assert_eq!(shape("Chat"), CallShape::Bidirectional);

    assert_eq!(
        service.method("Count").unwrap().path(),
        "playground.Playground/Count"
    );
}

#[tokio::test]
async fn test_unknown_service_is_reported_but_not_fatal() {
    let cache = SchemaCache::new(routes());

    let service = cache.resolve_service("no.such.Service").await.unwrap();

    assert!(service.methods.is_empty());
    assert!(service.resolution_error.is_some());
    assert_eq!(service.display_name, "Service");

    // The connection stays usable.
    let greeter = cache.resolve_service("helloworld.Greeter").await.unwrap();
    assert!(greeter.method("SayHello").is_some());
}

#[tokio::test]
async fn test_resolve_method_not_found() {
    let cache = SchemaCache::new(routes());

    let err = cache
        .resolve_method("helloworld.Greeter", "SayGoodbye")
        .await
        .unwrap_err();

    match err {
        SchemaError::MethodNotFound { service, method } => {
            assert_eq!(service, "helloworld.Greeter");
            assert_eq!(method, "SayGoodbye");
        }
        other => panic!("Expected MethodNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resolve_method_includes_messages() {
    let cache = SchemaCache::new(routes());

    let method = cache
        .resolve_method("playground.Playground", "Chat")
        .await
        .unwrap();

    assert_eq!(method.info.shape(), CallShape::Bidirectional);
    assert_eq!(method.input.full_name, "playground.ChatMessage");
    assert_eq!(method.output.full_name, "playground.ChatMessage");
    assert_eq!(method.descriptor.name(), "Chat");
}

#[tokio::test]
async fn test_server_without_reflection_is_fatal() {
    let cache = SchemaCache::new(routes_without_reflection());

    let err = cache.list_services().await.unwrap_err();

    assert!(
        matches!(err, SchemaError::ReflectionUnavailable(_)),
        "Expected ReflectionUnavailable, got {err:?}"
    );
    assert!(err.is_fatal());
    assert_eq!(Error::from(err).kind(), ErrorKind::ReflectionUnavailable);

    let err = cache.resolve_service("helloworld.Greeter").await.unwrap_err();
    assert!(matches!(err, SchemaError::ReflectionUnavailable(_)));
}

#[tokio::test]
async fn test_recursive_message_info_is_finite() {
    let cache = SchemaCache::new(routes());

    let tree = cache.resolve_message("playground.TreeNode").await.unwrap();

    let left = tree.field("left").unwrap();
    assert_eq!(left.kind.message_name(), Some("playground.TreeNode"));
    assert_eq!(left.cardinality, Cardinality::Singular);
    assert_eq!(tree.fields.len(), 3);
}

#[tokio::test]
async fn test_message_info_reports_presence_and_oneofs() {
    let cache = SchemaCache::new(routes());

    let lease = cache.resolve_message("playground.Lease").await.unwrap();
    let ttl = lease.field("ttl").unwrap();
    assert!(ttl.presence);
    assert_eq!(ttl.cardinality, Cardinality::Optional);
    assert_eq!(ttl.oneof, None);
    assert!(!lease.field("owner").unwrap().presence);
    assert!(lease.oneofs.is_empty());

    let sample = cache.resolve_message("playground.Sample").await.unwrap();
    assert_eq!(sample.oneofs.len(), 1);
    assert_eq!(sample.oneofs[0].name, "choice");
    assert_eq!(sample.oneofs[0].fields, ["text", "number", "node"]);
    assert_eq!(sample.field("number").unwrap().oneof.as_deref(), Some("choice"));

    let counts = sample.field("counts").unwrap();
    assert_eq!(counts.cardinality, Cardinality::Map);
    assert_eq!(
        counts.kind,
        FieldKind::Map {
            key: Box::new(FieldKind::String),
            value: Box::new(FieldKind::Int32),
        }
    );
    assert_eq!(
        sample.field("color").unwrap().kind,
        FieldKind::Enum("playground.Color".to_string())
    );
}

#[tokio::test]
async fn test_describe_symbol_kinds() {
    let cache = SchemaCache::new(routes());

    let service = cache.describe_symbol("helloworld.Greeter").await.unwrap();
    assert!(matches!(service, Descriptor::ServiceDescriptor(_)));
    assert_eq!(service.package_name(), "helloworld");

    let message = cache.describe_symbol("playground.Sample").await.unwrap();
    assert!(matches!(message, Descriptor::MessageDescriptor(_)));
    assert_eq!(message.name(), "Sample");

    // Already merged with the file of `playground.Sample`.
    let color = cache.describe_symbol("playground.Color").await.unwrap();
    assert!(matches!(color, Descriptor::EnumDescriptor(_)));
    assert_eq!(color.full_name(), "playground.Color");

    let err = cache.describe_symbol("playground.Missing").await.unwrap_err();
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_message_template_stops_at_recursion() {
    let cache = SchemaCache::new(routes());

    let template = cache.message_template("playground.Sample").await.unwrap();

    assert_eq!(template["small"], 0);
    assert_eq!(template["big"], "0");
    assert_eq!(template["color"], "COLOR_UNSPECIFIED");
    assert_eq!(template["tags"], serde_json::json!([]));
    assert_eq!(template["created_at"], "1970-01-01T00:00:00Z");
    assert_eq!(template["ttl"], "0s");
    assert_eq!(template["tree"]["left"], serde_json::json!({}));

    // Only the first member of the oneof is offered.
    assert!(template.get("text").is_some());
    assert!(template.get("number").is_none());
    assert!(template.get("node").is_none());
}

#[tokio::test]
async fn test_pool_accumulates_fetched_files() {
    let cache = SchemaCache::new(routes());
    assert!(cache.pool().get_service_by_name("helloworld.Greeter").is_none());

    cache.resolve_service("helloworld.Greeter").await.unwrap();
    cache.resolve_service("playground.Playground").await.unwrap();

    let pool = cache.pool();
    assert!(pool.get_service_by_name("helloworld.Greeter").is_some());
    assert!(pool.get_message_by_name("playground.TreeNode").is_some());
    assert!(pool.get_message_by_name("google.protobuf.Timestamp").is_some());
}
