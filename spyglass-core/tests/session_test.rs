use fixture_service::{routes_without_reflection, spawn_server, spawn_with};
use spyglass_core::storage::CallStatus;
use spyglass_core::{
    CallOutcome, Endpoint, Error, ErrorKind, HistoryFilter, Session, Settings, StreamEnd,
};
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn open(dir: &TempDir) -> Session {
    Session::open(Settings::with_data_dir(dir.path())).await
}

fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::plaintext(addr.to_string()).unwrap()
}

fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn test_connect_loads_services_and_remembers_endpoint() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let addr = spawn_server().await;

    let services = session
        .connect(endpoint(addr), &CancellationToken::new())
        .await
        .unwrap();

    assert!(services.iter().any(|s| s.full_name == "helloworld.Greeter"));
    assert_eq!(session.state().services.get(), services);
    assert!(session.state().connected.get());
    assert_eq!(session.state().endpoint.get(), Some(endpoint(addr)));
    assert_eq!(session.recents().await, [endpoint(addr)]);
}

#[tokio::test]
async fn test_select_and_send_unary() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let cancel = CancellationToken::new();
    session
        .connect(endpoint(spawn_server().await), &cancel)
        .await
        .unwrap();

    session.select_service("helloworld.Greeter").await.unwrap();
    let method = session.select_method("SayHello").await.unwrap();
    assert_eq!(method.info.path(), "helloworld.Greeter/SayHello");

    // The empty editor was pre-filled from the input type.
    assert_eq!(json(&session.state().request.get().body), json(r#"{"name": ""}"#));

    session.state().set_request_body(r#"{"name": "Ada"}"#);
    session
        .state()
        .set_request_metadata(vec![("x-user".to_string(), "ada".to_string())]);

    let outcome = session.send(&cancel).await.unwrap();
    let CallOutcome::Unary(response) = outcome else {
        panic!("SayHello is unary");
    };
    assert_eq!(json(response.text())["message"], "Hello Ada");

    let published = session.state().response.get();
    assert!(!published.loading);
    assert!(published.error.is_none());
    assert_eq!(json(&published.body)["message"], "Hello Ada");
    assert!(published.metadata.iter().any(|(k, v)| k == "x-user" && v == "ada"));

    let history = session.history().list(&HistoryFilter::default());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].method, "helloworld.Greeter/SayHello");
    assert_eq!(history[0].status, CallStatus::Success);
    assert_eq!(history[0].request_metadata, [("x-user".to_string(), "ada".to_string())]);
}

#[tokio::test]
async fn test_select_method_keeps_an_edited_body() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    session
        .connect(endpoint(spawn_server().await), &CancellationToken::new())
        .await
        .unwrap();

    session.state().set_request_body(r#"{"name": "kept"}"#);
    session.select_service("helloworld.Greeter").await.unwrap();
    session.select_method("SayHello").await.unwrap();

    assert_eq!(session.state().request.get().body, r#"{"name": "kept"}"#);
}

#[tokio::test]
async fn test_send_without_selection_is_rejected() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;

    let err = session.send(&CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, Error::Validation(_)));

    session.state().selected_service.set(Some("helloworld.Greeter".into()));
    session.state().selected_method.set(Some("SayHello".into()));
    let err = session.send(&CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn test_remote_failure_is_published() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let cancel = CancellationToken::new();
    session
        .connect(endpoint(spawn_server().await), &cancel)
        .await
        .unwrap();

    session.select_service("playground.Playground").await.unwrap();
    session.select_method("Fail").await.unwrap();
    session
        .state()
        .set_request_body(r#"{"code": 9, "message": "not now"}"#);

    let err = session.send(&cancel).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::RemoteStatus);

    let report = session.state().response.get().error.unwrap();
    assert_eq!(report.kind, ErrorKind::RemoteStatus);

    let failures = session
        .history()
        .list(&HistoryFilter::default().with_status(CallStatus::Error));
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.as_deref().unwrap().contains("not now"));

    // Still connected.
    assert!(session.manager().state().is_connected());
}

#[tokio::test]
async fn test_server_stream_through_session() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let cancel = CancellationToken::new();
    session
        .connect(endpoint(spawn_server().await), &cancel)
        .await
        .unwrap();

    session.select_service("playground.Playground").await.unwrap();
    session.select_method("Ticks").await.unwrap();
    session.state().set_request_body(r#"{"count": 3}"#);

    let mut response = session.state().response.subscribe();
    let CallOutcome::ServerStream(stream) = session.send(&cancel).await.unwrap() else {
        panic!("Ticks is server streaming");
    };
    assert!(matches!(stream.finished().await, StreamEnd::Completed { .. }));

    response.wait_for(|r| !r.loading).await.unwrap();
    assert!(session.state().response.get().body.contains("\"seq\": 2"));
    session
        .state()
        .stream_progress
        .subscribe()
        .wait_for(|progress| progress.is_some_and(|p| p.total == 3))
        .await
        .unwrap();

    let history = session.history().list(&HistoryFilter::query("Ticks"));
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_client_stream_through_session() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let cancel = CancellationToken::new();
    session
        .connect(endpoint(spawn_server().await), &cancel)
        .await
        .unwrap();

    session.select_service("playground.Playground").await.unwrap();
    session.select_method("Count").await.unwrap();

    let CallOutcome::ClientStream(mut call) = session.send(&cancel).await.unwrap() else {
        panic!("Count is client streaming");
    };
    call.send(r#"{"n": 4}"#).await.unwrap();
    call.send(r#"{"n": 5}"#).await.unwrap();
    let sum = call.close_and_receive().await.unwrap();

    assert_eq!(json(sum.text()), json(r#"{"total": 9, "count": 2}"#));
}

#[tokio::test]
async fn test_disconnect_clears_connection_state() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    session
        .connect(endpoint(spawn_server().await), &CancellationToken::new())
        .await
        .unwrap();
    session.select_service("helloworld.Greeter").await.unwrap();
    session.state().set_request_body("{}");

    session.disconnect().await;

    assert!(!session.state().connected.get());
    assert!(session.state().services.get().is_empty());
    assert_eq!(session.state().selected_service.get(), None);
    assert_eq!(session.state().request.get().body, "{}");
    assert!(matches!(session.schema().err(), Some(Error::NotConnected)));
}

#[tokio::test]
async fn test_server_without_reflection() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let addr = spawn_with(routes_without_reflection()).await;

    let err = session
        .connect(endpoint(addr), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ReflectionUnavailable);
    // The channel itself is fine.
    assert!(session.manager().state().is_connected());
}

#[tokio::test]
async fn test_replay_restores_request_without_sending() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let cancel = CancellationToken::new();
    let addr = spawn_server().await;
    session.connect(endpoint(addr), &cancel).await.unwrap();

    session.select_service("helloworld.Greeter").await.unwrap();
    session.select_method("SayHello").await.unwrap();
    session.state().set_request_body(r#"{"name": "first"}"#);
    session.send(&cancel).await.unwrap();

    session.state().set_request_body(r#"{"name": "second"}"#);
    session.state().selected_method.set(None);

    let id = session.history().list(&HistoryFilter::default())[0].id;
    let record = session.replay(id).unwrap();

    assert_eq!(record.request, r#"{"name": "first"}"#);
    assert_eq!(session.state().request.get().body, r#"{"name": "first"}"#);
    assert_eq!(session.state().selected_service.get().as_deref(), Some("helloworld.Greeter"));
    assert_eq!(session.state().selected_method.get().as_deref(), Some("SayHello"));
    assert_eq!(session.history().len(), 1);

    assert!(session.replay(uuid::Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn test_history_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    {
        let session = open(&dir).await;
        session
            .connect(endpoint(spawn_server().await), &cancel)
            .await
            .unwrap();
        session.select_service("helloworld.Greeter").await.unwrap();
        session.select_method("SayHello").await.unwrap();
        session.send(&cancel).await.unwrap();
        session.history().persist().await;
    }

    let reopened = open(&dir).await;
    let history = reopened.history().list(&HistoryFilter::default());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].method, "helloworld.Greeter/SayHello");
}

#[tokio::test]
async fn test_workspace_round_trip() {
    let dir = TempDir::new().unwrap();
    let session = open(&dir).await;
    let addr = spawn_server().await;
    session
        .connect(endpoint(addr), &CancellationToken::new())
        .await
        .unwrap();
    session.select_service("helloworld.Greeter").await.unwrap();
    session.select_method("SayHello").await.unwrap();
    session.state().set_request_body(r#"{"name": "saved"}"#);

    session.save_workspace("greeting", false).await.unwrap();
    let err = session.save_workspace("greeting", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    session.save_workspace("greeting", true).await.unwrap();

    session.disconnect().await;
    session.state().set_request_body("");

    let workspace = session.load_workspace("greeting").await.unwrap();
    assert_eq!(workspace.endpoint, Some(endpoint(addr)));
    assert_eq!(session.state().request.get().body, r#"{"name": "saved"}"#);
    assert_eq!(session.state().selected_method.get().as_deref(), Some("SayHello"));

    assert_eq!(session.list_workspaces().await.unwrap(), ["greeting"]);
    session.delete_workspace("greeting").await.unwrap();
    assert!(session.list_workspaces().await.unwrap().is_empty());

    let err = session.load_workspace("greeting").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
