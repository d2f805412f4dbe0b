use fixture_service::{FILE_DESCRIPTOR_SET, routes};
use prost_reflect::{DescriptorPool, MethodDescriptor};
use spyglass_core::invoker::{
    BufferLimits, CallOptions, CallSummary, RecvState, SendState, StreamEnd, StreamEvent,
};
use spyglass_core::schema::CallShape;
use spyglass_core::{Error, ErrorKind, Invoker, codec};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::service::Routes;

fn method(service: &str, name: &str) -> MethodDescriptor {
    let pool = DescriptorPool::decode(FILE_DESCRIPTOR_SET).expect("Failed to decode descriptors");
    pool.get_service_by_name(service)
        .and_then(|s| s.methods().find(|m| m.name() == name))
        .expect("Method not found in fixture descriptors")
}

fn playground(name: &str) -> MethodDescriptor {
    method("playground.Playground", name)
}

fn invoker() -> Invoker<Routes> {
    Invoker::new(routes())
}

fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn test_unary_call_propagates_metadata() {
    let headers = vec![
        ("x-trace".to_string(), "abc".to_string()),
        ("x-trace".to_string(), "def".to_string()),
    ];

    let response = invoker()
        .unary(
            &method("helloworld.Greeter", "SayHello"),
            r#"{"name": "Ada"}"#,
            &headers,
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(json(response.text())["message"], "Hello Ada");
    assert!(response.size > 0);

    let traces: Vec<_> = response
        .metadata
        .iter()
        .filter(|(k, _)| k == "x-trace")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(traces, ["abc", "def"]);
}

#[tokio::test]
async fn test_unary_round_trips_recursive_and_optional_fields() {
    let invoker = invoker();
    let cancel = CancellationToken::new();
    let options = CallOptions::default();

    let mirrored = invoker
        .unary(
            &playground("Mirror"),
            r#"{"value": 1, "left": {"value": 2, "left": {"value": 3}}}"#,
            &[],
            &options,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(
        json(mirrored.text()),
        json(r#"{"value": 1, "right": {"value": 2, "right": {"value": 3}}}"#)
    );

    // An explicit zero survives because the field tracks presence.
    let set = invoker
        .unary(&playground("Renew"), r#"{"ttl": 0}"#, &[], &options, &cancel)
        .await
        .unwrap();
    assert_eq!(json(set.text()), json(r#"{"ttl": 0}"#));

    let unset = invoker
        .unary(&playground("Renew"), r#"{"owner": "me"}"#, &[], &options, &cancel)
        .await
        .unwrap();
    assert_eq!(json(unset.text()), json(r#"{"owner": "me"}"#));
}

#[tokio::test]
async fn test_unary_echo_preserves_every_value() {
    let request = r#"{
        "big": "9007199254740993",
        "huge": "18446744073709551615",
        "color": "COLOR_GREEN",
        "counts": {"a": 1},
        "names_by_id": {"-4": "neg"},
        "number": 7,
        "created_at": "2024-05-01T10:00:00.5Z",
        "ttl": "1.5s",
        "nickname": "ada",
        "mask": "createdAt,namesById",
        "anything": {"nested": [1, "two", null, true]},
        "note": ""
    }"#;

    let response = invoker()
        .unary(
            &playground("Echo"),
            request,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let body = json(response.text());
    assert_eq!(body["big"], "9007199254740993");
    assert_eq!(body["huge"], "18446744073709551615");
    assert_eq!(body["color"], "COLOR_GREEN");
    assert_eq!(body["counts"]["a"], 1);
    assert_eq!(body["names_by_id"]["-4"], "neg");
    assert_eq!(body["number"], 7);
    assert_eq!(body["created_at"], "2024-05-01T10:00:00.500Z");
    assert_eq!(body["ttl"], "1.500s");
    assert_eq!(body["nickname"], "ada");
    assert_eq!(body["mask"], "createdAt,namesById");
    assert_eq!(body["anything"], json(r#"{"nested": [1.0, "two", null, true]}"#));
    assert_eq!(body["note"], "");
    assert!(body.get("small").is_none());
}

#[tokio::test]
async fn test_codec_errors_are_raised_before_sending() {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let invoker = invoker().with_completion(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let err = invoker
        .unary(
            &method("helloworld.Greeter", "SayHello"),
            r#"{"name": 5}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CodecType);
    assert!(err.to_string().contains("name"), "{err}");

    let err = invoker
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": -1}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::CodecRange);

    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_metadata_is_a_validation_error() {
    let headers = vec![("bad key".to_string(), "v".to_string())];

    let err = invoker()
        .unary(
            &method("helloworld.Greeter", "SayHello"),
            "{}",
            &headers,
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_remote_status_is_preserved() {
    let faults = Arc::new(AtomicUsize::new(0));
    let counter = faults.clone();
    let summaries: Arc<parking_lot::Mutex<Vec<CallSummary>>> = Default::default();
    let sink = summaries.clone();

    let invoker = invoker()
        .with_fault_sink(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .with_completion(Arc::new(move |summary| sink.lock().push(summary)));

    let err = invoker
        .unary(
            &playground("Fail"),
            r#"{"code": 5, "message": "no such thing"}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match &err {
        Error::RemoteStatus(status) => {
            assert_eq!(status.code(), Code::NotFound);
            assert_eq!(status.message(), "no such thing");
        }
        other => panic!("Expected RemoteStatus, got {other:?}"),
    }

    // A status from the server says nothing about the connection.
    assert_eq!(faults.load(Ordering::SeqCst), 0);

    let summaries = summaries.lock();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].method, "playground.Playground/Fail");
    assert_eq!(summaries[0].shape, CallShape::Unary);
    assert!(summaries[0].response.is_none());
    assert!(matches!(summaries[0].error, Some(Error::RemoteStatus(_))));
}

#[tokio::test]
async fn test_unary_deadline_exceeded() {
    let options = CallOptions::default().with_deadline(Duration::from_millis(50));

    let err = invoker()
        .unary(
            &playground("Sleep"),
            r#"{"millis": 5000}"#,
            &[],
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
}

#[tokio::test]
async fn test_unary_cancelled_by_caller() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = invoker()
        .unary(
            &playground("Sleep"),
            r#"{"millis": 5000}"#,
            &[],
            &CallOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_connection_scope_cancels_calls() {
    let scope = CancellationToken::new();
    let invoker = invoker().with_scope(scope.clone());

    let mut stream = invoker
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 1, "hold": true}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(matches!(stream.recv().await, StreamEvent::Message(_)));
    scope.cancel();

    assert!(matches!(stream.finished().await, StreamEnd::Cancelled));
    assert_eq!(stream.state(), RecvState::Errored);
}

#[tokio::test]
async fn test_server_stream_delivers_in_order() {
    let mut stream = invoker()
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 5}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    let mut seqs = Vec::new();
    let end = loop {
        match stream.recv().await {
            StreamEvent::Message(message) => {
                // proto3 omits the zero `seq` of the first tick.
                let tick = json(&message.text)["seq"].as_u64().unwrap_or(0);
                assert_eq!(tick, message.seq);
                seqs.push(message.seq);
            }
            StreamEvent::End(end) => break end,
        }
    };

    assert_eq!(seqs, [0, 1, 2, 3, 4]);
    assert!(matches!(end, StreamEnd::Completed { .. }));
    assert_eq!(stream.state(), RecvState::Ended);

    // The terminal is sticky.
    assert!(matches!(stream.recv().await, StreamEvent::End(StreamEnd::Completed { .. })));
}

#[tokio::test]
async fn test_server_stream_buffer_evicts_oldest_batch() {
    let stream = invoker()
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 1500}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(matches!(stream.finished().await, StreamEnd::Completed { .. }));

    let stats = stream.stats();
    assert_eq!(stats.total, 1500);
    assert_eq!(stats.visible, 900);
    assert!(stats.truncated);

    let messages = stream.messages();
    assert_eq!(messages.first().map(|m| m.seq), Some(600));
    assert_eq!(messages.last().map(|m| m.seq), Some(1499));
}

#[tokio::test]
async fn test_custom_buffer_limits() {
    let limits = BufferLimits {
        capacity: 10,
        evict_batch: 4,
    };
    let stream = invoker()
        .with_limits(limits)
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 25}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    stream.finished().await;

    // 25 pushes into 10 slots evicting 4 at a time leaves 9.
    let stats = stream.stats();
    assert_eq!((stats.visible, stats.total), (9, 25));
    assert_eq!(stream.messages()[0].seq, 16);
}

#[tokio::test]
async fn test_cancel_server_stream_mid_flight() {
    let mut stream = invoker()
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 500, "hold": true}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    for expected in 0..500 {
        match stream.recv().await {
            StreamEvent::Message(message) => assert_eq!(message.seq, expected),
            StreamEvent::End(end) => panic!("Stream ended early: {end:?}"),
        }
    }

    stream.cancel();

    assert!(matches!(stream.recv().await, StreamEvent::End(StreamEnd::Cancelled)));
    let stats = stream.stats();
    assert_eq!((stats.visible, stats.total), (500, 500));
    assert!(!stats.truncated);
    assert_eq!(stream.state(), RecvState::Errored);
}

#[tokio::test]
async fn test_server_stream_deadline_covers_whole_call() {
    let options = CallOptions::default().with_deadline(Duration::from_millis(100));

    let stream = invoker()
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 3, "hold": true}"#,
            &[],
            &options,
            &CancellationToken::new(),
        )
        .unwrap();

    match stream.finished().await {
        StreamEnd::Failed(err) => assert_eq!(err.kind(), ErrorKind::DeadlineExceeded),
        other => panic!("Expected a deadline failure, got {other:?}"),
    }
    assert_eq!(stream.stats().total, 3);
}

#[tokio::test]
async fn test_server_stream_as_stream() {
    use futures_util::StreamExt;

    let stream = invoker()
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 3}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    let items: Vec<_> = stream.into_stream().collect().await;
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(Result::is_ok));
}

#[tokio::test]
async fn test_server_stream_completion_summary() {
    let summaries: Arc<parking_lot::Mutex<Vec<CallSummary>>> = Default::default();
    let sink = summaries.clone();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = parking_lot::Mutex::new(Some(done_tx));

    let invoker = invoker().with_completion(Arc::new(move |summary| {
        sink.lock().push(summary);
        if let Some(tx) = done_tx.lock().take() {
            let _ = tx.send(());
        }
    }));

    let stream = invoker
        .server_streaming(
            &playground("Ticks"),
            r#"{"count": 2}"#,
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
    stream.finished().await;
    done_rx.await.unwrap();

    let summaries = summaries.lock();
    assert_eq!(summaries[0].shape, CallShape::ServerStreaming);
    assert_eq!(summaries[0].request, r#"{"count": 2}"#);
    assert!(summaries[0].error.is_none());
    assert_eq!(summaries[0].response.as_deref().map(|r| r.lines().count() > 1), Some(true));
}

#[tokio::test]
async fn test_client_stream_sums_messages() {
    let mut call = invoker()
        .client_streaming(
            &playground("Count"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(call.send_state(), SendState::Open);
    for n in 1..=3 {
        call.send(&format!(r#"{{"n": {n}}}"#)).await.unwrap();
    }

    let response = call.close_and_receive().await.unwrap();
    assert_eq!(json(response.text()), json(r#"{"total": 6, "count": 3}"#));
    assert_eq!(call.send_state(), SendState::Closed);

    // Same outcome again, and no more sends.
    let again = call.close_and_receive().await.unwrap();
    assert_eq!(again.text(), response.text());
    assert!(matches!(
        call.send(r#"{"n": 4}"#).await,
        Err(Error::SendAfterClose(SendState::Closed))
    ));
}

#[tokio::test]
async fn test_client_stream_with_no_messages() {
    let mut call = invoker()
        .client_streaming(
            &playground("Count"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    let response = call.close_and_receive().await.unwrap();
    assert_eq!(json(response.text()), json("{}"));
}

#[tokio::test]
async fn test_client_stream_rejects_bad_message_without_closing() {
    let mut call = invoker()
        .client_streaming(
            &playground("Count"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    let err = call.send(r#"{"n": "many"}"#).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CodecType);
    assert_eq!(call.send_state(), SendState::Open);

    call.send(r#"{"n": 2}"#).await.unwrap();
    let response = call.close_and_receive().await.unwrap();
    assert_eq!(json(response.text()), json(r#"{"total": 2, "count": 1}"#));
}

#[tokio::test]
async fn test_send_after_cancel() {
    let mut call = invoker()
        .client_streaming(
            &playground("Count"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    call.send(r#"{"n": 1}"#).await.unwrap();
    call.cancel();

    assert!(matches!(call.send(r#"{"n": 2}"#).await, Err(Error::SendAfterCancel)));
    assert!(matches!(call.close_and_receive().await, Err(Error::Cancelled)));
    assert_eq!(call.send_state(), SendState::Closed);
}

#[tokio::test]
async fn test_bidi_stream_echoes_and_half_closes() {
    let mut chat = invoker()
        .bidirectional(
            &playground("Chat"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    for text in ["hi", "there"] {
        chat.send(&format!(r#"{{"text": "{text}"}}"#)).await.unwrap();
        match chat.recv().await {
            StreamEvent::Message(message) => {
                assert_eq!(json(&message.text)["text"], format!("echo: {text}"));
            }
            StreamEvent::End(end) => panic!("Chat ended early: {end:?}"),
        }
    }

    chat.close_send();
    assert_eq!(chat.send_state(), SendState::HalfClosed);
    assert!(matches!(
        chat.send(r#"{"text": "late"}"#).await,
        Err(Error::SendAfterClose(_))
    ));

    // The server ends its side once ours is closed.
    assert!(matches!(chat.recv().await, StreamEvent::End(StreamEnd::Completed { .. })));
    assert_eq!(chat.send_state(), SendState::Closed);
    assert_eq!(chat.recv_state(), RecvState::Ended);
    assert_eq!(chat.stats().total, 2);
}

#[tokio::test]
async fn test_bidi_cancel() {
    let mut chat = invoker()
        .bidirectional(
            &playground("Chat"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    chat.send(r#"{"text": "one"}"#).await.unwrap();
    chat.cancel();

    assert!(matches!(chat.recv().await, StreamEvent::End(StreamEnd::Cancelled)));
    assert!(matches!(chat.send(r#"{"text": "two"}"#).await, Err(Error::SendAfterCancel)));
    assert_eq!(chat.send_state(), SendState::Closed);
}

#[tokio::test]
async fn test_split_messages_feeds_streaming_calls() {
    let mut call = invoker()
        .client_streaming(
            &playground("Count"),
            &[],
            &CallOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    for message in codec::split_messages(r#"[{"n": 10}, {"n": 20}]"#).unwrap() {
        call.send(&message).await.unwrap();
    }

    let response = call.close_and_receive().await.unwrap();
    assert_eq!(json(response.text()), json(r#"{"total": 30, "count": 2}"#));
}
