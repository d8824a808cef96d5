//! Hub client behavior against an in-memory transport.

use lingocall::signaling::{ConnectionStatus, ServerEvent, SignalingClient};
use lingocall::transport::mock::{MockHandle, MockTransportFactory};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const HUB_URL: &str = "wss://example.test/hubs/call";
const TOKEN: &str = "test-token";

async fn connected_client() -> (Arc<SignalingClient>, Arc<MockTransportFactory>, MockHandle) {
    let factory = MockTransportFactory::new();
    let client = SignalingClient::new(factory.clone());
    client.connect(HUB_URL, TOKEN).await.expect("connect failed");
    let handle = factory.last_handle().expect("no transport created");
    (client, factory, handle)
}

/// Polls until the most recent transport has sent an invocation with the
/// given target, or panics after a second.
async fn wait_for_invocation(handle: &MockHandle, target: &str) {
    for _ in 0..100 {
        if handle
            .transport
            .sent_invocations()
            .iter()
            .any(|(t, _)| t == target)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("invocation {target} never sent");
}

#[tokio::test]
async fn test_handshake_sent_on_connect() {
    let (_client, _factory, handle) = connected_client().await;
    let frames = handle.transport.sent_frames();
    assert_eq!(frames.len(), 1);
    let v: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(v["protocol"], "json");
    assert_eq!(v["version"], 1);
}

#[tokio::test]
async fn test_access_token_carried_in_dial_url() {
    let (_client, factory, handle) = connected_client().await;
    assert_eq!(
        factory.last_url().as_deref(),
        Some("wss://example.test/hubs/call?access_token=test-token")
    );

    // Reconnects reuse the authenticated URL.
    handle.push_disconnect().await;
    for _ in 0..200 {
        if factory.connection_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(factory.connection_count(), 2);
    assert!(
        factory
            .last_url()
            .is_some_and(|url| url.ends_with("access_token=test-token"))
    );
}

#[tokio::test]
async fn test_connection_is_shared_and_refcounted() {
    let (client, factory, handle) = connected_client().await;

    // Second subscriber joins the existing connection.
    client.connect(HUB_URL, TOKEN).await.unwrap();
    assert_eq!(factory.connection_count(), 1);

    // First detach keeps the socket up.
    client.disconnect().await;
    assert!(!handle.transport.is_disconnected());
    assert!(client.is_connected());

    // Last detach tears it down.
    client.disconnect().await;
    assert!(handle.transport.is_disconnected());
    let status = client.status();
    assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_invoke_sends_invocation_frame() {
    let (client, _factory, handle) = connected_client().await;
    client
        .invoke("JoinCallSession", vec![json!("call-1")])
        .await;

    let invocations = handle.transport.sent_invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].0, "JoinCallSession");
    assert_eq!(invocations[0].1, vec![json!("call-1")]);
}

#[tokio::test]
async fn test_invoke_while_disconnected_is_dropped() {
    let factory = MockTransportFactory::new();
    let client = SignalingClient::new(factory);
    // Must not panic or error.
    client
        .invoke("SendIceCandidate", vec![json!("call-1"), json!({})])
        .await;
}

#[tokio::test]
async fn test_lifecycle_event_delivered() {
    let (client, _factory, handle) = connected_client().await;
    let mut events = client.take_events().expect("event stream already taken");
    assert!(client.take_events().is_none(), "stream must be single-take");

    handle
        .push_invocation(
            "CallAccepted",
            vec![json!({"callId": "call-7"})],
        )
        .await;

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out")
        .expect("stream closed");
    match event {
        ServerEvent::Accepted { call_id } => assert_eq!(call_id, "call-7"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_event_targets_are_case_insensitive() {
    let (client, _factory, handle) = connected_client().await;
    let mut events = client.take_events().unwrap();

    handle
        .push_invocation("callrejected", vec![json!({"CallId": "call-2"})])
        .await;

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ServerEvent::Rejected { call_id } if call_id == "call-2"));
}

#[tokio::test]
async fn test_offers_buffer_until_handler_attaches() {
    let (client, _factory, handle) = connected_client().await;

    for i in 0..3 {
        handle
            .push_invocation("ReceiveOffer", vec![json!(format!("sdp-{i}"))])
            .await;
    }
    // Give the read loop time to buffer them.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_remote_offer(move |sdp| {
        let _ = tx.send(sdp);
    });

    for i in 0..3 {
        let sdp = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(sdp, format!("sdp-{i}"), "buffered offers must replay in order");
    }

    // Later offers flow straight through.
    handle
        .push_invocation("ReceiveOffer", vec![json!("sdp-live")])
        .await;
    let sdp = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sdp, "sdp-live");
}

#[tokio::test]
async fn test_malformed_frames_do_not_kill_the_connection() {
    let (client, _factory, handle) = connected_client().await;
    let mut events = client.take_events().unwrap();

    handle.push_frame("this is not json").await;
    handle.push_invocation("NoSuchEvent", vec![]).await;
    handle
        .push_invocation("CallEnded", vec![json!({"callId": "call-3", "timestamp": "2026-08-30T12:00:00Z"})])
        .await;

    // The well-formed event after the garbage still arrives.
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ServerEvent::Ended(p) if p.call_id == "call-3"));
}

#[tokio::test]
async fn test_reconnects_after_transport_drop() {
    let (client, factory, handle) = connected_client().await;
    let mut status = client.status();

    handle.push_disconnect().await;

    // First reconnect attempt has no delay; wait for the second dial.
    for _ in 0..200 {
        if factory.connection_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(factory.connection_count(), 2, "no reconnect happened");

    timeout(
        Duration::from_secs(2),
        status.wait_for(|s| *s == ConnectionStatus::Connected),
    )
    .await
    .expect("never reconnected")
    .expect("status channel closed");

    // The new transport carries traffic.
    client.invoke("NotifyCallActive", vec![json!("call-9")]).await;
    let new_handle = factory.last_handle().unwrap();
    wait_for_invocation(&new_handle, "NotifyCallActive").await;
}

#[tokio::test]
async fn test_no_reconnect_after_explicit_disconnect() {
    let (client, factory, _handle) = connected_client().await;
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(factory.connection_count(), 1);
    assert_eq!(*client.status().borrow(), ConnectionStatus::Disconnected);
}
