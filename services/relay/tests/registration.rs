//! Handshake and registration contract: a failed catalog registration gets
//! exactly one `registration_failed` and a 1008 close, and nothing from that
//! session ever reaches a viewer.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use relay::config::RelayConfig;
use relay_protocol::*;
use relay_test_utils::{MockWsClient, ServerEvent};

#[tokio::test]
async fn failed_registration_closes_with_1008() {
    let backend = Backend::new();
    let failing = Arc::new(FailingCatalog::new());
    failing.fail_register.store(true, Ordering::SeqCst);
    let inst = start_instance(
        fast_config(),
        failing.clone(),
        backend.commands.clone(),
        backend.bus.clone(),
    )
    .await;

    let (mut viewer, _) = connect_viewer_session(&inst.url).await;
    viewer
        .send_message(&WsMessage::Subscribe(Subscribe {
            producer_id: None,
            monitor_id: None,
        }))
        .await
        .unwrap();

    let mut producer = MockWsClient::connect_producer(&inst.url, "prod-1").await.unwrap();
    producer
        .send_message(&producer_handshake("test-desktop", &["monitor_0"]))
        .await
        .unwrap();

    match producer.recv_event().await.unwrap() {
        ServerEvent::Message(WsMessage::RegistrationFailed(r)) => {
            assert_eq!(r.reason, "catalog registration failed");
        }
        other => panic!("expected registration_failed, got {other:?}"),
    }
    match producer.recv_event().await.unwrap() {
        ServerEvent::Closed { code, .. } => assert_eq!(code, Some(close::REGISTRATION_FAILED)),
        other => panic!("expected close frame, got {other:?}"),
    }

    // The rejected session never surfaced to viewers.
    assert!(viewer
        .recv_message_timeout(Duration::from_millis(300))
        .await
        .is_err());

    // Once the store recovers the same producer registers fine.
    failing.fail_register.store(false, Ordering::SeqCst);
    let _producer = register_producer(&inst.url, "prod-1", &["monitor_0"]).await;
    match viewer
        .recv_until(Duration::from_secs(1), |m| {
            matches!(m, WsMessage::ProducerConnected(_))
        })
        .await
        .unwrap()
    {
        WsMessage::ProducerConnected(c) => assert_eq!(c.producer_id, "prod-1"),
        other => panic!("expected producer_connected, got {other:?}"),
    }
}

#[tokio::test]
async fn non_handshake_first_message_is_rejected() {
    let backend = Backend::new();
    let inst = start_instance(
        fast_config(),
        backend.catalog.clone(),
        backend.commands.clone(),
        backend.bus.clone(),
    )
    .await;

    let mut producer = MockWsClient::connect_producer(&inst.url, "prod-1").await.unwrap();
    producer.send_message(&WsMessage::Heartbeat).await.unwrap();
    match producer.recv_event().await.unwrap() {
        ServerEvent::Message(WsMessage::RegistrationFailed(r)) => {
            assert_eq!(r.reason, "expected handshake");
        }
        other => panic!("expected registration_failed, got {other:?}"),
    }
    match producer.recv_event().await.unwrap() {
        ServerEvent::Closed { code, .. } => assert_eq!(code, Some(close::REGISTRATION_FAILED)),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_timeout_is_rejected() {
    let backend = Backend::new();
    let config = RelayConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let inst = start_instance(
        config,
        backend.catalog.clone(),
        backend.commands.clone(),
        backend.bus.clone(),
    )
    .await;

    let mut producer = MockWsClient::connect_producer(&inst.url, "prod-1").await.unwrap();
    // Say nothing; the relay gives up after the handshake window.
    match producer.recv_event().await.unwrap() {
        ServerEvent::Message(WsMessage::RegistrationFailed(r)) => {
            assert!(r.reason.contains("timeout"));
        }
        other => panic!("expected registration_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_messages_earn_errors_then_disconnect() {
    let backend = Backend::new();
    let config = RelayConfig {
        protocol_error_limit: 3,
        ..fast_config()
    };
    let inst = start_instance(
        config,
        backend.catalog.clone(),
        backend.commands.clone(),
        backend.bus.clone(),
    )
    .await;

    let mut producer = register_producer(&inst.url, "prod-1", &["monitor_0"]).await;

    // Stray garbage earns an error reply but keeps the session open.
    producer.send_raw_text("{not json").await.unwrap();
    match producer.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::PROTOCOL_ERROR),
        other => panic!("expected error, got {other:?}"),
    }
    producer.send_message(&WsMessage::Heartbeat).await.unwrap();
    producer
        .recv_until(Duration::from_secs(1), |m| {
            matches!(m, WsMessage::HeartbeatAck)
        })
        .await
        .unwrap();

    // Blowing past the limit closes the socket.
    for _ in 0..4 {
        producer.send_raw_text("{not json").await.unwrap();
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session survived repeated protocol errors"
        );
        match producer.recv_event().await {
            Ok(ServerEvent::Closed { reason, .. }) => {
                assert_eq!(reason.as_deref(), Some(close::REASON_PROTOCOL_ERRORS));
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}
