//! C6: viewer session.
//!
//! AwaitHandshake -> Subscribed -> Closed.  Inbound traffic is catalog
//! queries, subscription changes, commands, and frame acks; outbound is the
//! outbox the writer task drains (control losslessly, frames with drop-oldest
//! backpressure).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::StreamExt;
use relay_protocol::{
    close, error_codes, ErrorMessage, HandshakeAck, ProducerList, ProducerSummary, WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::outbox::ViewerOutbox;
use crate::registry::ViewerHandle;
use crate::router;
use crate::state::AppState;
use crate::ws_common::{
    recv_text_with_timeout, reject_registration, send_msg, spawn_outbox_writer, CloseIntent,
    StrikeCounter,
};

pub async fn handle_viewer_socket(
    mut socket: WebSocket,
    state: AppState,
    client_id: Option<String>,
) {
    let config = state.config.clone();

    let text = match recv_text_with_timeout(&mut socket, config.heartbeat_timeout).await {
        Ok(text) => text,
        Err(()) => {
            reject_registration(socket, "timeout waiting for handshake").await;
            return;
        }
    };
    match serde_json::from_str::<WsMessage>(&text) {
        Ok(WsMessage::Handshake(_)) => {}
        Ok(_) => {
            reject_registration(socket, "expected handshake").await;
            return;
        }
        Err(e) => {
            reject_registration(socket, &format!("invalid handshake JSON: {e}")).await;
            return;
        }
    }

    // Viewer ids are relay-assigned and never persisted.
    let viewer_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let ack = WsMessage::HandshakeAck(HandshakeAck {
        client_id: viewer_id.clone(),
        db_registered: false,
        debug: Some(serde_json::json!({ "instanceId": state.instance_id })),
    });
    if !send_msg(&mut socket, &ack).await {
        return;
    }
    info!(viewer_id = %viewer_id, "viewer connected");

    let session_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let close_intent = Arc::new(CloseIntent::default());
    let outbox = Arc::new(ViewerOutbox::new(
        config.frame_queue_depth,
        config.control_queue_limit,
    ));
    let handle = Arc::new(ViewerHandle::new(
        viewer_id.clone(),
        session_id,
        outbox.clone(),
        cancel.clone(),
    ));
    if let Some(displaced) = state.registry.insert_viewer(handle.clone()).await {
        displaced.shutdown();
    }

    let (sink, mut stream) = socket.split();
    let writer = spawn_outbox_writer(
        sink,
        outbox,
        config.write_deadline,
        cancel.clone(),
        close_intent.clone(),
    );

    let mut strikes = StrikeCounter::new(config.protocol_error_limit, config.protocol_error_window);
    let mut command_seq: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            inbound = tokio::time::timeout(config.heartbeat_timeout, stream.next()) => {
                match inbound {
                    Err(_) => {
                        close_intent.set(close::NORMAL, close::REASON_HEARTBEAT_TIMEOUT).await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(viewer_id = %viewer_id, error = %e, "websocket error");
                        break;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let over_limit = handle_viewer_message(
                            &state,
                            &handle,
                            &text,
                            &mut command_seq,
                            &mut strikes,
                        )
                        .await;
                        if over_limit {
                            warn!(viewer_id = %viewer_id, "too many protocol errors");
                            close_intent.set(close::NORMAL, close::REASON_PROTOCOL_ERRORS).await;
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    cancel.cancel();
    state
        .registry
        .remove_viewer_session(&viewer_id, session_id)
        .await;
    let _ = writer.await;
    info!(viewer_id = %viewer_id, "viewer session ended");
}

async fn handle_viewer_message(
    state: &AppState,
    handle: &Arc<ViewerHandle>,
    text: &str,
    command_seq: &mut u64,
    strikes: &mut StrikeCounter,
) -> bool {
    match serde_json::from_str::<WsMessage>(text) {
        Ok(WsMessage::ListProducers) => {
            send_producer_list(state, handle).await;
            false
        }
        Ok(WsMessage::Subscribe(s)) => {
            handle.subscribe(s.producer_id, s.monitor_id).await;
            false
        }
        Ok(WsMessage::Unsubscribe(u)) => {
            handle
                .unsubscribe(u.producer_id.as_deref(), u.monitor_id.as_deref())
                .await;
            false
        }
        Ok(WsMessage::FrameAck(ack)) => {
            router::route_frame_ack(state, &handle.viewer_id, ack).await;
            false
        }
        // Keepalive for viewers with nothing to say.
        Ok(WsMessage::Heartbeat) => {
            handle.send_control(WsMessage::HeartbeatAck).await;
            false
        }
        Ok(msg) => {
            if let Some((kind, request)) = msg.as_command() {
                *command_seq += 1;
                let idempotency_key = format!(
                    "{}:{}:{}",
                    handle.viewer_id,
                    command_seq,
                    Utc::now().timestamp_millis()
                );
                router::route_command(state, handle, kind, request, idempotency_key).await;
                false
            } else {
                strike(strikes, handle, "unexpected message kind for a viewer").await
            }
        }
        Err(e) => strike(strikes, handle, &format!("invalid JSON: {e}")).await,
    }
}

async fn send_producer_list(state: &AppState, handle: &Arc<ViewerHandle>) {
    match state.catalog.list_active().await {
        Ok(records) => {
            let local = state.registry.producer_ids().await;
            let now = Utc::now();
            let liveness = state.config.liveness_window_chrono();
            let producers = records
                .into_iter()
                .map(|r| {
                    // Connected means: live socket on this instance, or a
                    // fresh enough catalog row (socket on some other one).
                    let connected = local.contains(&r.producer_id)
                        || now.signed_duration_since(r.updated_at) < liveness;
                    ProducerSummary {
                        id: r.producer_id,
                        name: r.display_name,
                        monitors: r.monitors,
                        connected,
                        streaming: r.is_streaming,
                    }
                })
                .collect();
            handle
                .send_control(WsMessage::ProducerList(ProducerList { producers }))
                .await;
        }
        Err(e) => {
            error!(error = %e, "catalog list failed");
            handle
                .send_control(WsMessage::Error(ErrorMessage {
                    code: error_codes::INTERNAL_ERROR.to_owned(),
                    message: "catalog unavailable".to_owned(),
                    retryable: true,
                }))
                .await;
        }
    }
}

async fn strike(strikes: &mut StrikeCounter, handle: &Arc<ViewerHandle>, reason: &str) -> bool {
    handle
        .send_control(WsMessage::Error(ErrorMessage {
            code: error_codes::PROTOCOL_ERROR.to_owned(),
            message: reason.to_owned(),
            retryable: false,
        }))
        .await;
    strikes.strike()
}
