//! C5: producer ("desktop agent") session.
//!
//! AwaitHandshake -> Registered -> {Idle, Streaming} -> Closed.  Registration
//! must commit to the catalog before the session counts; the reply is either
//! `handshake_ack` or `registration_failed` followed by a 1008 close.  After
//! that a reader loop and a writer task share the socket, separated by a
//! bounded channel.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use relay_protocol::{
    close, error_codes, CommandStatus, ErrorMessage, HandshakeAck, PendingCommands, WsMessage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::CatalogChange;
use crate::registry::ProducerHandle;
use crate::router;
use crate::state::AppState;
use crate::store::ProducerRecord;
use crate::ws_common::{
    recv_text_with_timeout, reject_registration, send_msg, spawn_message_writer, CloseIntent,
    StrikeCounter,
};

pub async fn handle_producer_socket(
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
    let hello = match serde_json::from_str::<WsMessage>(&text) {
        Ok(WsMessage::Handshake(h)) => h,
        Ok(_) => {
            reject_registration(socket, "expected handshake").await;
            return;
        }
        Err(e) => {
            reject_registration(socket, &format!("invalid handshake JSON: {e}")).await;
            return;
        }
    };

    // The producer picks its own id (stable across reconnects); we only mint
    // one when the query parameter is absent.
    let producer_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let record = ProducerRecord::fresh(&producer_id, &hello.client_info, state.instance_id);
    let monitors = record.monitors.clone();
    if let Err(e) = state.catalog.register(record).await {
        error!(error = %e, producer_id = %producer_id, "catalog registration failed");
        reject_registration(socket, "catalog registration failed").await;
        return;
    }

    let ack = WsMessage::HandshakeAck(HandshakeAck {
        client_id: producer_id.clone(),
        db_registered: true,
        debug: Some(serde_json::json!({ "instanceId": state.instance_id })),
    });
    if !send_msg(&mut socket, &ack).await {
        let _ = state
            .catalog
            .unregister(&producer_id, Some(state.instance_id))
            .await;
        return;
    }
    info!(producer_id = %producer_id, "producer registered");

    let session_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let close_intent = Arc::new(CloseIntent::default());
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let handle = Arc::new(ProducerHandle::new(
        producer_id.clone(),
        session_id,
        outbound_tx,
        cancel.clone(),
    ));
    if let Some(displaced) = state.registry.insert_producer(handle.clone()).await {
        // Same producer_id reconnected to this instance; the old session
        // folds on its next wakeup.
        displaced.shutdown();
    }

    router::announce_catalog_change(
        &state,
        &producer_id,
        CatalogChange::Connected { monitors },
    )
    .await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_message_writer(
        sink,
        outbound_rx,
        config.write_deadline,
        cancel.clone(),
        close_intent.clone(),
    );

    let mut strikes = StrikeCounter::new(config.protocol_error_limit, config.protocol_error_window);
    let mut streaming = false;
    let mut last_frame_at = tokio::time::Instant::now();
    let idle_tick = (config.idle_stream_window / 4)
        .clamp(Duration::from_millis(100), Duration::from_secs(1));
    let mut idle_ticker = tokio::time::interval(idle_tick);
    idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = idle_ticker.tick() => {
                if streaming && last_frame_at.elapsed() > config.idle_stream_window {
                    streaming = false;
                    if let Err(e) = state.catalog.set_streaming(&producer_id, false).await {
                        warn!(error = %e, producer_id = %producer_id, "streaming flag update failed");
                    }
                }
            }
            inbound = tokio::time::timeout(config.heartbeat_timeout, stream.next()) => {
                match inbound {
                    Err(_) => {
                        warn!(producer_id = %producer_id, "idle timeout");
                        close_intent.set(close::NORMAL, close::REASON_HEARTBEAT_TIMEOUT).await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(producer_id = %producer_id, error = %e, "websocket error");
                        break;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        info!(producer_id = %producer_id, "producer disconnected");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle.touch();
                        let over_limit = handle_producer_message(
                            &state,
                            &handle,
                            &producer_id,
                            &text,
                            &mut streaming,
                            &mut last_frame_at,
                            &mut strikes,
                        )
                        .await;
                        if over_limit {
                            warn!(producer_id = %producer_id, "too many protocol errors");
                            close_intent.set(close::NORMAL, close::REASON_PROTOCOL_ERRORS).await;
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => handle.touch(),
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    cancel.cancel();
    if state
        .registry
        .remove_producer_session(&producer_id, session_id)
        .await
    {
        // Guarded delete: a newer registration (possibly on another instance)
        // keeps its catalog row.
        match state
            .catalog
            .unregister(&producer_id, Some(state.instance_id))
            .await
        {
            Ok(true) => {
                router::announce_catalog_change(&state, &producer_id, CatalogChange::Disconnected)
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, producer_id = %producer_id, "unregister failed"),
        }
    }
    let _ = writer.await;
    info!(producer_id = %producer_id, "producer session ended");
}

async fn handle_producer_message(
    state: &AppState,
    handle: &Arc<ProducerHandle>,
    producer_id: &str,
    text: &str,
    streaming: &mut bool,
    last_frame_at: &mut tokio::time::Instant,
    strikes: &mut StrikeCounter,
) -> bool {
    match serde_json::from_str::<WsMessage>(text) {
        Ok(WsMessage::Heartbeat) => {
            if let Err(e) = state.catalog.heartbeat(producer_id).await {
                warn!(error = %e, producer_id = %producer_id, "heartbeat update failed");
            }
            let _ = handle.send(WsMessage::HeartbeatAck).await;
            false
        }
        Ok(WsMessage::FrameData(frame)) => {
            *last_frame_at = tokio::time::Instant::now();
            if !*streaming {
                *streaming = true;
                if let Err(e) = state.catalog.set_streaming(producer_id, true).await {
                    warn!(error = %e, producer_id = %producer_id, "streaming flag update failed");
                }
            }
            router::route_frame(state, producer_id, frame).await;
            false
        }
        Ok(WsMessage::PollCommands(poll)) => {
            // Polling doubles as a heartbeat.
            if let Err(e) = state.catalog.heartbeat(producer_id).await {
                warn!(error = %e, producer_id = %producer_id, "heartbeat update failed");
            }
            let max = poll
                .max
                .unwrap_or(state.config.poll_batch_limit)
                .min(state.config.poll_batch_limit);
            match state.commands.fetch_pending(producer_id, max).await {
                Ok(records) => {
                    let mut commands = Vec::with_capacity(records.len());
                    for record in records {
                        // Skip anything another delivery path already handed
                        // over.
                        if state.recent_keys.insert(&record.idempotency_key).await {
                            commands.push(record.envelope());
                        }
                    }
                    let _ = handle
                        .send(WsMessage::PendingCommands(PendingCommands { commands }))
                        .await;
                }
                Err(e) => {
                    error!(error = %e, producer_id = %producer_id, "pending command fetch failed");
                    let _ = handle
                        .send(WsMessage::Error(ErrorMessage {
                            code: error_codes::INTERNAL_ERROR.to_owned(),
                            message: "command store unavailable".to_owned(),
                            retryable: true,
                        }))
                        .await;
                }
            }
            false
        }
        Ok(WsMessage::CommandResult(result)) => {
            if result.status == CommandStatus::Pending {
                return strike(strikes, handle, "command_result must be terminal").await;
            }
            match state
                .commands
                .mark_done(result.command_id, result.status, result.error.as_deref())
                .await
            {
                // Already terminal is fine: the send path may have pre-marked
                // the record completed.
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, command_id = %result.command_id, "command result not recorded");
                }
            }
            false
        }
        Ok(WsMessage::StreamStatus(status)) => {
            *streaming = status.streaming;
            if status.streaming {
                *last_frame_at = tokio::time::Instant::now();
            }
            if let Err(e) = state.catalog.set_streaming(producer_id, status.streaming).await {
                warn!(error = %e, producer_id = %producer_id, "streaming flag update failed");
            }
            false
        }
        Ok(_) => strike(strikes, handle, "unexpected message kind for a producer").await,
        Err(e) => strike(strikes, handle, &format!("invalid JSON: {e}")).await,
    }
}

async fn strike(strikes: &mut StrikeCounter, handle: &Arc<ProducerHandle>, reason: &str) -> bool {
    let _ = handle
        .send(WsMessage::Error(ErrorMessage {
            code: error_codes::PROTOCOL_ERROR.to_owned(),
            message: reason.to_owned(),
            retryable: false,
        }))
        .await;
    strikes.strike()
}
