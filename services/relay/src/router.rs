//! C7: decides, for every outbound message, whether to deliver locally, via
//! the bus, or via the durable command queue.
//!
//! Frames: local fan-out plus exactly one bus publish per arriving frame;
//! remote instances do the symmetric local fan-out on receipt and skip their
//! own broadcasts.  Commands: direct send when the producer is local,
//! otherwise a durable `pending` record plus a targeted bus publish, with the
//! producer's `poll_commands` as the fallback path.  Frame acks: pure
//! telemetry, no durable fallback.

use std::sync::Arc;
use std::time::Duration;

use relay_protocol::{
    error_codes, CommandAck, CommandKind, CommandRequest, CommandResult, CommandStatus,
    CommandTimeout, DeliveryState, ErrorMessage, FrameAck, FrameData, ProducerConnected,
    ProducerDisconnected, WsMessage,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, CatalogChange};
use crate::registry::ViewerHandle;
use crate::state::AppState;
use crate::store::NewCommand;

/// Fans a producer frame out to local subscribers and publishes it once for
/// every other instance.
pub async fn route_frame(state: &AppState, producer_id: &str, mut frame: FrameData) {
    frame.producer_id = Some(producer_id.to_owned());
    fan_out_frame_local(state, producer_id, &frame).await;
    let event = BusEvent::Frame {
        origin_instance_id: state.instance_id,
        producer_id: producer_id.to_owned(),
        frame,
    };
    if let Err(e) = state.bus.publish(&event).await {
        warn!(error = %e, producer_id, "frame publish failed, remote viewers miss this frame");
    }
}

async fn fan_out_frame_local(state: &AppState, producer_id: &str, frame: &FrameData) {
    // Snapshot first; never send while holding the registry lock.
    let viewers = state.registry.snapshot_viewers().await;
    for viewer in viewers {
        if viewer
            .subscription_matches(producer_id, &frame.monitor_id)
            .await
        {
            viewer.outbox.push_frame(frame.clone()).await;
        }
    }
}

/// Routes a viewer command to its target producer.
pub async fn route_command(
    state: &AppState,
    viewer: &Arc<ViewerHandle>,
    kind: CommandKind,
    request: &CommandRequest,
    idempotency_key: String,
) {
    let producer_id = request.desktop_client_id.clone();
    let command_id = Uuid::new_v4();
    let ttl = state.config.command_ttl(kind);
    let params = serde_json::Value::Object(request.params.clone());

    // Local fast path: the producer socket lives on this instance.
    if let Some(producer) = state.registry.get_producer(&producer_id).await {
        let new_command = NewCommand {
            command_id,
            producer_id,
            target_instance_id: Some(state.instance_id),
            kind,
            monitor_id: request.monitor_id.clone(),
            params,
            idempotency_key,
        };
        let record = match state.commands.enqueue(new_command).await {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "command enqueue failed");
                send_internal_error(viewer, "command could not be stored").await;
                return;
            }
        };
        if state.recent_keys.insert(&record.idempotency_key).await {
            let delivered = producer.send(WsMessage::Command(record.envelope())).await;
            let (status, error) = if delivered {
                (CommandStatus::Completed, None)
            } else {
                (CommandStatus::Failed, Some("producer_not_connected"))
            };
            if let Err(e) = state.commands.mark_done(record.command_id, status, error).await {
                warn!(error = %e, command_id = %record.command_id, "failed to record delivery");
            }
        }
        viewer
            .send_control(WsMessage::CommandAck(CommandAck {
                command_id: record.command_id,
                status: DeliveryState::Delivered,
            }))
            .await;
        spawn_result_watcher(state.clone(), viewer.clone(), record.command_id, ttl);
        return;
    }

    // Remote: the catalog knows which instance holds the socket.
    let owning_instance_id = match state.catalog.get(&producer_id).await {
        Ok(Some(record)) => record.owning_instance_id,
        Ok(None) => {
            viewer
                .send_control(WsMessage::CommandResult(CommandResult {
                    command_id,
                    status: CommandStatus::Failed,
                    error: Some("producer_unknown".to_owned()),
                }))
                .await;
            return;
        }
        Err(e) => {
            error!(error = %e, producer_id = %producer_id, "catalog lookup failed");
            send_internal_error(viewer, "catalog unavailable").await;
            return;
        }
    };

    let new_command = NewCommand {
        command_id,
        producer_id: producer_id.clone(),
        target_instance_id: Some(owning_instance_id),
        kind,
        monitor_id: request.monitor_id.clone(),
        params,
        idempotency_key,
    };
    let record = match state.commands.enqueue(new_command).await {
        Ok(record) => record,
        Err(e) => {
            error!(error = %e, "command enqueue failed");
            send_internal_error(viewer, "command could not be stored").await;
            return;
        }
    };
    let event = BusEvent::Command {
        target_instance_id: owning_instance_id,
        producer_id,
        envelope: record.envelope(),
    };
    if let Err(e) = state.bus.publish(&event).await {
        // The durable record stays pending; the producer's next poll picks
        // it up.
        warn!(error = %e, command_id = %record.command_id, "command publish failed, polling fallback applies");
    }
    viewer
        .send_control(WsMessage::CommandAck(CommandAck {
            command_id: record.command_id,
            status: DeliveryState::Pending,
        }))
        .await;
    spawn_result_watcher(state.clone(), viewer.clone(), record.command_id, ttl);
}

async fn send_internal_error(viewer: &Arc<ViewerHandle>, message: &str) {
    viewer
        .send_control(WsMessage::Error(ErrorMessage {
            code: error_codes::INTERNAL_ERROR.to_owned(),
            message: message.to_owned(),
            retryable: true,
        }))
        .await;
}

/// Watches the durable record until it turns terminal, then reports
/// `command_result` to the issuing viewer.  At the TTL it expires the record
/// itself; the conditional update keeps exactly one terminal transition even
/// when the janitor or a late `command_result` races it.
fn spawn_result_watcher(
    state: AppState,
    viewer: Arc<ViewerHandle>,
    command_id: Uuid,
    ttl: Duration,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + ttl;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                let expired = state
                    .commands
                    .mark_done(command_id, CommandStatus::Failed, Some("expired"))
                    .await;
                match expired {
                    Ok(_) => match state.commands.get(command_id).await {
                        Ok(Some(record)) if record.status != CommandStatus::Pending => {
                            viewer
                                .send_control(WsMessage::CommandResult(CommandResult {
                                    command_id,
                                    status: record.status,
                                    error: record.error_message,
                                }))
                                .await;
                        }
                        _ => {
                            viewer
                                .send_control(WsMessage::CommandTimeout(CommandTimeout {
                                    command_id,
                                }))
                                .await;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, command_id = %command_id, "could not expire command");
                        viewer
                            .send_control(WsMessage::CommandTimeout(CommandTimeout { command_id }))
                            .await;
                    }
                }
                return;
            }

            let step = state.config.result_poll_interval.min(deadline - now);
            tokio::time::sleep(step).await;

            match state.commands.get(command_id).await {
                Ok(Some(record)) if record.status != CommandStatus::Pending => {
                    viewer
                        .send_control(WsMessage::CommandResult(CommandResult {
                            command_id,
                            status: record.status,
                            error: record.error_message,
                        }))
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, command_id = %command_id, "result watcher store read failed");
                }
            }
        }
    });
}

/// Forwards viewer latency telemetry toward the producer.  No durable
/// fallback: losing an ack is acceptable.
pub async fn route_frame_ack(state: &AppState, viewer_id: &str, mut ack: FrameAck) {
    ack.viewer_id = Some(viewer_id.to_owned());
    if let Some(producer) = state.registry.get_producer(&ack.producer_id).await {
        let _ = producer.send(WsMessage::FrameAck(ack)).await;
        return;
    }
    let event = BusEvent::FrameAck {
        producer_id: ack.producer_id.clone(),
        ack,
    };
    if let Err(e) = state.bus.publish(&event).await {
        debug!(error = %e, "frame ack publish failed");
    }
}

/// Tells local viewers about a catalog change and broadcasts it for every
/// other instance.
pub async fn announce_catalog_change(state: &AppState, producer_id: &str, change: CatalogChange) {
    notify_local_viewers(state, producer_id, &change).await;
    let event = BusEvent::CatalogChanged {
        origin_instance_id: state.instance_id,
        producer_id: producer_id.to_owned(),
        change,
    };
    if let Err(e) = state.bus.publish(&event).await {
        warn!(error = %e, producer_id, "catalog change publish failed");
    }
}

async fn notify_local_viewers(state: &AppState, producer_id: &str, change: &CatalogChange) {
    let msg = match change {
        CatalogChange::Connected { monitors } => {
            WsMessage::ProducerConnected(ProducerConnected {
                producer_id: producer_id.to_owned(),
                monitors: monitors.clone(),
            })
        }
        CatalogChange::Disconnected => WsMessage::ProducerDisconnected(ProducerDisconnected {
            producer_id: producer_id.to_owned(),
        }),
    };
    for viewer in state.registry.snapshot_viewers().await {
        viewer.send_control(msg.clone()).await;
    }
}

/// Handles one message off the bus.
pub async fn handle_bus_event(state: &AppState, event: BusEvent) {
    match event {
        BusEvent::Frame {
            origin_instance_id,
            producer_id,
            frame,
        } => {
            // Never re-fan-out our own broadcast.
            if origin_instance_id == state.instance_id {
                return;
            }
            fan_out_frame_local(state, &producer_id, &frame).await;
        }
        BusEvent::Command {
            target_instance_id,
            producer_id,
            envelope,
        } => {
            if target_instance_id != state.instance_id {
                return;
            }
            deliver_targeted_command(state, &producer_id, envelope).await;
        }
        BusEvent::FrameAck { producer_id, ack } => {
            if let Some(producer) = state.registry.get_producer(&producer_id).await {
                let _ = producer.send(WsMessage::FrameAck(ack)).await;
            }
        }
        BusEvent::CatalogChanged {
            origin_instance_id,
            producer_id,
            change,
        } => {
            if origin_instance_id == state.instance_id {
                return;
            }
            notify_local_viewers(state, &producer_id, &change).await;
        }
    }
}

async fn deliver_targeted_command(
    state: &AppState,
    producer_id: &str,
    envelope: relay_protocol::CommandEnvelope,
) {
    if !state.recent_keys.insert(&envelope.idempotency_key).await {
        debug!(command_id = %envelope.command_id, "duplicate command delivery suppressed");
        return;
    }
    let command_id = envelope.command_id;
    let delivered = match state.registry.get_producer(producer_id).await {
        Some(producer) => producer.send(WsMessage::Command(envelope)).await,
        None => false,
    };
    let (status, error) = if delivered {
        (CommandStatus::Completed, None)
    } else {
        (CommandStatus::Failed, Some("producer_not_connected_on_target"))
    };
    if let Err(e) = state.commands.mark_done(command_id, status, error).await {
        warn!(error = %e, command_id = %command_id, "failed to record command delivery");
    }
}

/// Subscribes to the bus and dispatches events for the lifetime of the
/// instance.  The first subscription happens before this returns, so no
/// event published after startup is missed.  Supervised: any stream failure
/// resubscribes with exponential backoff.
pub async fn spawn_bus_listener(state: AppState) -> tokio::task::JoinHandle<()> {
    let initial = match state.bus.subscribe().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "initial bus subscribe failed, retrying in background");
            None
        }
    };
    tokio::spawn(async move {
        let mut stream_slot = initial;
        let mut backoff = Duration::from_millis(100);
        loop {
            let mut stream = match stream_slot.take() {
                Some(stream) => stream,
                None => match state.bus.subscribe().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "bus subscribe failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(5));
                        continue;
                    }
                },
            };
            backoff = Duration::from_millis(100);
            loop {
                match stream.recv().await {
                    Ok(event) => handle_bus_event(&state, event).await,
                    Err(e) => {
                        warn!(error = %e, "bus stream failed, resubscribing");
                        break;
                    }
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InProcessBus;
    use crate::config::RelayConfig;
    use crate::outbox::ViewerOutbox;
    use crate::registry::ProducerHandle;
    use crate::store::memory::{MemoryCatalog, MemoryCommandStore};
    use relay_protocol::CommandEnvelope;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(RelayConfig::default()),
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryCommandStore::new()),
            Arc::new(InProcessBus::new()),
        )
    }

    fn test_viewer() -> Arc<ViewerHandle> {
        Arc::new(ViewerHandle::new(
            "viewer-1".to_owned(),
            Uuid::new_v4(),
            Arc::new(ViewerOutbox::new(8, 64)),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn unknown_producer_fails_the_command_immediately() {
        let state = test_state();
        let viewer = test_viewer();
        let request = CommandRequest {
            desktop_client_id: "ghost".to_owned(),
            monitor_id: None,
            params: serde_json::Map::new(),
        };

        route_command(
            &state,
            &viewer,
            CommandKind::MouseClick,
            &request,
            "viewer-1:1:0".to_owned(),
        )
        .await;

        match viewer.outbox.pop().await {
            Some(WsMessage::CommandResult(result)) => {
                assert_eq!(result.status, CommandStatus::Failed);
                assert_eq!(result.error.as_deref(), Some("producer_unknown"));
            }
            other => panic!("expected command_result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_bus_deliveries_reach_the_producer_once() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::new(ProducerHandle::new(
            "prod-1".to_owned(),
            Uuid::new_v4(),
            tx,
            CancellationToken::new(),
        ));
        state.registry.insert_producer(handle).await;

        let record = state
            .commands
            .enqueue(NewCommand {
                command_id: Uuid::new_v4(),
                producer_id: "prod-1".to_owned(),
                target_instance_id: Some(state.instance_id),
                kind: CommandKind::TypeText,
                monitor_id: None,
                params: serde_json::json!({"text": "hi"}),
                idempotency_key: "viewer-1:7:0".to_owned(),
            })
            .await
            .unwrap();

        let envelope: CommandEnvelope = record.envelope();
        deliver_targeted_command(&state, "prod-1", envelope.clone()).await;
        deliver_targeted_command(&state, "prod-1", envelope).await;

        // Exactly one delivery on the socket channel.
        let first = rx.try_recv();
        assert!(matches!(first, Ok(WsMessage::Command(_))), "{first:?}");
        assert!(rx.try_recv().is_err());

        // And exactly one terminal transition in the store.
        let stored = state.commands.get(record.command_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn own_frame_broadcast_is_skipped() {
        let state = test_state();
        let viewer = test_viewer();
        viewer.subscribe(None, None).await;
        state.registry.insert_viewer(viewer.clone()).await;

        let frame = FrameData {
            producer_id: Some("prod-1".to_owned()),
            monitor_id: "monitor_0".to_owned(),
            frame_number: 1,
            frame_data: "eA==".to_owned(),
            metadata: relay_protocol::FrameMetadata {
                width: 10,
                height: 10,
                format: relay_protocol::FrameFormat::Png,
            },
            timestamp: None,
        };
        handle_bus_event(
            &state,
            BusEvent::Frame {
                origin_instance_id: state.instance_id,
                producer_id: "prod-1".to_owned(),
                frame: frame.clone(),
            },
        )
        .await;
        assert!(viewer.outbox.pop().await.is_none(), "own broadcast must not fan out twice");

        // A remote origin does fan out.
        handle_bus_event(
            &state,
            BusEvent::Frame {
                origin_instance_id: Uuid::new_v4(),
                producer_id: "prod-1".to_owned(),
                frame,
            },
        )
        .await;
        assert!(matches!(
            viewer.outbox.pop().await,
            Some(WsMessage::FrameData(_))
        ));
    }
}
