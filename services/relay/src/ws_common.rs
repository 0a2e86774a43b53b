use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use relay_protocol::{close, RegistrationFailed, WsMessage};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::outbox::ViewerOutbox;
use crate::state::AppState;

/// `client_type` query parameter: producers connect as `desktop`, viewers as
/// `web`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Desktop,
    Web,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub client_type: Option<ClientType>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// The single relay endpoint.  The query parameter decides which session type
/// the socket becomes; absent means a viewer.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match query.client_type {
            Some(ClientType::Desktop) => {
                crate::ws_producer::handle_producer_socket(socket, state, query.client_id).await;
            }
            Some(ClientType::Web) | None => {
                crate::ws_viewer::handle_viewer_socket(socket, state, query.client_id).await;
            }
        }
    })
}

pub async fn send_msg(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// Handshake-failure exit: one `registration_failed`, then close 1008.
pub async fn reject_registration(mut socket: WebSocket, reason: &str) {
    let msg = WsMessage::RegistrationFailed(RegistrationFailed {
        reason: reason.to_owned(),
    });
    let _ = send_msg(&mut socket, &msg).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close::REGISTRATION_FAILED,
            reason: reason.to_owned().into(),
        })))
        .await;
}

pub async fn recv_text_with_timeout(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Result<String, ()> {
    match tokio::time::timeout(timeout, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => Ok(text.to_string()),
        _ => Err(()),
    }
}

/// Close code and reason a session wants its writer to send on exit.
#[derive(Default)]
pub struct CloseIntent {
    slot: Mutex<Option<(u16, String)>>,
}

impl CloseIntent {
    pub async fn set(&self, code: u16, reason: &str) {
        let mut slot = self.slot.lock().await;
        if slot.is_none() {
            *slot = Some((code, reason.to_owned()));
        }
    }

    pub async fn take(&self) -> Option<(u16, String)> {
        self.slot.lock().await.take()
    }
}

/// Writer half of a producer session: drains the outbound channel onto the
/// socket with a per-write deadline.  A failed or overdue write cancels the
/// whole session.
pub fn spawn_message_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<WsMessage>,
    write_deadline: Duration,
    cancel: CancellationToken,
    close_intent: Arc<CloseIntent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(msg) => {
                        let Ok(json) = serde_json::to_string(&msg) else { continue };
                        match tokio::time::timeout(write_deadline, sink.send(Message::Text(json.into()))).await {
                            Ok(Ok(())) => {}
                            _ => {
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
        if let Some((code, reason)) = close_intent.take().await {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
    })
}

/// Writer half of a viewer session: drains the outbox (control before
/// frames).  On slow-consumer overflow the close frame says so.
pub fn spawn_outbox_writer(
    mut sink: SplitSink<WebSocket, Message>,
    outbox: Arc<ViewerOutbox>,
    write_deadline: Duration,
    cancel: CancellationToken,
    close_intent: Arc<CloseIntent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        'outer: loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = outbox.wait() => {
                    while let Some(msg) = outbox.pop().await {
                        let Ok(json) = serde_json::to_string(&msg) else { continue };
                        match tokio::time::timeout(write_deadline, sink.send(Message::Text(json.into()))).await {
                            Ok(Ok(())) => {}
                            _ => {
                                cancel.cancel();
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }
        let close_frame = if outbox.overflowed().await {
            Some((close::NORMAL, close::REASON_SLOW_CONSUMER.to_owned()))
        } else {
            close_intent.take().await
        };
        if let Some((code, reason)) = close_frame {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
    })
}

/// Counts protocol errors over a sliding window.  Repeated garbage closes
/// the connection; the odd malformed message only earns an `error` reply.
pub struct StrikeCounter {
    limit: u32,
    window: Duration,
    strikes: VecDeque<Instant>,
}

impl StrikeCounter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            strikes: VecDeque::new(),
        }
    }

    /// Records one protocol error; true once the limit is exceeded within the
    /// window.
    pub fn strike(&mut self) -> bool {
        let now = Instant::now();
        self.strikes.push_back(now);
        while self
            .strikes
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.strikes.pop_front();
        }
        self.strikes.len() > self.limit as usize
    }
}
