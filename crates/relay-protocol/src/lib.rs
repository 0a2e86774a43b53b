// relay-protocol: WebSocket wire types for the screen relay.
//
// Every message is one JSON object per WebSocket text frame, discriminated by
// a top-level `type` field.  Field names are camelCase on the wire.  Messages
// may carry a `timestamp` field; the relay ignores it on inbound messages it
// does not model, and serde's default tolerance of unknown fields keeps the
// protocol forward-compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// One physical display attached to a producer.
///
/// `id` is the producer-scoped monitor identifier (`"monitor_0"`,
/// `"monitor_1"`, ...) used by subscriptions and frames; `width`/`height` are
/// the native resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub id: String,
    pub index: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Identity block carried by both producer and viewer handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    /// Empty for viewers.
    #[serde(default)]
    pub monitors: Vec<MonitorInfo>,
    /// Command kinds the producer supports ("capture", "mouse", ...).
    /// Forwarded verbatim; the relay does not interpret individual entries.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Encoding of a frame payload.  The relay never decodes `frameData`; the tag
/// exists so viewers can pick a renderer without sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    Jpeg,
    Png,
    Svg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

/// A single captured frame.
///
/// `producer_id` is absent on the producer->relay leg (the socket identifies
/// the sender) and filled in by the relay before fan-out.  `frame_number` is
/// monotonic per monitor and may reset when the producer restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    pub monitor_id: String,
    pub frame_number: u64,
    /// Opaque base64 payload; forwarded without inspection or mutation.
    pub frame_data: String,
    pub metadata: FrameMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// The fixed set of remote-control command kinds.
///
/// `start_capture`/`stop_capture` are streaming control and get the longer
/// pending TTL; everything else is a one-shot action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StartCapture,
    StopCapture,
    MouseClick,
    MouseMove,
    MouseDrag,
    Scroll,
    TypeText,
    KeyPress,
    Hotkey,
    CaptureRegion,
    GetMousePosition,
}

impl CommandKind {
    pub fn is_streaming_control(self) -> bool {
        matches!(self, CommandKind::StartCapture | CommandKind::StopCapture)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::StartCapture => "start_capture",
            CommandKind::StopCapture => "stop_capture",
            CommandKind::MouseClick => "mouse_click",
            CommandKind::MouseMove => "mouse_move",
            CommandKind::MouseDrag => "mouse_drag",
            CommandKind::Scroll => "scroll",
            CommandKind::TypeText => "type_text",
            CommandKind::KeyPress => "key_press",
            CommandKind::Hotkey => "hotkey",
            CommandKind::CaptureRegion => "capture_region",
            CommandKind::GetMousePosition => "get_mouse_position",
        }
    }
}

impl std::str::FromStr for CommandKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_capture" => Ok(CommandKind::StartCapture),
            "stop_capture" => Ok(CommandKind::StopCapture),
            "mouse_click" => Ok(CommandKind::MouseClick),
            "mouse_move" => Ok(CommandKind::MouseMove),
            "mouse_drag" => Ok(CommandKind::MouseDrag),
            "scroll" => Ok(CommandKind::Scroll),
            "type_text" => Ok(CommandKind::TypeText),
            "key_press" => Ok(CommandKind::KeyPress),
            "hotkey" => Ok(CommandKind::Hotkey),
            "capture_region" => Ok(CommandKind::CaptureRegion),
            "get_mouse_position" => Ok(CommandKind::GetMousePosition),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Viewer-originated command body, shared by every command message kind.
///
/// `desktopClientId` names the target producer.  Kind-specific parameters
/// (`x`, `y`, `text`, `keys`, capture config, ...) are captured verbatim in
/// `params` and validated by the producer, not the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub desktop_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Relay-to-producer command delivery envelope.
///
/// Sent directly on the producer socket when the relay can reach it, and
/// returned from `poll_commands` otherwise.  `idempotency_key` lets the
/// producer deduplicate across those paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
    pub params: serde_json::Value,
    pub idempotency_key: String,
}

/// Terminal status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }
}

/// Producer-reported (and relay-forwarded) terminal command state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: Uuid,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immediate intake acknowledgment for a viewer command.
///
/// `delivered` means the envelope was handed to a producer socket on this
/// instance; `pending` means it was routed (bus and/or durable queue) and a
/// `command_result` will follow within the command TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: Uuid,
    pub status: DeliveryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Delivered,
    Pending,
}

/// Emitted when the relay cannot determine a terminal state for a command
/// within its TTL (store unreachable).  Normally the viewer sees a
/// `command_result` with `status: "failed", error: "expired"` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTimeout {
    pub command_id: Uuid,
}

// ---------------------------------------------------------------------------
// Producer -> relay messages
// ---------------------------------------------------------------------------

/// First message on every connection; triggers catalog registration for
/// producers.  The relay replies `handshake_ack` or `registration_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub client_info: ClientInfo,
}

/// Fetch pending commands; also counts as a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

/// Producer-reported streaming state, mirrored into the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub streaming: bool,
}

// ---------------------------------------------------------------------------
// Viewer -> relay messages
// ---------------------------------------------------------------------------

/// Add to the viewer's subscription set.  Omitting `producerId` subscribes to
/// all current (and future) producers; omitting `monitorId` covers every
/// monitor of that producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
}

/// Inverse of `subscribe`, same addressing rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unsubscribe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
}

/// Viewer latency telemetry for one frame.  Best-effort: forwarded to the
/// producer when reachable, dropped otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAck {
    pub producer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
    pub frame_number: u64,
    pub latency_ms: u64,
    /// Filled in by the relay before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Relay -> client messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub client_id: String,
    /// True once the producer's catalog registration committed.  Always false
    /// for viewers (they are never persisted).
    pub db_registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

/// Fatal handshake outcome; followed by a close with code 1008.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationFailed {
    pub reason: String,
}

/// One row of the viewer-facing catalog view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub name: String,
    pub monitors: Vec<MonitorInfo>,
    /// Present on some instance's live socket, or heartbeated within the
    /// liveness window.
    pub connected: bool,
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerList {
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerConnected {
    pub producer_id: String,
    pub monitors: Vec<MonitorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDisconnected {
    pub producer_id: String,
}

/// Poll response carrying every pending command the producer may execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommands {
    pub commands: Vec<CommandEnvelope>,
}

/// Frozen error codes for `error` messages.
pub mod error_codes {
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const PRODUCER_UNKNOWN: &str = "PRODUCER_UNKNOWN";
    pub const SLOW_CONSUMER: &str = "SLOW_CONSUMER";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// WebSocket close codes and application-level reasons.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const REGISTRATION_FAILED: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;

    pub const REASON_SLOW_CONSUMER: &str = "slow_consumer";
    pub const REASON_PROTOCOL_ERRORS: &str = "too_many_protocol_errors";
    pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
}

/// Protocol error message (relay -> client).
///
/// | Code             | Retryable |
/// |------------------|-----------|
/// | PROTOCOL_ERROR   | false     |
/// | PRODUCER_UNKNOWN | false     |
/// | SLOW_CONSUMER    | false     |
/// | INTERNAL_ERROR   | true      |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All WebSocket message kinds.
///
/// Serializes/deserializes using the `type` field as a tag:
///
/// ```json
/// { "type": "frame_data", "monitorId": "monitor_0", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum WsMessage {
    // Client -> relay
    Handshake(Handshake),
    // Producer -> relay
    FrameData(FrameData),
    Heartbeat,
    PollCommands(PollCommands),
    CommandResult(CommandResult),
    StreamStatus(StreamStatus),
    // Viewer -> relay
    ListProducers,
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    StartCapture(CommandRequest),
    StopCapture(CommandRequest),
    MouseClick(CommandRequest),
    MouseMove(CommandRequest),
    MouseDrag(CommandRequest),
    Scroll(CommandRequest),
    TypeText(CommandRequest),
    KeyPress(CommandRequest),
    Hotkey(CommandRequest),
    CaptureRegion(CommandRequest),
    GetMousePosition(CommandRequest),
    FrameAck(FrameAck),
    // Relay -> client
    HandshakeAck(HandshakeAck),
    RegistrationFailed(RegistrationFailed),
    HeartbeatAck,
    ProducerList(ProducerList),
    ProducerConnected(ProducerConnected),
    ProducerDisconnected(ProducerDisconnected),
    Command(CommandEnvelope),
    PendingCommands(PendingCommands),
    CommandAck(CommandAck),
    CommandTimeout(CommandTimeout),
    Error(ErrorMessage),
}

impl WsMessage {
    /// Splits viewer command messages into their kind and shared body.
    /// Returns `None` for every non-command message.
    pub fn as_command(&self) -> Option<(CommandKind, &CommandRequest)> {
        match self {
            WsMessage::StartCapture(r) => Some((CommandKind::StartCapture, r)),
            WsMessage::StopCapture(r) => Some((CommandKind::StopCapture, r)),
            WsMessage::MouseClick(r) => Some((CommandKind::MouseClick, r)),
            WsMessage::MouseMove(r) => Some((CommandKind::MouseMove, r)),
            WsMessage::MouseDrag(r) => Some((CommandKind::MouseDrag, r)),
            WsMessage::Scroll(r) => Some((CommandKind::Scroll, r)),
            WsMessage::TypeText(r) => Some((CommandKind::TypeText, r)),
            WsMessage::KeyPress(r) => Some((CommandKind::KeyPress, r)),
            WsMessage::Hotkey(r) => Some((CommandKind::Hotkey, r)),
            WsMessage::CaptureRegion(r) => Some((CommandKind::CaptureRegion, r)),
            WsMessage::GetMousePosition(r) => Some((CommandKind::GetMousePosition, r)),
            _ => None,
        }
    }
}
