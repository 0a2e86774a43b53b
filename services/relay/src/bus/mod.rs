//! C3: best-effort cross-instance pub/sub.
//!
//! A message may be lost on instance crash or partition; the router treats
//! every publish as fire-and-forget and the durable command queue is the
//! fallback.  Each instance subscribes to all channels and filters by target
//! where applicable.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use relay_protocol::{CommandEnvelope, FrameAck, FrameData, MonitorInfo};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;

pub mod channels {
    pub const CONTROL_COMMAND: &str = "relay.control.command";
    pub const CONTROL_FRAME_ACK: &str = "relay.control.frame_ack";
    pub const FRAME_DATA: &str = "relay.frame.data";
    pub const CATALOG_CHANGED: &str = "relay.catalog.changed";

    pub const ALL: [&str; 4] = [CONTROL_COMMAND, CONTROL_FRAME_ACK, FRAME_DATA, CATALOG_CHANGED];
}

/// What changed for a producer in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogChange {
    Connected { monitors: Vec<MonitorInfo> },
    Disconnected,
}

/// All cross-instance messages.  `origin_instance_id` lets the publishing
/// instance skip its own broadcast; `target_instance_id` addresses exactly
/// one receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Command {
        target_instance_id: Uuid,
        producer_id: String,
        envelope: CommandEnvelope,
    },
    FrameAck {
        producer_id: String,
        ack: FrameAck,
    },
    Frame {
        origin_instance_id: Uuid,
        producer_id: String,
        frame: FrameData,
    },
    CatalogChanged {
        origin_instance_id: Uuid,
        producer_id: String,
        change: CatalogChange,
    },
}

impl BusEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            BusEvent::Command { .. } => channels::CONTROL_COMMAND,
            BusEvent::FrameAck { .. } => channels::CONTROL_FRAME_ACK,
            BusEvent::Frame { .. } => channels::FRAME_DATA,
            BusEvent::CatalogChanged { .. } => channels::CATALOG_CHANGED,
        }
    }
}

#[async_trait]
pub trait RealtimeBus: Send + Sync {
    /// At-most-once publish.  Errors are reported but never retried here.
    async fn publish(&self, event: &BusEvent) -> Result<(), BusError>;

    /// Opens a fresh subscription covering every channel.
    async fn subscribe(&self) -> Result<Box<dyn BusStream>, BusError>;
}

#[async_trait]
pub trait BusStream: Send {
    async fn recv(&mut self) -> Result<BusEvent, BusError>;
}
