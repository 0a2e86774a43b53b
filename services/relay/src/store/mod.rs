//! Shared durable state: the producer catalog and the command queue.
//!
//! Both live behind traits so the relay runs against Postgres in production
//! and against the in-memory implementations in tests and single-node
//! deployments.  The traits mirror the operations the routing plane needs;
//! nothing here holds a socket (sessions are looked up by id in the
//! per-instance registry).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_protocol::{ClientInfo, CommandEnvelope, CommandKind, CommandStatus, MonitorInfo};
use uuid::Uuid;

use crate::error::StoreError;

/// One row of the producer catalog.  Exactly one record exists per
/// producer_id; `owning_instance_id` is last-writer-wins on each handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub producer_id: String,
    pub display_name: String,
    pub hostname: Option<String>,
    pub owner_id: Option<String>,
    pub monitors: Vec<MonitorInfo>,
    pub capabilities: Vec<String>,
    pub is_streaming: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub owning_instance_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProducerRecord {
    /// Builds a freshly-connected record from a handshake.
    pub fn fresh(producer_id: &str, info: &ClientInfo, owning_instance_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            producer_id: producer_id.to_owned(),
            display_name: info.name.clone(),
            hostname: info.hostname.clone(),
            owner_id: info.user_id.clone(),
            monitors: info.monitors.clone(),
            capabilities: info.capabilities.clone(),
            is_streaming: false,
            last_heartbeat: now,
            owning_instance_id,
            connected_at: now,
            updated_at: now,
        }
    }
}

/// A durable command awaiting (or past) delivery to a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub producer_id: String,
    pub target_instance_id: Option<Uuid>,
    pub kind: CommandKind,
    pub monitor_id: Option<String>,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl CommandRecord {
    pub fn envelope(&self) -> CommandEnvelope {
        CommandEnvelope {
            command_id: self.command_id,
            kind: self.kind,
            monitor_id: self.monitor_id.clone(),
            params: self.params.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

/// Insert payload for [`CommandStore::enqueue`].  The router picks the
/// command id so it can reference it before the insert commits.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_id: Uuid,
    pub producer_id: String,
    pub target_instance_id: Option<Uuid>,
    pub kind: CommandKind,
    pub monitor_id: Option<String>,
    pub params: serde_json::Value,
    pub idempotency_key: String,
}

/// C1: the shared, authoritative directory of registered producers.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Upsert by producer_id.  Must succeed before a producer session counts
    /// as registered; a failure disconnects the producer.
    async fn register(&self, record: ProducerRecord) -> Result<(), StoreError>;

    /// Refresh `last_heartbeat`/`updated_at`.  No-op if the record is gone.
    async fn heartbeat(&self, producer_id: &str) -> Result<(), StoreError>;

    async fn set_streaming(&self, producer_id: &str, streaming: bool) -> Result<(), StoreError>;

    /// Delete the record.  With `only_if_owned_by`, the delete applies only
    /// while the row is still owned by that instance, so a stale session's
    /// teardown cannot remove a newer registration.  Returns whether a row
    /// was deleted.
    async fn unregister(
        &self,
        producer_id: &str,
        only_if_owned_by: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    async fn get(&self, producer_id: &str) -> Result<Option<ProducerRecord>, StoreError>;

    async fn list_active(&self) -> Result<Vec<ProducerRecord>, StoreError>;
}

/// C2: the durable per-producer command queue.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert with status `pending`.  A duplicate idempotency_key returns the
    /// existing record without enqueuing a second copy.
    async fn enqueue(&self, command: NewCommand) -> Result<CommandRecord, StoreError>;

    /// Oldest-first pending commands for one producer.
    async fn fetch_pending(
        &self,
        producer_id: &str,
        max: u32,
    ) -> Result<Vec<CommandRecord>, StoreError>;

    /// Conditional `pending` -> terminal transition.  Returns false (and
    /// changes nothing) when the command is already terminal or unknown.
    async fn mark_done(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn get(&self, command_id: Uuid) -> Result<Option<CommandRecord>, StoreError>;

    /// Janitor sweep: pending commands older than their kind-class TTL become
    /// `failed` with error "expired".  Returns the records it expired.
    async fn expire(
        &self,
        streaming_ttl: std::time::Duration,
        action_ttl: std::time::Duration,
    ) -> Result<Vec<CommandRecord>, StoreError>;
}
