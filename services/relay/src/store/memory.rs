//! In-memory catalog and command store for tests and single-node mode.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use relay_protocol::CommandStatus;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Catalog, CommandRecord, CommandStore, NewCommand, ProducerRecord};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryCatalog {
    records: RwLock<HashMap<String, ProducerRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn register(&self, record: ProducerRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.producer_id.clone(), record);
        Ok(())
    }

    async fn heartbeat(&self, producer_id: &str) -> Result<(), StoreError> {
        if let Some(record) = self.records.write().await.get_mut(producer_id) {
            let now = Utc::now();
            record.last_heartbeat = now;
            record.updated_at = now;
        }
        Ok(())
    }

    async fn set_streaming(&self, producer_id: &str, streaming: bool) -> Result<(), StoreError> {
        if let Some(record) = self.records.write().await.get_mut(producer_id) {
            record.is_streaming = streaming;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn unregister(
        &self,
        producer_id: &str,
        only_if_owned_by: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match only_if_owned_by {
            Some(instance_id) => {
                let owned = records
                    .get(producer_id)
                    .is_some_and(|r| r.owning_instance_id == instance_id);
                if owned {
                    records.remove(producer_id);
                }
                Ok(owned)
            }
            None => Ok(records.remove(producer_id).is_some()),
        }
    }

    async fn get(&self, producer_id: &str) -> Result<Option<ProducerRecord>, StoreError> {
        Ok(self.records.read().await.get(producer_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<ProducerRecord>, StoreError> {
        let mut records: Vec<ProducerRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        Ok(records)
    }
}

#[derive(Default)]
pub struct MemoryCommandStore {
    commands: RwLock<CommandTable>,
}

#[derive(Default)]
struct CommandTable {
    by_id: HashMap<Uuid, CommandRecord>,
    by_idempotency_key: HashMap<String, Uuid>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn enqueue(&self, command: NewCommand) -> Result<CommandRecord, StoreError> {
        let mut table = self.commands.write().await;
        if let Some(existing_id) = table.by_idempotency_key.get(&command.idempotency_key) {
            if let Some(existing) = table.by_id.get(existing_id) {
                return Ok(existing.clone());
            }
        }
        let record = CommandRecord {
            command_id: command.command_id,
            producer_id: command.producer_id,
            target_instance_id: command.target_instance_id,
            kind: command.kind,
            monitor_id: command.monitor_id,
            params: command.params,
            idempotency_key: command.idempotency_key.clone(),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
        };
        table
            .by_idempotency_key
            .insert(command.idempotency_key, record.command_id);
        table.by_id.insert(record.command_id, record.clone());
        Ok(record)
    }

    async fn fetch_pending(
        &self,
        producer_id: &str,
        max: u32,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let table = self.commands.read().await;
        let mut pending: Vec<CommandRecord> = table
            .by_id
            .values()
            .filter(|r| r.producer_id == producer_id && r.status == CommandStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(max as usize);
        Ok(pending)
    }

    async fn mark_done(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        if status == CommandStatus::Pending {
            return Ok(false);
        }
        let mut table = self.commands.write().await;
        match table.by_id.get_mut(&command_id) {
            Some(record) if record.status == CommandStatus::Pending => {
                record.status = status;
                record.processed_at = Some(Utc::now());
                record.error_message = error.map(ToOwned::to_owned);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, command_id: Uuid) -> Result<Option<CommandRecord>, StoreError> {
        Ok(self.commands.read().await.by_id.get(&command_id).cloned())
    }

    async fn expire(
        &self,
        streaming_ttl: std::time::Duration,
        action_ttl: std::time::Duration,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut table = self.commands.write().await;
        for record in table.by_id.values_mut() {
            if record.status != CommandStatus::Pending {
                continue;
            }
            let ttl = if record.kind.is_streaming_control() {
                streaming_ttl
            } else {
                action_ttl
            };
            let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
            if now.signed_duration_since(record.created_at) > ttl {
                record.status = CommandStatus::Failed;
                record.processed_at = Some(now);
                record.error_message = Some("expired".to_owned());
                expired.push(record.clone());
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::CommandKind;

    fn new_command(key: &str, kind: CommandKind) -> NewCommand {
        NewCommand {
            command_id: Uuid::new_v4(),
            producer_id: "prod-1".to_owned(),
            target_instance_id: Some(Uuid::new_v4()),
            kind,
            monitor_id: None,
            params: serde_json::json!({"x": 1}),
            idempotency_key: key.to_owned(),
        }
    }

    #[tokio::test]
    async fn enqueue_deduplicates_by_idempotency_key() {
        let store = MemoryCommandStore::new();
        let first = store
            .enqueue(new_command("key-1", CommandKind::MouseClick))
            .await
            .unwrap();
        let second = store
            .enqueue(new_command("key-1", CommandKind::MouseClick))
            .await
            .unwrap();
        assert_eq!(first.command_id, second.command_id);

        let pending = store.fetch_pending("prod-1", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn mark_done_is_a_single_one_way_transition() {
        let store = MemoryCommandStore::new();
        let record = store
            .enqueue(new_command("key-2", CommandKind::TypeText))
            .await
            .unwrap();

        assert!(store
            .mark_done(record.command_id, CommandStatus::Completed, None)
            .await
            .unwrap());
        // Second transition fails silently; the record keeps its first status.
        assert!(!store
            .mark_done(record.command_id, CommandStatus::Failed, Some("late"))
            .await
            .unwrap());

        let stored = store.get(record.command_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn mark_done_rejects_pending_and_unknown_ids() {
        let store = MemoryCommandStore::new();
        let record = store
            .enqueue(new_command("key-3", CommandKind::Scroll))
            .await
            .unwrap();
        assert!(!store
            .mark_done(record.command_id, CommandStatus::Pending, None)
            .await
            .unwrap());
        assert!(!store
            .mark_done(Uuid::new_v4(), CommandStatus::Completed, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_mark_done_commits_exactly_one_transition() {
        let store = std::sync::Arc::new(MemoryCommandStore::new());
        let record = store
            .enqueue(new_command("key-4", CommandKind::KeyPress))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = record.command_id;
            tasks.push(tokio::spawn(async move {
                let status = if i % 2 == 0 {
                    CommandStatus::Completed
                } else {
                    CommandStatus::Failed
                };
                store.mark_done(id, status, None).await.unwrap()
            }));
        }
        let mut transitions = 0;
        for task in tasks {
            if task.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn expire_uses_kind_class_ttls() {
        let store = MemoryCommandStore::new();
        let streaming = store
            .enqueue(new_command("key-s", CommandKind::StartCapture))
            .await
            .unwrap();
        let action = store
            .enqueue(new_command("key-a", CommandKind::MouseClick))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // Action TTL already elapsed, streaming TTL not yet.
        let expired = store
            .expire(
                std::time::Duration::from_secs(60),
                std::time::Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].command_id, action.command_id);
        assert_eq!(expired[0].error_message.as_deref(), Some("expired"));

        let streaming_record = store.get(streaming.command_id).await.unwrap().unwrap();
        assert_eq!(streaming_record.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn fetch_pending_is_oldest_first_and_skips_terminal() {
        let store = MemoryCommandStore::new();
        let first = store
            .enqueue(new_command("key-f1", CommandKind::MouseMove))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .enqueue(new_command("key-f2", CommandKind::MouseMove))
            .await
            .unwrap();
        store
            .mark_done(first.command_id, CommandStatus::Completed, None)
            .await
            .unwrap();

        let pending = store.fetch_pending("prod-1", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_id, second.command_id);
    }

    #[tokio::test]
    async fn unregister_with_owner_guard_spares_newer_registrations() {
        let catalog = MemoryCatalog::new();
        let old_instance = Uuid::new_v4();
        let new_instance = Uuid::new_v4();

        let info = relay_protocol::ClientInfo {
            name: "desk".to_owned(),
            monitors: vec![],
            capabilities: vec![],
            hostname: None,
            user_id: None,
        };
        catalog
            .register(ProducerRecord::fresh("prod-1", &info, old_instance))
            .await
            .unwrap();
        // Reconnect lands on another instance; last writer wins.
        catalog
            .register(ProducerRecord::fresh("prod-1", &info, new_instance))
            .await
            .unwrap();

        // The stale session's guarded teardown must not delete the row.
        assert!(!catalog
            .unregister("prod-1", Some(old_instance))
            .await
            .unwrap());
        assert!(catalog.get("prod-1").await.unwrap().is_some());

        // The owning instance (or the janitor, with no guard) may delete it.
        assert!(catalog
            .unregister("prod-1", Some(new_instance))
            .await
            .unwrap());
        assert!(catalog.get("prod-1").await.unwrap().is_none());
    }
}
