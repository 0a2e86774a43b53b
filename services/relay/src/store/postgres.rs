//! Postgres-backed catalog and command store.
//!
//! Plain runtime queries (no compile-time macro checking) so the workspace
//! builds without a live database; every statement stays one operation per
//! method.  Transient failures get a bounded retry with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use relay_protocol::{CommandStatus, MonitorInfo};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use super::{Catalog, CommandRecord, CommandStore, NewCommand, ProducerRecord};
use crate::error::StoreError;

const MAX_ATTEMPTS: u32 = 3;

async fn with_retry<'a, T, F>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> BoxFuture<'a, Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < MAX_ATTEMPTS && e.is_transient() => {
                attempt += 1;
                warn!(error = %e, attempt, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn producer_from_row(row: &PgRow) -> Result<ProducerRecord, sqlx::Error> {
    let monitors: sqlx::types::Json<Vec<MonitorInfo>> = row.try_get("monitors")?;
    let capabilities: sqlx::types::Json<Vec<String>> = row.try_get("capabilities")?;
    Ok(ProducerRecord {
        producer_id: row.try_get("producer_id")?,
        display_name: row.try_get("display_name")?,
        hostname: row.try_get("hostname")?,
        owner_id: row.try_get("owner_id")?,
        monitors: monitors.0,
        capabilities: capabilities.0,
        is_streaming: row.try_get("is_streaming")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        owning_instance_id: row.try_get("owning_instance_id")?,
        connected_at: row.try_get("connected_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn register(&self, record: ProducerRecord) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            let record = record.clone();
            async move {
                sqlx::query(
                    r#"INSERT INTO active_desktop_clients
                           (producer_id, display_name, hostname, owner_id, monitors,
                            capabilities, is_streaming, last_heartbeat, owning_instance_id,
                            connected_at, updated_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                       ON CONFLICT (producer_id) DO UPDATE SET
                           display_name = EXCLUDED.display_name,
                           hostname = EXCLUDED.hostname,
                           owner_id = EXCLUDED.owner_id,
                           monitors = EXCLUDED.monitors,
                           capabilities = EXCLUDED.capabilities,
                           is_streaming = EXCLUDED.is_streaming,
                           last_heartbeat = EXCLUDED.last_heartbeat,
                           owning_instance_id = EXCLUDED.owning_instance_id,
                           connected_at = EXCLUDED.connected_at,
                           updated_at = EXCLUDED.updated_at"#,
                )
                .bind(&record.producer_id)
                .bind(&record.display_name)
                .bind(&record.hostname)
                .bind(&record.owner_id)
                .bind(sqlx::types::Json(&record.monitors))
                .bind(sqlx::types::Json(&record.capabilities))
                .bind(record.is_streaming)
                .bind(record.last_heartbeat)
                .bind(record.owning_instance_id)
                .bind(record.connected_at)
                .bind(record.updated_at)
                .execute(pool)
                .await
                .map_err(StoreError::from)?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn heartbeat(&self, producer_id: &str) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                sqlx::query(
                    "UPDATE active_desktop_clients
                     SET last_heartbeat = now(), updated_at = now()
                     WHERE producer_id = $1",
                )
                .bind(producer_id)
                .execute(pool)
                .await
                .map_err(StoreError::from)?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn set_streaming(&self, producer_id: &str, streaming: bool) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                sqlx::query(
                    "UPDATE active_desktop_clients
                     SET is_streaming = $2, updated_at = now()
                     WHERE producer_id = $1",
                )
                .bind(producer_id)
                .bind(streaming)
                .execute(pool)
                .await
                .map_err(StoreError::from)?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn unregister(
        &self,
        producer_id: &str,
        only_if_owned_by: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let result = match only_if_owned_by {
                    Some(instance_id) => {
                        sqlx::query(
                            "DELETE FROM active_desktop_clients
                             WHERE producer_id = $1 AND owning_instance_id = $2",
                        )
                        .bind(producer_id)
                        .bind(instance_id)
                        .execute(pool)
                        .await
                    }
                    None => {
                        sqlx::query("DELETE FROM active_desktop_clients WHERE producer_id = $1")
                            .bind(producer_id)
                            .execute(pool)
                            .await
                    }
                }
                .map_err(StoreError::from)?;
                Ok(result.rows_affected() > 0)
            }
            .boxed()
        })
        .await
    }

    async fn get(&self, producer_id: &str) -> Result<Option<ProducerRecord>, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let row = sqlx::query("SELECT * FROM active_desktop_clients WHERE producer_id = $1")
                    .bind(producer_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(StoreError::from)?;
                row.as_ref()
                    .map(producer_from_row)
                    .transpose()
                    .map_err(StoreError::from)
            }
            .boxed()
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<ProducerRecord>, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let rows = sqlx::query("SELECT * FROM active_desktop_clients ORDER BY connected_at")
                    .fetch_all(pool)
                    .await
                    .map_err(StoreError::from)?;
                rows.iter()
                    .map(producer_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from)
            }
            .boxed()
        })
        .await
    }
}

pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn command_from_row(row: &PgRow) -> Result<CommandRecord, sqlx::Error> {
    let kind: String = row.try_get("command_type")?;
    let kind = kind
        .parse()
        .map_err(|()| sqlx::Error::Decode(format!("unknown command kind: {kind}").into()))?;
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "pending" => CommandStatus::Pending,
        "completed" => CommandStatus::Completed,
        "failed" => CommandStatus::Failed,
        other => {
            return Err(sqlx::Error::Decode(
                format!("unknown command status: {other}").into(),
            ))
        }
    };
    let data: sqlx::types::Json<serde_json::Value> = row.try_get("command_data")?;
    let monitor_id = data
        .0
        .get("monitorId")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned);
    let params = data.0.get("params").cloned().unwrap_or(serde_json::Value::Null);
    Ok(CommandRecord {
        command_id: row.try_get("id")?,
        producer_id: row.try_get("desktop_client_id")?,
        target_instance_id: row.try_get("target_instance_id")?,
        kind,
        monitor_id,
        params,
        idempotency_key: row.try_get("idempotency_key")?,
        status,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn enqueue(&self, command: NewCommand) -> Result<CommandRecord, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            let command = command.clone();
            async move {
                let data = serde_json::json!({
                    "monitorId": command.monitor_id,
                    "params": command.params,
                });
                let inserted = sqlx::query(
                    r#"INSERT INTO desktop_commands
                           (id, desktop_client_id, command_type, command_data, status,
                            target_instance_id, idempotency_key)
                       VALUES ($1, $2, $3, $4, 'pending', $5, $6)
                       ON CONFLICT (idempotency_key) DO NOTHING
                       RETURNING *"#,
                )
                .bind(command.command_id)
                .bind(&command.producer_id)
                .bind(command.kind.as_str())
                .bind(sqlx::types::Json(data))
                .bind(command.target_instance_id)
                .bind(&command.idempotency_key)
                .fetch_optional(pool)
                .await
                .map_err(StoreError::from)?;

                if let Some(row) = inserted {
                    return command_from_row(&row).map_err(StoreError::from);
                }
                // Duplicate idempotency key: hand back the existing record.
                let existing =
                    sqlx::query("SELECT * FROM desktop_commands WHERE idempotency_key = $1")
                        .bind(&command.idempotency_key)
                        .fetch_one(pool)
                        .await
                        .map_err(StoreError::from)?;
                command_from_row(&existing).map_err(StoreError::from)
            }
            .boxed()
        })
        .await
    }

    async fn fetch_pending(
        &self,
        producer_id: &str,
        max: u32,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let rows = sqlx::query(
                    "SELECT * FROM desktop_commands
                     WHERE desktop_client_id = $1 AND status = 'pending'
                     ORDER BY created_at ASC
                     LIMIT $2",
                )
                .bind(producer_id)
                .bind(i64::from(max))
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)?;
                rows.iter()
                    .map(command_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from)
            }
            .boxed()
        })
        .await
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
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let result = sqlx::query(
                    "UPDATE desktop_commands
                     SET status = $2, processed_at = now(), error_message = $3
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(command_id)
                .bind(status.as_str())
                .bind(error)
                .execute(pool)
                .await
                .map_err(StoreError::from)?;
                Ok(result.rows_affected() > 0)
            }
            .boxed()
        })
        .await
    }

    async fn get(&self, command_id: Uuid) -> Result<Option<CommandRecord>, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let row = sqlx::query("SELECT * FROM desktop_commands WHERE id = $1")
                    .bind(command_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(StoreError::from)?;
                row.as_ref()
                    .map(command_from_row)
                    .transpose()
                    .map_err(StoreError::from)
            }
            .boxed()
        })
        .await
    }

    async fn expire(
        &self,
        streaming_ttl: Duration,
        action_ttl: Duration,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let pool = &self.pool;
        with_retry(|| {
            async move {
                let rows = sqlx::query(
                    r#"UPDATE desktop_commands
                       SET status = 'failed', processed_at = now(), error_message = 'expired'
                       WHERE status = 'pending'
                         AND (
                             (command_type IN ('start_capture', 'stop_capture')
                              AND created_at < now() - make_interval(secs => $1))
                             OR
                             (command_type NOT IN ('start_capture', 'stop_capture')
                              AND created_at < now() - make_interval(secs => $2))
                         )
                       RETURNING *"#,
                )
                .bind(streaming_ttl.as_secs_f64())
                .bind(action_ttl.as_secs_f64())
                .fetch_all(pool)
                .await
                .map_err(StoreError::from)?;
                rows.iter()
                    .map(command_from_row)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from)
            }
            .boxed()
        })
        .await
    }
}
