//! C8: one periodic task per instance.
//!
//! Locally it evicts producers whose sockets went quiet; globally it prunes
//! catalog rows no instance refreshed within the grace window (safe to race,
//! deletes are idempotent), expires overdue pending commands, and trims the
//! idempotency cache.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::CatalogChange;
use crate::router;
use crate::state::AppState;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.janitor_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh instance does
        // not prune before anyone had a chance to heartbeat.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_once(&state).await;
        }
    })
}

/// One sweep.  Public so tests can drive the janitor without waiting out the
/// period.
pub async fn run_once(state: &AppState) {
    evict_stale_local_producers(state).await;
    prune_catalog(state).await;
    expire_commands(state).await;
    let purged = state
        .recent_keys
        .purge_older_than(state.config.idempotency_window)
        .await;
    if purged > 0 {
        debug!(purged, "idempotency keys purged");
    }
}

async fn evict_stale_local_producers(state: &AppState) {
    for handle in state.registry.snapshot_producers().await {
        if handle.idle_for() > state.config.heartbeat_timeout {
            warn!(producer_id = %handle.producer_id, "heartbeat timeout, evicting producer");
            // Session teardown unregisters and announces the disconnect.
            handle.shutdown();
        }
    }
}

async fn prune_catalog(state: &AppState) {
    let records = match state.catalog.list_active().await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "catalog scan failed");
            return;
        }
    };
    let now = Utc::now();
    let grace = state.config.grace_window_chrono();
    for record in records {
        if now.signed_duration_since(record.updated_at) <= grace {
            continue;
        }
        match state.catalog.unregister(&record.producer_id, None).await {
            Ok(true) => {
                info!(producer_id = %record.producer_id, "pruned stale catalog entry");
                router::announce_catalog_change(
                    state,
                    &record.producer_id,
                    CatalogChange::Disconnected,
                )
                .await;
            }
            // Another instance's janitor got there first.
            Ok(false) => {}
            Err(e) => warn!(error = %e, producer_id = %record.producer_id, "prune failed"),
        }
    }
}

async fn expire_commands(state: &AppState) {
    match state
        .commands
        .expire(
            state.config.streaming_command_ttl,
            state.config.action_command_ttl,
        )
        .await
    {
        Ok(expired) if !expired.is_empty() => {
            info!(count = expired.len(), "expired pending commands");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "command expiry sweep failed"),
    }
}
