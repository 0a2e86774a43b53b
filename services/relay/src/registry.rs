//! C4: per-instance index of locally connected producers and viewers.
//!
//! Both maps die with the process.  Fan-out never sends while holding a lock;
//! callers snapshot the handles first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use relay_protocol::WsMessage;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::outbox::ViewerOutbox;

/// Live producer session handle: the writer-queue sender plus liveness
/// bookkeeping.  Dropping the last clone of `outbound` ends the writer task.
pub struct ProducerHandle {
    pub producer_id: String,
    pub session_id: Uuid,
    outbound: mpsc::Sender<WsMessage>,
    last_activity_ms: AtomicI64,
    cancel: CancellationToken,
}

impl ProducerHandle {
    pub fn new(
        producer_id: String,
        session_id: Uuid,
        outbound: mpsc::Sender<WsMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            producer_id,
            session_id,
            outbound,
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            cancel,
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        std::time::Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Hands a message to the writer task.  False means the session is gone
    /// (channel closed) or hopelessly backed up.
    pub async fn send(&self, msg: WsMessage) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// What a viewer wants to see: specific (producer, monitor) pairs, whole
/// producers, or everything.
#[derive(Debug, Default, Clone)]
pub struct Subscription {
    all_producers: bool,
    entries: HashSet<(String, Option<String>)>,
}

impl Subscription {
    pub fn subscribe(&mut self, producer_id: Option<String>, monitor_id: Option<String>) {
        match producer_id {
            None => self.all_producers = true,
            Some(producer) => {
                self.entries.insert((producer, monitor_id));
            }
        }
    }

    pub fn unsubscribe(&mut self, producer_id: Option<&str>, monitor_id: Option<&str>) {
        match producer_id {
            None => {
                self.all_producers = false;
                self.entries.clear();
            }
            Some(producer) => match monitor_id {
                // Dropping a producer without naming a monitor drops every
                // entry for it.
                None => self.entries.retain(|(p, _)| p != producer),
                Some(monitor) => {
                    self.entries
                        .remove(&(producer.to_owned(), Some(monitor.to_owned())));
                }
            },
        }
    }

    pub fn matches(&self, producer_id: &str, monitor_id: &str) -> bool {
        self.all_producers
            || self.entries.iter().any(|(p, m)| {
                p == producer_id && m.as_deref().is_none_or(|m| m == monitor_id)
            })
    }

    pub fn is_empty(&self) -> bool {
        !self.all_producers && self.entries.is_empty()
    }
}

/// Live viewer session handle.
pub struct ViewerHandle {
    pub viewer_id: String,
    pub session_id: Uuid,
    pub outbox: Arc<ViewerOutbox>,
    subscription: RwLock<Subscription>,
    cancel: CancellationToken,
}

impl ViewerHandle {
    pub fn new(
        viewer_id: String,
        session_id: Uuid,
        outbox: Arc<ViewerOutbox>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            viewer_id,
            session_id,
            outbox,
            subscription: RwLock::new(Subscription::default()),
            cancel,
        }
    }

    pub async fn subscribe(&self, producer_id: Option<String>, monitor_id: Option<String>) {
        self.subscription
            .write()
            .await
            .subscribe(producer_id, monitor_id);
    }

    pub async fn unsubscribe(&self, producer_id: Option<&str>, monitor_id: Option<&str>) {
        self.subscription
            .write()
            .await
            .unsubscribe(producer_id, monitor_id);
    }

    pub async fn subscription_matches(&self, producer_id: &str, monitor_id: &str) -> bool {
        self.subscription.read().await.matches(producer_id, monitor_id)
    }

    /// Lossless enqueue for catalog updates and command acks.  On overflow
    /// the viewer is disconnected as a slow consumer.
    pub async fn send_control(&self, msg: WsMessage) -> bool {
        if self.outbox.push_control(msg).await.is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    producers: RwLock<HashMap<String, Arc<ProducerHandle>>>,
    viewers: RwLock<HashMap<String, Arc<ViewerHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a producer handle, returning any displaced session for the
    /// same id (the caller shuts it down).
    pub async fn insert_producer(
        &self,
        handle: Arc<ProducerHandle>,
    ) -> Option<Arc<ProducerHandle>> {
        self.producers
            .write()
            .await
            .insert(handle.producer_id.clone(), handle)
    }

    /// Removes the producer only while the given session still owns the
    /// entry, so a replaced session's teardown cannot evict its successor.
    pub async fn remove_producer_session(&self, producer_id: &str, session_id: Uuid) -> bool {
        let mut producers = self.producers.write().await;
        if producers
            .get(producer_id)
            .is_some_and(|h| h.session_id == session_id)
        {
            producers.remove(producer_id);
            return true;
        }
        false
    }

    pub async fn get_producer(&self, producer_id: &str) -> Option<Arc<ProducerHandle>> {
        self.producers.read().await.get(producer_id).cloned()
    }

    pub async fn producer_ids(&self) -> HashSet<String> {
        self.producers.read().await.keys().cloned().collect()
    }

    pub async fn snapshot_producers(&self) -> Vec<Arc<ProducerHandle>> {
        self.producers.read().await.values().cloned().collect()
    }

    pub async fn insert_viewer(&self, handle: Arc<ViewerHandle>) -> Option<Arc<ViewerHandle>> {
        self.viewers
            .write()
            .await
            .insert(handle.viewer_id.clone(), handle)
    }

    pub async fn remove_viewer_session(&self, viewer_id: &str, session_id: Uuid) -> bool {
        let mut viewers = self.viewers.write().await;
        if viewers
            .get(viewer_id)
            .is_some_and(|h| h.session_id == session_id)
        {
            viewers.remove(viewer_id);
            return true;
        }
        false
    }

    pub async fn get_viewer(&self, viewer_id: &str) -> Option<Arc<ViewerHandle>> {
        self.viewers.read().await.get(viewer_id).cloned()
    }

    pub async fn snapshot_viewers(&self) -> Vec<Arc<ViewerHandle>> {
        self.viewers.read().await.values().cloned().collect()
    }
}
