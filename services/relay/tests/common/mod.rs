#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay::bus::memory::InProcessBus;
use relay::bus::RealtimeBus;
use relay::config::RelayConfig;
use relay::error::StoreError;
use relay::store::memory::{MemoryCatalog, MemoryCommandStore};
use relay::store::{Catalog, CommandStore, ProducerRecord};
use relay::{janitor, router, AppState};
use relay_protocol::{ClientInfo, CommandRequest, FrameData, FrameFormat, FrameMetadata, Handshake, MonitorInfo, WsMessage};
use relay_test_utils::MockWsClient;
use uuid::Uuid;

/// Timings tightened for tests: sweeps and result polling run fast, sockets
/// stay patient enough not to interfere.
pub fn fast_config() -> RelayConfig {
    RelayConfig {
        heartbeat_timeout: Duration::from_secs(10),
        janitor_period: Duration::from_millis(100),
        result_poll_interval: Duration::from_millis(25),
        // Large enough that in-order suites never saturate; the drop-oldest
        // law itself is covered by the outbox unit tests.
        frame_queue_depth: 256,
        ..RelayConfig::default()
    }
}

/// Shared durable backend, standing in for the cluster's Postgres + Redis.
pub struct Backend {
    pub catalog: Arc<MemoryCatalog>,
    pub commands: Arc<MemoryCommandStore>,
    pub bus: Arc<InProcessBus>,
}

impl Backend {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(MemoryCatalog::new()),
            commands: Arc::new(MemoryCommandStore::new()),
            bus: Arc::new(InProcessBus::new()),
        }
    }
}

pub struct TestInstance {
    pub state: AppState,
    pub url: String,
}

pub async fn start_instance(
    config: RelayConfig,
    catalog: Arc<dyn Catalog>,
    commands: Arc<dyn CommandStore>,
    bus: Arc<dyn RealtimeBus>,
) -> TestInstance {
    let state = AppState::new(Arc::new(config), catalog, commands, bus);
    router::spawn_bus_listener(state.clone()).await;
    janitor::spawn(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = relay::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestInstance {
        state,
        url: format!("ws://{addr}"),
    }
}

pub async fn start_pair(config: RelayConfig) -> (Backend, TestInstance, TestInstance) {
    let backend = Backend::new();
    let a = start_instance(
        config.clone(),
        backend.catalog.clone(),
        backend.commands.clone(),
        backend.bus.clone(),
    )
    .await;
    let b = start_instance(
        config,
        backend.catalog.clone(),
        backend.commands.clone(),
        backend.bus.clone(),
    )
    .await;
    (backend, a, b)
}

pub fn monitor(id: &str, index: u32) -> MonitorInfo {
    MonitorInfo {
        id: id.to_owned(),
        index,
        name: format!("display-{index}"),
        width: 1920,
        height: 1080,
    }
}

pub fn client_info(name: &str, monitor_ids: &[&str]) -> ClientInfo {
    ClientInfo {
        name: name.to_owned(),
        monitors: monitor_ids
            .iter()
            .enumerate()
            .map(|(index, id)| monitor(id, index as u32))
            .collect(),
        capabilities: vec!["capture".to_owned(), "mouse".to_owned(), "keyboard".to_owned()],
        hostname: Some("test-host".to_owned()),
        user_id: None,
    }
}

pub fn producer_handshake(name: &str, monitor_ids: &[&str]) -> WsMessage {
    WsMessage::Handshake(Handshake {
        client_info: client_info(name, monitor_ids),
    })
}

pub fn viewer_handshake(name: &str) -> WsMessage {
    WsMessage::Handshake(Handshake {
        client_info: ClientInfo {
            name: name.to_owned(),
            monitors: vec![],
            capabilities: vec![],
            hostname: None,
            user_id: None,
        },
    })
}

pub fn frame(monitor_id: &str, frame_number: u64) -> WsMessage {
    WsMessage::FrameData(FrameData {
        producer_id: None,
        monitor_id: monitor_id.to_owned(),
        frame_number,
        frame_data: "ZnJhbWUtcGF5bG9hZA==".to_owned(),
        metadata: FrameMetadata {
            width: 1920,
            height: 1080,
            format: FrameFormat::Jpeg,
        },
        timestamp: None,
    })
}

pub fn command_request(producer_id: &str, params: &[(&str, serde_json::Value)]) -> CommandRequest {
    let mut map = serde_json::Map::new();
    for (key, value) in params {
        map.insert((*key).to_owned(), value.clone());
    }
    CommandRequest {
        desktop_client_id: producer_id.to_owned(),
        monitor_id: None,
        params: map,
    }
}

/// Connects a producer, completes its handshake, and asserts registration.
pub async fn register_producer(url: &str, producer_id: &str, monitor_ids: &[&str]) -> MockWsClient {
    let mut client = MockWsClient::connect_producer(url, producer_id).await.unwrap();
    client
        .send_message(&producer_handshake("test-desktop", monitor_ids))
        .await
        .unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::HandshakeAck(ack) => {
            assert_eq!(ack.client_id, producer_id);
            assert!(ack.db_registered);
        }
        other => panic!("expected handshake_ack, got {other:?}"),
    }
    client
}

/// Connects a viewer and completes its handshake; returns the client and the
/// relay-assigned viewer id.
pub async fn connect_viewer_session(url: &str) -> (MockWsClient, String) {
    let mut client = MockWsClient::connect_viewer(url).await.unwrap();
    client.send_message(&viewer_handshake("test-viewer")).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::HandshakeAck(ack) => {
            assert!(!ack.client_id.is_empty());
            assert!(!ack.db_registered);
            (client, ack.client_id)
        }
        other => panic!("expected handshake_ack, got {other:?}"),
    }
}

/// Round-trips a `list_producers` so every message the viewer sent before it
/// is known to be processed.
pub async fn sync_viewer(viewer: &mut MockWsClient) {
    viewer.send_message(&WsMessage::ListProducers).await.unwrap();
    viewer
        .recv_until(Duration::from_secs(5), |m| {
            matches!(m, WsMessage::ProducerList(_))
        })
        .await
        .unwrap();
}

/// Catalog wrapper that fails registration on demand.
pub struct FailingCatalog {
    inner: MemoryCatalog,
    pub fail_register: AtomicBool,
}

impl FailingCatalog {
    pub fn new() -> Self {
        Self {
            inner: MemoryCatalog::new(),
            fail_register: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Catalog for FailingCatalog {
    async fn register(&self, record: ProducerRecord) -> Result<(), StoreError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }
        self.inner.register(record).await
    }

    async fn heartbeat(&self, producer_id: &str) -> Result<(), StoreError> {
        self.inner.heartbeat(producer_id).await
    }

    async fn set_streaming(&self, producer_id: &str, streaming: bool) -> Result<(), StoreError> {
        self.inner.set_streaming(producer_id, streaming).await
    }

    async fn unregister(
        &self,
        producer_id: &str,
        only_if_owned_by: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        self.inner.unregister(producer_id, only_if_owned_by).await
    }

    async fn get(&self, producer_id: &str) -> Result<Option<ProducerRecord>, StoreError> {
        self.inner.get(producer_id).await
    }

    async fn list_active(&self) -> Result<Vec<ProducerRecord>, StoreError> {
        self.inner.list_active().await
    }
}
