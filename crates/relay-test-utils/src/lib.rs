// relay-test-utils: Shared test utilities for the relay suite.
//
// Provides a mock WebSocket client for integration testing of producer and
// viewer sessions against a running relay instance.

pub mod mock_ws_client;

pub use mock_ws_client::{MockWsClient, ServerEvent};
