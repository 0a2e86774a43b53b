//! In-process bus for single-instance deployments and tests.
//!
//! Instances sharing one `InProcessBus` see each other's events, which is
//! exactly what the cross-instance integration tests exploit.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use super::{BusEvent, BusStream, RealtimeBus};
use crate::error::BusError;

pub struct InProcessBus {
    tx: broadcast::Sender<BusEvent>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeBus for InProcessBus {
    async fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        // No subscribers is fine; the bus is best-effort.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn BusStream>, BusError> {
        Ok(Box::new(InProcessStream {
            rx: self.tx.subscribe(),
        }))
    }
}

struct InProcessStream {
    rx: broadcast::Receiver<BusEvent>,
}

#[async_trait]
impl BusStream for InProcessStream {
    async fn recv(&mut self) -> Result<BusEvent, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-process bus receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}
