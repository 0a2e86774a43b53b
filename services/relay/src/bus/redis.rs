//! Redis pub/sub bus for multi-instance deployments.
//!
//! Publishes go through a shared `ConnectionManager` (auto-reconnecting);
//! each subscription is its own pubsub connection covering every relay
//! channel.  Payloads are the JSON-serialized [`BusEvent`], self-describing
//! via its `event` tag.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{channels, BusEvent, BusStream, RealtimeBus};
use crate::error::BusError;

pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl RealtimeBus for RedisBus {
    async fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(event.channel(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn BusStream>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels::ALL {
            pubsub.subscribe(channel).await?;
        }
        Ok(Box::new(RedisStream {
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }
}

struct RedisStream {
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl BusStream for RedisStream {
    async fn recv(&mut self) -> Result<BusEvent, BusError> {
        match self.messages.next().await {
            Some(msg) => {
                let payload: String = msg.get_payload()?;
                Ok(serde_json::from_str(&payload)?)
            }
            None => Err(BusError::Closed),
        }
    }
}
