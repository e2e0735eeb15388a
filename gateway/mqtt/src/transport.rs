use anyhow::Result;
use async_trait::async_trait;

use crate::models::types::{ConnectOptions, MqttPublish};

/// Publish side of a pub/sub broker connection.
///
/// Methods take `&self` so the publisher loop and the shutdown path can share
/// one connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. The last will in `options` must be registered
    /// with the broker as part of this call.
    async fn connect(&self, options: ConnectOptions) -> Result<()>;

    async fn publish(&self, msg: MqttPublish) -> Result<()>;

    /// Graceful disconnect. The broker discards the last will.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}
