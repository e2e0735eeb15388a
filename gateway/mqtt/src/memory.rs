//! In-process broker used for dry runs and tests.
//!
//! Behaves like a single-client MQTT broker with one passive subscriber:
//! every accepted publish is recorded, the last will is held from connect
//! until a clean disconnect, and [`InMemoryBroker::drop_connection`] plays the
//! part of a network failure by delivering the will itself.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use async_trait::async_trait;
use tracing::info;

use crate::models::types::{ConnectOptions, LastWill, MqttPublish};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected { client_id: String },
    Published(MqttPublish),
    /// Delivered by the broker on an abrupt drop, not by the client.
    WillDelivered(MqttPublish),
    Disconnected,
}

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    will: Option<LastWill>,
    events: Vec<BrokerEvent>,
    publish_attempts: u64,
    refuse_connect: bool,
    failing_publishes: usize,
    fail_disconnect: bool,
    publish_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state().failing_publishes = count;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.state().fail_disconnect = fail;
    }

    /// Make every publish take `delay` before it is accepted.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.state().publish_delay = delay;
    }

    /// Make disconnect take `delay` before the broker acknowledges it.
    pub fn set_disconnect_delay(&self, delay: Option<Duration>) {
        self.state().disconnect_delay = delay;
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state().events.clone()
    }

    pub fn registered_will(&self) -> Option<LastWill> {
        self.state().will.clone()
    }

    pub fn publish_attempts(&self) -> u64 {
        self.state().publish_attempts
    }

    /// Everything a subscriber on `topic` would have received, in order.
    pub fn delivered_on(&self, topic: &str) -> Vec<MqttPublish> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                BrokerEvent::Published(p) | BrokerEvent::WillDelivered(p) if p.topic == topic => {
                    Some(p.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Simulate the network dropping the client. Returns true if the broker
    /// delivered a last will as a result.
    pub fn drop_connection(&self) -> bool {
        let mut state = self.state();
        if !state.connected {
            return false;
        }
        state.connected = false;
        match state.will.take() {
            Some(will) => {
                info!("in-memory broker: connection dropped, delivering last will to '{}'", will.topic);
                state.events.push(BrokerEvent::WillDelivered(will.into()));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, options: ConnectOptions) -> Result<()> {
        let mut state = self.state();
        if state.refuse_connect {
            bail!("connection to {} refused", options.address);
        }
        ensure!(!state.connected, "already connected");

        state.connected = true;
        state.will = options.last_will;
        state.events.push(BrokerEvent::Connected {
            client_id: options.client_id,
        });
        Ok(())
    }

    async fn publish(&self, msg: MqttPublish) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.publish_attempts += 1;
            state.publish_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        ensure!(state.connected, "not connected");
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            bail!("publish to '{}' rejected", msg.topic);
        }
        info!("in-memory broker: {} -> {}", msg.topic, msg.payload_str());
        state.events.push(BrokerEvent::Published(msg));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let delay = self.state().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_disconnect {
            bail!("disconnect failed");
        }
        ensure!(state.connected, "not connected");

        // a clean disconnect discards the will
        state.connected = false;
        state.will = None;
        state.events.push(BrokerEvent::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}
