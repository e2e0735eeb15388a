//! Telemetry publisher loop.
//!
//! Lifecycle: `Created -> Connected -> Running -> Stopping -> Stopped`.
//!
//! - `connect` registers a CONNECTION_LOST status as last will and opens the
//!   transport.
//! - `start` starts the simulator, announces VEHICLE_READY and spawns the
//!   telemetry task, which publishes one frame per committed simulator tick.
//! - `shutdown` stops telemetry and the simulator, publishes VEHICLE_STOPPED
//!   while the transport is still connected (a clean disconnect suppresses
//!   the will) and disconnects. Every step is best-effort; shutdown always
//!   ends in `Stopped`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vehiclesim::{SimulatorError, VehicleSimulator};

use crate::models::sensor::SensorMessage;
use crate::models::status::StatusMessage;
use crate::models::topics::{validate_vehicle_id, Topics, VehicleIdError};
use crate::models::types::{BrokerAddress, ConnectOptions, LastWill, Qos};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Created,
    Connected,
    Running,
    Stopping,
    Stopped,
}

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("cannot {action} while publisher is {state:?}")]
    InvalidState {
        action: &'static str,
        state: PublisherState,
    },
    #[error("failed to encode {what} message: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to connect to {address}: {source:#}")]
    Connect {
        address: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    InvalidVehicleId(#[from] VehicleIdError),
    #[error("failed to announce vehicle ready: {0:#}")]
    Announce(#[source] anyhow::Error),
    #[error(transparent)]
    Simulator(#[from] SimulatorError),
}

pub type PublisherResult<T> = Result<T, PublisherError>;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topics: Topics,
    /// Upper bound for a single publish (and the final disconnect).
    pub publish_timeout: Duration,
    pub qos: Qos,
}

impl PublisherConfig {
    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    /// Bound each publish by one simulator tick period.
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.publish_timeout = period;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topics: Topics::default(),
            publish_timeout: Duration::from_secs(1),
            qos: Qos::AtMostOnce,
        }
    }
}

/// Connect once, publish many: owns the simulator, the transport handle and
/// the telemetry task.
pub struct TelemetryPublisher<T: Transport + 'static> {
    cfg: PublisherConfig,
    transport: Arc<T>,
    simulator: VehicleSimulator,
    state: PublisherState,
    cancel: CancellationToken,
    telemetry_task: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> TelemetryPublisher<T> {
    pub fn new(cfg: PublisherConfig, transport: Arc<T>, simulator: VehicleSimulator) -> Self {
        Self {
            cfg,
            transport,
            simulator,
            state: PublisherState::Created,
            cancel: CancellationToken::new(),
            telemetry_task: None,
        }
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn vehicle_id(&self) -> &str {
        self.simulator.vehicle_id()
    }

    pub fn simulator(&self) -> &VehicleSimulator {
        &self.simulator
    }

    pub fn telemetry_topic(&self) -> String {
        self.cfg.topics.telemetry(self.vehicle_id())
    }

    /// CONNECTION_LOST status for the shared status topic.
    pub fn last_will(&self) -> PublisherResult<LastWill> {
        StatusMessage::connection_lost(self.vehicle_id())
            .to_last_will(&self.cfg.topics, self.cfg.qos)
            .map_err(|source| PublisherError::Encode {
                what: "last will",
                source,
            })
    }

    fn expect_state(&self, expected: PublisherState, action: &'static str) -> PublisherResult<()> {
        if self.state != expected {
            return Err(PublisherError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Open the transport with the last will registered. Failure is fatal
    /// for start-up and leaves the publisher in `Created`.
    pub async fn connect(&mut self, address: &BrokerAddress) -> PublisherResult<()> {
        self.expect_state(PublisherState::Created, "connect")?;
        validate_vehicle_id(self.vehicle_id())?;

        let options = ConnectOptions {
            address: address.clone(),
            client_id: self.vehicle_id().to_string(),
            last_will: Some(self.last_will()?),
        };
        self.transport
            .connect(options)
            .await
            .map_err(|source| PublisherError::Connect {
                address: address.to_string(),
                source,
            })?;

        info!(vehicle = %self.vehicle_id(), %address, "connected, last will registered");
        self.state = PublisherState::Connected;
        Ok(())
    }

    /// Start the simulator, announce VEHICLE_READY and begin publishing
    /// telemetry. If the announcement fails the simulator is stopped again
    /// and the publisher stays `Connected`.
    pub async fn start(&mut self) -> PublisherResult<()> {
        self.expect_state(PublisherState::Connected, "start")?;

        let ready = StatusMessage::ready(self.vehicle_id())
            .to_mqtt(&self.cfg.topics, self.cfg.qos)
            .map_err(|source| PublisherError::Encode {
                what: "ready status",
                source,
            })?;

        self.simulator.start()?;

        let announced = match tokio::time::timeout(self.cfg.publish_timeout, self.transport.publish(ready)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {:?}", self.cfg.publish_timeout)),
        };
        if let Err(e) = announced {
            if let Err(stop_err) = self.simulator.stop().await {
                warn!("simulator stop after failed announcement: {stop_err}");
            }
            return Err(PublisherError::Announce(e));
        }

        self.state = PublisherState::Running;
        self.telemetry_task = Some(self.spawn_telemetry_task());
        info!(vehicle = %self.vehicle_id(), topic = %self.telemetry_topic(), "publishing telemetry");
        Ok(())
    }

    fn spawn_telemetry_task(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let mut states = self.simulator.subscribe();
        let topics = self.cfg.topics.clone();
        let publish_timeout = self.cfg.publish_timeout;
        let qos = self.cfg.qos;
        let cancel = self.cancel.clone();

        // The current state goes out right away, then one frame per tick.
        tokio::spawn(async move {
            loop {
                let frame = SensorMessage::from(&*states.borrow_and_update());
                match frame.to_mqtt(&topics, qos) {
                    Ok(msg) => {
                        debug!("{} -> {}", msg.topic, msg.payload_str());
                        match tokio::time::timeout(publish_timeout, transport.publish(msg)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!("telemetry publish failed: {e:#}"),
                            Err(_) => warn!("telemetry publish timed out after {publish_timeout:?}"),
                        }
                    }
                    Err(e) => warn!("telemetry encode failed: {e}"),
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("telemetry task finished");
        })
    }

    /// Stop telemetry and the simulator, announce VEHICLE_STOPPED, disconnect.
    /// Never fails; problems are logged. Calling it again once `Stopped` is a
    /// no-op.
    pub async fn shutdown(&mut self) {
        if self.state == PublisherState::Stopped {
            return;
        }
        let connected = matches!(
            self.state,
            PublisherState::Connected | PublisherState::Running
        );
        self.state = PublisherState::Stopping;
        info!(vehicle = %self.vehicle_id(), "shutting down");

        self.cancel.cancel();
        if let Some(task) = self.telemetry_task.take() {
            if let Err(e) = task.await {
                warn!("telemetry task ended abnormally: {e}");
            }
        }

        if self.simulator.is_running() {
            if let Err(e) = self.simulator.stop().await {
                warn!("simulator stop failed: {e}");
            }
        }

        if connected {
            if self.transport.is_connected() {
                self.publish_stopped_status().await;
            } else {
                warn!("transport not connected, skipping stop status");
            }
            match tokio::time::timeout(self.cfg.publish_timeout, self.transport.disconnect()).await {
                Ok(Ok(())) => info!("disconnected"),
                Ok(Err(e)) => warn!("disconnect failed: {e:#}"),
                Err(_) => warn!("disconnect timed out after {:?}", self.cfg.publish_timeout),
            }
        }

        self.state = PublisherState::Stopped;
    }

    async fn publish_stopped_status(&self) {
        let msg = match StatusMessage::stopped(self.vehicle_id()).to_mqtt(&self.cfg.topics, self.cfg.qos) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("stop status encode failed: {e}");
                return;
            }
        };
        match tokio::time::timeout(self.cfg.publish_timeout, self.transport.publish(msg)).await {
            Ok(Ok(())) => info!("stop status published"),
            Ok(Err(e)) => warn!("stop status publish failed: {e:#}"),
            Err(_) => warn!("stop status publish timed out after {:?}", self.cfg.publish_timeout),
        }
    }

    /// Connect, start, wait for `signal`, then shut down.
    pub async fn run_until<F>(&mut self, address: &BrokerAddress, signal: F) -> PublisherResult<()>
    where
        F: Future<Output = ()>,
    {
        self.connect(address).await?;
        if let Err(e) = self.start().await {
            self.shutdown().await;
            return Err(e);
        }
        signal.await;
        self.shutdown().await;
        Ok(())
    }
}

impl<T: Transport + 'static> Drop for TelemetryPublisher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BrokerEvent, InMemoryBroker};
    use crate::models::status::StatusType;
    use crate::models::types::MqttPublish;
    use vehiclesim::{Coordinate, Route, SimulatorConfig};

    const STATUS: &str = "test/vehicles";

    fn address() -> BrokerAddress {
        "tcp://localhost:1883".parse().unwrap()
    }

    fn publisher(broker: Arc<InMemoryBroker>) -> TelemetryPublisher<InMemoryBroker> {
        let route = Route::from_coordinates([
            Coordinate::new(48.02352, 9.45453).unwrap(),
            Coordinate::new(49.00249, 9.48501).unwrap(),
        ]);
        let sim = VehicleSimulator::new(
            "postauto",
            route,
            SimulatorConfig::default().with_acceleration(0.0),
        );
        let cfg = PublisherConfig::default().with_topics(Topics::new(STATUS));
        TelemetryPublisher::new(cfg, broker, sim)
    }

    fn status_kinds(msgs: &[MqttPublish]) -> Vec<StatusType> {
        msgs.iter()
            .map(|m| StatusMessage::from_json(&m.payload).unwrap().kind)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_states_and_messages() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        assert_eq!(p.state(), PublisherState::Created);
        assert!(matches!(
            p.start().await,
            Err(PublisherError::InvalidState { state: PublisherState::Created, .. })
        ));

        p.connect(&address()).await.unwrap();
        assert_eq!(p.state(), PublisherState::Connected);
        let will = broker.registered_will().expect("will registered at connect");
        assert_eq!(will.topic, STATUS);
        assert_eq!(
            StatusMessage::from_json(&will.payload).unwrap().kind,
            StatusType::ConnectionLost
        );

        p.start().await.unwrap();
        assert_eq!(p.state(), PublisherState::Running);
        assert!(p.simulator().is_running());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        p.shutdown().await;
        assert_eq!(p.state(), PublisherState::Stopped);
        assert!(!p.simulator().is_running());

        let events = broker.events();
        assert!(matches!(&events[0], BrokerEvent::Connected { client_id } if client_id == "postauto"));
        match &events[1] {
            BrokerEvent::Published(m) => {
                assert_eq!(m.topic, STATUS);
                assert_eq!(status_kinds(std::slice::from_ref(m)), vec![StatusType::VehicleReady]);
            }
            other => panic!("expected ready status first, got {other:?}"),
        }

        let telemetry = broker.delivered_on(&format!("{STATUS}/postauto"));
        // t = 0, 1, 2
        assert_eq!(telemetry.len(), 3);
        let frames: Vec<SensorMessage> = telemetry
            .iter()
            .map(|m| SensorMessage::from_json(&m.payload).unwrap())
            .collect();
        assert!(frames.iter().all(|f| f.running && f.vehicle_id == "postauto"));
        assert!(frames[2].latitude > frames[0].latitude);

        assert_eq!(
            status_kinds(&broker.delivered_on(STATUS)),
            vec![StatusType::VehicleReady, StatusType::VehicleStopped]
        );
        assert_eq!(events.last(), Some(&BrokerEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_order_survives_failed_stop_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        broker.fail_next_publishes(1);
        p.shutdown().await;
        assert_eq!(p.state(), PublisherState::Stopped);
        assert!(!p.simulator().snapshot().running);

        let events = broker.events();
        assert_eq!(events.last(), Some(&BrokerEvent::Disconnected));
        // stop status was attempted and rejected; no will was delivered
        assert_eq!(status_kinds(&broker.delivered_on(STATUS)), vec![StatusType::VehicleReady]);
        assert!(!broker.drop_connection());

        // terminal
        p.shutdown().await;
        assert!(matches!(
            p.connect(&address()).await,
            Err(PublisherError::InvalidState { state: PublisherState::Stopped, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_status_is_last_before_disconnect() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3200)).await;
        p.shutdown().await;

        let events = broker.events();
        let n = events.len();
        match &events[n - 2] {
            BrokerEvent::Published(m) => {
                assert_eq!(m.topic, STATUS);
                assert_eq!(status_kinds(std::slice::from_ref(m)), vec![StatusType::VehicleStopped]);
            }
            other => panic!("expected stop status before disconnect, got {other:?}"),
        }
        assert_eq!(events[n - 1], BrokerEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abrupt_drop_delivers_connection_lost_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(broker.drop_connection());
        let lost: Vec<_> = broker
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BrokerEvent::WillDelivered(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].topic, STATUS);
        assert_eq!(status_kinds(&lost), vec![StatusType::ConnectionLost]);

        // telemetry keeps ticking against a dead connection without stopping the loop
        let attempts = broker.publish_attempts();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(broker.publish_attempts() >= attempts + 3);
        assert!(p.simulator().is_running());

        // no stop status is attempted over a connection that is already gone
        let attempts = broker.publish_attempts();
        p.shutdown().await;
        assert_eq!(p.state(), PublisherState::Stopped);
        assert_eq!(broker.publish_attempts(), attempts);
        assert_eq!(
            status_kinds(&broker.delivered_on(STATUS)),
            vec![StatusType::VehicleReady, StatusType::ConnectionLost]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_do_not_stop_ticks() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();

        broker.fail_next_publishes(2);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        // ticks at 0..=3: two rejected, two delivered
        assert_eq!(broker.delivered_on(&p.telemetry_topic()).len(), 2);
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_keeps_cadence() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();

        broker.set_publish_delay(Some(Duration::from_secs(30)));
        let before = broker.publish_attempts();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(broker.publish_attempts() - before >= 4);

        broker.set_publish_delay(None);
        p.shutdown().await;
        assert_eq!(p.state(), PublisherState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.refuse_connections(true);
        let mut p = publisher(broker.clone());

        let err = p.connect(&address()).await.unwrap_err();
        assert!(matches!(err, PublisherError::Connect { .. }));
        assert_eq!(p.state(), PublisherState::Created);
        assert!(!p.simulator().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ready_announcement_aborts_start() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();

        broker.fail_next_publishes(1);
        assert!(matches!(p.start().await, Err(PublisherError::Announce(_))));
        assert_eq!(p.state(), PublisherState::Connected);
        assert!(!p.simulator().is_running());

        p.start().await.unwrap();
        assert_eq!(p.state(), PublisherState::Running);
        p.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_signal() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.run_until(&address(), tokio::time::sleep(Duration::from_millis(1500)))
            .await
            .unwrap();

        assert_eq!(p.state(), PublisherState::Stopped);
        assert_eq!(broker.delivered_on(&p.telemetry_topic()).len(), 2);
        assert_eq!(
            status_kinds(&broker.delivered_on(STATUS)),
            vec![StatusType::VehicleReady, StatusType::VehicleStopped]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_follow_simulator_ticks() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        p.shutdown().await;

        let frames: Vec<SensorMessage> = broker
            .delivered_on(&p.telemetry_topic())
            .iter()
            .map(|m| SensorMessage::from_json(&m.payload).unwrap())
            .collect();
        // start position plus ticks 1..=3, none repeated
        assert_eq!(frames.len(), 4);
        assert!(frames.windows(2).all(|w| w[1].latitude > w[0].latitude));
        assert!(frames.iter().all(|f| f.running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disconnect_still_stops() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        broker.fail_disconnect(true);
        p.shutdown().await;
        assert_eq!(p.state(), PublisherState::Stopped);
        assert!(!p.simulator().is_running());
        assert!(broker.is_connected());

        match broker.events().last() {
            Some(BrokerEvent::Published(m)) => {
                assert_eq!(m.topic, STATUS);
                assert_eq!(status_kinds(std::slice::from_ref(m)), vec![StatusType::VehicleStopped]);
            }
            other => panic!("expected stop status as last event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_disconnect_is_bounded() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut p = publisher(broker.clone());
        p.connect(&address()).await.unwrap();
        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        broker.set_disconnect_delay(Some(Duration::from_secs(60)));
        let began = tokio::time::Instant::now();
        p.shutdown().await;
        assert_eq!(p.state(), PublisherState::Stopped);
        assert!(began.elapsed() < Duration::from_secs(2));

        let events = broker.events();
        assert!(!events.contains(&BrokerEvent::Disconnected));
        assert_eq!(
            status_kinds(&broker.delivered_on(STATUS)),
            vec![StatusType::VehicleReady, StatusType::VehicleStopped]
        );
    }

    #[tokio::test]
    async fn test_wildcard_vehicle_id_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let sim = VehicleSimulator::new("bus#1", Route::default(), SimulatorConfig::default());
        let mut p = TelemetryPublisher::new(PublisherConfig::default(), broker.clone(), sim);

        assert!(matches!(
            p.connect(&address()).await,
            Err(PublisherError::InvalidVehicleId(VehicleIdError::ForbiddenChar(_, '#')))
        ));
        assert_eq!(p.state(), PublisherState::Created);
        assert!(broker.events().is_empty());
    }

    #[test]
    fn test_telemetry_topic_is_stable() {
        let p = publisher(Arc::new(InMemoryBroker::new()));
        assert_eq!(p.telemetry_topic(), format!("{STATUS}/postauto"));
        assert_eq!(p.telemetry_topic(), p.telemetry_topic());
    }
}
