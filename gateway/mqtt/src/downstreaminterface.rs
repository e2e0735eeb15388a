use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::types::{ConnectOptions, LastWill, MqttPublish, Qos};
use crate::transport::Transport;

/// How long the event loop may take to flush DISCONNECT before it is cancelled.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    pub keep_alive_secs: u64,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 50,
            username: None,
            password: None,
        }
    }
}

fn map_qos(q: Qos) -> QoS {
    match q {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn map_will(will: &LastWill) -> rumqttc::LastWill {
    rumqttc::LastWill::new(
        will.topic.clone(),
        will.payload.clone(),
        map_qos(will.qos),
        will.retain,
    )
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    event_task: JoinHandle<()>,
}

/// [`Transport`] backed by a rumqttc client and its polled event loop.
pub struct MqttTransport {
    cfg: MqttTransportConfig,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new(cfg: MqttTransportConfig) -> Self {
        Self {
            cfg,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn mqtt_options(&self, options: &ConnectOptions) -> MqttOptions {
        let mut opts = MqttOptions::new(
            &options.client_id,
            &options.address.host,
            options.address.port,
        );
        opts.set_keep_alive(Duration::from_secs(self.cfg.keep_alive_secs));
        opts.set_clean_session(true);

        if let (Some(u), Some(p)) = (self.cfg.username.clone(), self.cfg.password.clone()) {
            opts.set_credentials(u, p);
        }
        if let Some(will) = &options.last_will {
            opts.set_last_will(map_will(will));
        }
        opts
    }
}

/// Drive the event loop until the broker acknowledges the connection.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("broker refused connection: {:?}", ack.code);
                }
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) => return Err(e).context("MQTT connection failed"),
        }
    }
}

fn spawn_event_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = eventloop.poll() => match ev {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if !connected.swap(true, Ordering::AcqRel) {
                            info!("MQTT connection re-established");
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent");
                        connected.store(false, Ordering::Release);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.swap(false, Ordering::AcqRel) {
                            warn!("MQTT connection lost: {e} (retrying)");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            bail!("already connected to a broker");
        }

        let (client, mut eventloop) =
            AsyncClient::new(self.mqtt_options(&options), self.cfg.channel_capacity);

        tokio::time::timeout(self.cfg.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .with_context(|| format!("timed out connecting to {}", options.address))?
            .with_context(|| format!("connect to {} failed", options.address))?;

        self.connected.store(true, Ordering::Release);
        info!(
            "MQTT connected to {} as '{}' (last will: {})",
            options.address,
            options.client_id,
            options.last_will.as_ref().map(|w| w.topic.as_str()).unwrap_or("none")
        );

        let cancel = CancellationToken::new();
        let event_task = spawn_event_loop(eventloop, self.connected.clone(), cancel.clone());
        *session = Some(Session {
            client,
            cancel,
            event_task,
        });
        Ok(())
    }

    async fn publish(&self, msg: MqttPublish) -> Result<()> {
        let client = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .context("not connected")?;

        client
            .publish(msg.topic, map_qos(msg.qos), msg.retain, msg.payload)
            .await
            .context("publish failed")?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .context("disconnect request failed");

        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.event_task)
            .await
            .is_err()
        {
            session.cancel.cancel();
            let _ = session.event_task.await;
        }
        self.connected.store(false, Ordering::Release);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.cancel.cancel();
        }
    }
}
