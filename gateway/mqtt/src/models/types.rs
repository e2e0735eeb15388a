use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// ---- Transport-level MQTT types ----

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub qos: Qos,
}

impl MqttPublish {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Message the broker publishes on the client's behalf when the connection
/// drops without a clean DISCONNECT. Registered once, at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl From<LastWill> for MqttPublish {
    fn from(will: LastWill) -> Self {
        MqttPublish {
            topic: will.topic,
            payload: will.payload,
            retain: will.retain,
            qos: will.qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub address: BrokerAddress,
    pub client_id: String,
    pub last_will: Option<LastWill>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("broker address is empty")]
    Empty,
    #[error("unsupported scheme '{0}' (expected tcp:// or mqtt://)")]
    UnsupportedScheme(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Broker endpoint, written as `tcp://host:port`, `mqtt://host:port` or
/// plain `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = match s.split_once("://") {
            Some((scheme, rest)) => {
                if !scheme.eq_ignore_ascii_case("tcp") && !scheme.eq_ignore_ascii_case("mqtt") {
                    return Err(AddressError::UnsupportedScheme(scheme.to_string()));
                }
                rest
            }
            None => s,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return Err(AddressError::Empty);
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}
