use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vehiclesim::VehicleState;

use super::topics::Topics;
use super::types::{MqttPublish, Qos};

/// One telemetry frame on the per-vehicle topic. `time` is epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorMessage {
    pub vehicle_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub kmh: f64,
    pub rpm: u32,
    pub gear: u8,
    pub running: bool,
}

impl From<&VehicleState> for SensorMessage {
    fn from(s: &VehicleState) -> Self {
        Self {
            vehicle_id: s.vehicle_id.clone(),
            time: s.timestamp,
            latitude: s.position.latitude(),
            longitude: s.position.longitude(),
            kmh: s.speed_kmh,
            rpm: s.rpm,
            gear: s.gear,
            running: s.running,
        }
    }
}

impl SensorMessage {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn to_mqtt(&self, topics: &Topics, qos: Qos) -> serde_json::Result<MqttPublish> {
        Ok(MqttPublish {
            topic: topics.telemetry(&self.vehicle_id),
            payload: self.to_json()?,
            retain: false,
            qos,
        })
    }
}
