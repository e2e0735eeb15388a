use serde::{Deserialize, Serialize};

use super::topics::Topics;
use super::types::{LastWill, MqttPublish, Qos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusType {
    VehicleReady,
    ConnectionLost,
    VehicleStopped,
}

/// Lifecycle announcement on the shared status topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub vehicle_id: String,
    #[serde(rename = "type")]
    pub kind: StatusType,
    pub message: String,
}

impl StatusMessage {
    pub fn new(vehicle_id: impl Into<String>, kind: StatusType, message: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn ready(vehicle_id: impl Into<String>) -> Self {
        Self::new(vehicle_id, StatusType::VehicleReady, "Vehicle ready")
    }

    pub fn connection_lost(vehicle_id: impl Into<String>) -> Self {
        Self::new(vehicle_id, StatusType::ConnectionLost, "Connection lost")
    }

    pub fn stopped(vehicle_id: impl Into<String>) -> Self {
        Self::new(vehicle_id, StatusType::VehicleStopped, "Vehicle stopped")
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn to_mqtt(&self, topics: &Topics, qos: Qos) -> serde_json::Result<MqttPublish> {
        Ok(MqttPublish {
            topic: topics.status().to_string(),
            payload: self.to_json()?,
            retain: false,
            qos,
        })
    }

    pub fn to_last_will(&self, topics: &Topics, qos: Qos) -> serde_json::Result<LastWill> {
        Ok(LastWill {
            topic: topics.status().to_string(),
            payload: self.to_json()?,
            qos,
            retain: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_flat_camel_case() {
        let msg = StatusMessage::ready("postauto");
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "vehicleId": "postauto",
                "type": "VEHICLE_READY",
                "message": "Vehicle ready",
            })
        );
    }

    #[test]
    fn test_decode_connection_lost() {
        let raw = br#"{"vehicleId":"bus","type":"CONNECTION_LOST","message":"gone"}"#;
        let msg = StatusMessage::from_json(raw).unwrap();
        assert_eq!(msg.kind, StatusType::ConnectionLost);
        assert_eq!(msg.vehicle_id, "bus");
    }

    #[test]
    fn test_status_goes_to_status_topic() {
        let topics = Topics::new("fleet");
        let publish = StatusMessage::stopped("bus").to_mqtt(&topics, Qos::AtMostOnce).unwrap();
        assert_eq!(publish.topic, "fleet");
        assert!(!publish.retain);

        let will = StatusMessage::connection_lost("bus")
            .to_last_will(&topics, Qos::AtMostOnce)
            .unwrap();
        assert_eq!(will.topic, "fleet");
        assert_eq!(
            StatusMessage::from_json(&will.payload).unwrap().kind,
            StatusType::ConnectionLost
        );
    }
}
