use thiserror::Error;

/// Status topic shared by every vehicle.
pub const DEFAULT_STATUS_TOPIC: &str = "pubsub/vehicles";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VehicleIdError {
    #[error("vehicle id must not be empty")]
    Empty,
    #[error("vehicle id '{0}' contains '{1}', which is not allowed in a topic level")]
    ForbiddenChar(String, char),
}

/// A vehicle id becomes one topic level of the telemetry topic and the MQTT
/// client id, so wildcards, separators and NUL are rejected.
pub fn validate_vehicle_id(id: &str) -> Result<(), VehicleIdError> {
    if id.trim().is_empty() {
        return Err(VehicleIdError::Empty);
    }
    match id.chars().find(|&c| matches!(c, '+' | '#' | '/' | '\0')) {
        Some(c) => Err(VehicleIdError::ForbiddenChar(id.to_string(), c)),
        None => Ok(()),
    }
}

/// Topic layout: lifecycle announcements go to one shared status topic,
/// telemetry to `<status topic>/<vehicle id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    status: String,
}

impl Topics {
    pub fn new(status: impl Into<String>) -> Self {
        let status: String = status.into();
        Self {
            status: status.trim_end_matches('/').to_string(),
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn telemetry(&self, vehicle_id: &str) -> String {
        format!("{}/{}", self.status, vehicle_id)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TOPIC)
    }
}
