use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coordinate::Coordinate;
use crate::kinematics::Drivetrain;

/// One committed tick of the simulation. Values are replaced as a whole,
/// never field by field, so every copy a reader holds is self-consistent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    /// Last waypoint reached; the active segment ends at `route_index + 1`.
    pub route_index: usize,
    pub position: Coordinate,
    pub speed_kmh: f64,
    pub heading_degrees: f64,
    pub rpm: u32,
    pub gear: u8,
    pub running: bool,
    pub timestamp: DateTime<Utc>,
}

impl VehicleState {
    /// Stationary, not running, parked at `position`.
    pub fn parked(vehicle_id: impl Into<String>, position: Coordinate) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            route_index: 0,
            position,
            speed_kmh: 0.0,
            heading_degrees: 0.0,
            rpm: Drivetrain::IDLE.rpm,
            gear: Drivetrain::IDLE.gear,
            running: false,
            timestamp: Utc::now(),
        }
    }

    pub fn is_moving(&self) -> bool {
        self.speed_kmh > 0.0
    }
}
