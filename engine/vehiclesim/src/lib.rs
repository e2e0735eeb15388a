//! Route-following vehicle simulation.
//!
//! Provides:
//! - Validated geographic coordinates with haversine distance and bearing
//! - ITN route loading
//! - A tick-driven motion model with a simple drivetrain
//! - A background simulator that publishes immutable state snapshots
//!
//! # Example
//!
//! ```rust,ignore
//! use vehiclesim::{load_itn_file, SimulatorConfig, VehicleSimulator};
//!
//! let route = load_itn_file("waypoints/karlsruhe.itn")?;
//! let mut sim = VehicleSimulator::new("postauto", route, SimulatorConfig::default());
//! sim.start()?;
//! let state = sim.snapshot();
//! sim.stop().await?;
//! ```

pub mod coordinate;
pub mod kinematics;
pub mod route;
pub mod simulator;
pub mod state;

// Re-exports
pub use coordinate::{Coordinate, CoordinateError};
pub use kinematics::Drivetrain;
pub use route::{list_route_files, load_itn_file, parse_itn, Route, RouteError, Waypoint};
pub use simulator::{SimulatorConfig, SimulatorError, SimulatorResult, VehicleModel, VehicleSimulator};
pub use state::VehicleState;
