//! Vehicle motion simulator.
//!
//! [`VehicleModel`] is the pure state machine: one call to [`VehicleModel::tick`]
//! advances the vehicle by one period along its route. [`VehicleSimulator`]
//! drives a model from a background tokio task on a fixed interval and
//! publishes every committed state through a watch channel, so readers
//! always see a whole tick and never wait for one in progress.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::coordinate::Coordinate;
use crate::kinematics::Drivetrain;
use crate::route::Route;
use crate::state::VehicleState;

#[derive(Error, Debug)]
pub enum SimulatorError {
    #[error("simulator for '{0}' is already running")]
    AlreadyRunning(String),
    #[error("simulator for '{0}' is not running")]
    NotRunning(String),
    #[error("tick period must be greater than zero")]
    InvalidPeriod,
    #[error("tick task failed: {0}")]
    TickTask(String),
}

pub type SimulatorResult<T> = Result<T, SimulatorError>;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Wall-clock period between two ticks; also the simulated time step.
    pub tick_period: Duration,
    /// Speed held while there is a waypoint ahead.
    pub cruise_speed_kmh: f64,
    /// Speed gained per simulated second until cruise speed is reached.
    /// Zero or less means the vehicle is at cruise speed immediately.
    pub acceleration_kmh_per_s: f64,
}

impl SimulatorConfig {
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    pub fn with_cruise_speed(mut self, kmh: f64) -> Self {
        self.cruise_speed_kmh = kmh;
        self
    }

    pub fn with_acceleration(mut self, kmh_per_s: f64) -> Self {
        self.acceleration_kmh_per_s = kmh_per_s;
        self
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            cruise_speed_kmh: 50.0,
            acceleration_kmh_per_s: 10.0,
        }
    }
}

/// Route-following motion model without any timing of its own.
#[derive(Debug, Clone)]
pub struct VehicleModel {
    route: Route,
    config: SimulatorConfig,
    state: VehicleState,
}

impl VehicleModel {
    pub fn new(vehicle_id: impl Into<String>, route: Route, config: SimulatorConfig) -> Self {
        let start = route.get(0).unwrap_or_else(Coordinate::origin);
        let mut state = VehicleState::parked(vehicle_id, start);
        state.heading_degrees = heading_towards(&start, route.get(1));

        Self {
            route,
            config,
            state,
        }
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Next waypoint ahead, `None` once the last one has been reached.
    pub fn target(&self) -> Option<Coordinate> {
        self.route.get(self.state.route_index + 1)
    }

    pub fn at_route_end(&self) -> bool {
        self.target().is_none()
    }

    pub fn set_running(&mut self, running: bool) {
        self.state.running = running;
    }

    /// Advance by one tick period and return the new state.
    pub fn tick(&mut self, now: DateTime<Utc>) -> &VehicleState {
        if let Some(target) = self.target() {
            let speed = self.next_speed();
            let step_km = speed * self.config.tick_period.as_secs_f64() / 3600.0;
            let remaining_km = self.state.position.distance_km(&target);

            if remaining_km <= step_km {
                self.state.position = target;
                self.state.route_index += 1;
                debug!(
                    vehicle = %self.state.vehicle_id,
                    waypoint = self.state.route_index,
                    "reached waypoint"
                );
            } else {
                // remaining_km > step_km >= 0 here
                self.state.position = self
                    .state
                    .position
                    .interpolate(&target, step_km / remaining_km);
            }
            self.state.speed_kmh = speed;
        }

        let next = self.target();
        if next.is_none() {
            self.state.speed_kmh = 0.0;
        }
        self.state.heading_degrees = heading_towards(&self.state.position, next);

        let drivetrain = Drivetrain::for_speed(self.state.speed_kmh);
        self.state.gear = drivetrain.gear;
        self.state.rpm = drivetrain.rpm;
        self.state.timestamp = now;

        &self.state
    }

    fn next_speed(&self) -> f64 {
        let cruise = self.config.cruise_speed_kmh.max(0.0);
        let accel = self.config.acceleration_kmh_per_s;
        if accel.is_nan() || accel <= 0.0 {
            return cruise;
        }
        let gained = accel * self.config.tick_period.as_secs_f64();
        (self.state.speed_kmh + gained).min(cruise)
    }
}

fn heading_towards(from: &Coordinate, target: Option<Coordinate>) -> f64 {
    target.map(|t| from.bearing_to(&t)).unwrap_or(0.0)
}

struct TickWorker {
    cancel: CancellationToken,
    join: JoinHandle<VehicleModel>,
}

enum Phase {
    Idle(VehicleModel),
    Running(TickWorker),
    Failed,
}

/// Runs a [`VehicleModel`] on a periodic background task.
pub struct VehicleSimulator {
    vehicle_id: String,
    state_tx: Arc<watch::Sender<VehicleState>>,
    phase: Phase,
}

impl VehicleSimulator {
    pub fn new(vehicle_id: impl Into<String>, route: Route, config: SimulatorConfig) -> Self {
        Self::from_model(VehicleModel::new(vehicle_id, route, config))
    }

    pub fn from_model(model: VehicleModel) -> Self {
        let (state_tx, _) = watch::channel(model.state().clone());
        Self {
            vehicle_id: model.state().vehicle_id.clone(),
            state_tx: Arc::new(state_tx),
            phase: Phase::Idle(model),
        }
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running(_))
    }

    /// Copy of the most recently committed state.
    pub fn snapshot(&self) -> VehicleState {
        self.state_tx.borrow().clone()
    }

    /// Receiver that is notified on every committed tick.
    pub fn subscribe(&self) -> watch::Receiver<VehicleState> {
        self.state_tx.subscribe()
    }

    /// Spawn the tick task. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> SimulatorResult<()> {
        let mut model = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Idle(model) => model,
            Phase::Running(worker) => {
                self.phase = Phase::Running(worker);
                return Err(SimulatorError::AlreadyRunning(self.vehicle_id.clone()));
            }
            Phase::Failed => {
                return Err(SimulatorError::TickTask(
                    "a previous tick task did not finish cleanly".to_string(),
                ))
            }
        };

        let period = model.config().tick_period;
        if period.is_zero() {
            self.phase = Phase::Idle(model);
            return Err(SimulatorError::InvalidPeriod);
        }

        model.set_running(true);
        self.state_tx.send_replace(model.state().clone());

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let state_tx = self.state_tx.clone();

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let state = model.tick(Utc::now()).clone();
                        trace!(
                            vehicle = %state.vehicle_id,
                            lat = state.position.latitude(),
                            lon = state.position.longitude(),
                            kmh = state.speed_kmh,
                            "tick"
                        );
                        state_tx.send_replace(state);
                    }
                }
            }
            model
        });

        info!(vehicle = %self.vehicle_id, ?period, "simulator started");
        self.phase = Phase::Running(TickWorker { cancel, join });
        Ok(())
    }

    /// Cancel the tick task and wait until it has exited. No tick runs after
    /// this returns; the published state then reports `running = false`.
    pub async fn stop(&mut self) -> SimulatorResult<()> {
        let worker = match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Running(worker) => worker,
            other => {
                self.phase = other;
                return Err(SimulatorError::NotRunning(self.vehicle_id.clone()));
            }
        };

        worker.cancel.cancel();
        match worker.join.await {
            Ok(mut model) => {
                model.set_running(false);
                self.state_tx.send_replace(model.state().clone());
                self.phase = Phase::Idle(model);
                info!(vehicle = %self.vehicle_id, "simulator stopped");
                Ok(())
            }
            Err(e) => {
                self.state_tx.send_modify(|s| s.running = false);
                Err(SimulatorError::TickTask(e.to_string()))
            }
        }
    }
}

impl Drop for VehicleSimulator {
    fn drop(&mut self) {
        if let Phase::Running(worker) = &self.phase {
            worker.cancel.cancel();
        }
    }
}
