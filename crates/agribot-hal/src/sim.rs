//! In-process simulation of the actuator unit for tests and headless runs.
//!
//! [`SimAxis`] is a one-dimensional kinematic model: motors bound to it set
//! its velocity, and its position is integrated lazily on the tokio clock, so
//! tests running with a paused clock see exact, deterministic travel.
//! [`SimUnit`] wires axes, a pump relay and three range sensors into a full
//! [`ActuatorUnit`] and can serve it over an in-memory duplex stream.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo() {
//! use agribot_hal::sim::SimUnit;
//!
//! let (stream, probe) = SimUnit::new().spawn();
//! // hand `stream` to the protocol client, inspect `probe` in assertions
//! # drop((stream, probe));
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agribot_types::{AgriError, ProximityReadings};
use tokio::io::{BufReader, DuplexStream};
use tokio::time::Instant;
use tracing::warn;

use crate::actuator::{Actuator, Direction};
use crate::camera::{Camera, CameraFrame};
use crate::drive::DifferentialDrive;
use crate::encoder::{Encoder, cm_to_pulses};
use crate::position::PositionController;
use crate::range::{ProximityArray, RangeSensor};
use crate::relay::Relay;
use crate::unit::{ActuatorUnit, UnitConfig};

// ────────────────────────────────────────────────────────────────────────────
// Kinematic axis
// ────────────────────────────────────────────────────────────────────────────

struct AxisModel {
    position_cm: f32,
    velocity_cm_s: f32,
    min_cm: f32,
    max_cm: f32,
    stalled: bool,
    updated: Instant,
}

impl AxisModel {
    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.updated).as_secs_f32();
        if !self.stalled {
            self.position_cm =
                (self.position_cm + self.velocity_cm_s * dt).clamp(self.min_cm, self.max_cm);
        }
        self.updated = now;
    }
}

/// A shared simulated axis.  Clones observe the same axis.
#[derive(Clone)]
pub struct SimAxis {
    inner: Arc<Mutex<AxisModel>>,
}

impl SimAxis {
    /// An axis confined to `[min_cm, max_cm]`, starting at `min_cm`.
    pub fn bounded(min_cm: f32, max_cm: f32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AxisModel {
                position_cm: min_cm,
                velocity_cm_s: 0.0,
                min_cm,
                max_cm,
                stalled: false,
                updated: Instant::now(),
            })),
        }
    }

    /// An axis with no end stops, e.g. a wheel.
    pub fn unbounded() -> Self {
        Self::bounded(f32::MIN, f32::MAX).at(0.0)
    }

    fn at(self, position_cm: f32) -> Self {
        self.lock().position_cm = position_cm;
        self
    }

    fn lock(&self) -> MutexGuard<'_, AxisModel> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn position_cm(&self) -> f32 {
        let mut model = self.lock();
        model.advance();
        model.position_cm
    }

    /// Currently commanded velocity; `0.0` when the motor is stopped.
    pub fn velocity(&self) -> f32 {
        self.lock().velocity_cm_s
    }

    /// A stalled axis keeps its position no matter what the motor does.
    pub fn set_stalled(&self, stalled: bool) {
        let mut model = self.lock();
        model.advance();
        model.stalled = stalled;
    }

    fn set_velocity(&self, velocity_cm_s: f32) {
        let mut model = self.lock();
        model.advance();
        model.velocity_cm_s = velocity_cm_s;
    }

    /// A motor that drives this axis at `speed_cm_s`.
    pub fn motor(&self, id: impl Into<String>, speed_cm_s: f32) -> Box<SimMotor> {
        Box::new(SimMotor {
            id: id.into(),
            axis: self.clone(),
            speed_cm_s,
            direction: Direction::Stopped,
        })
    }

    /// An encoder reading this axis.
    pub fn encoder(&self, id: impl Into<String>, pulses_per_cm: f32) -> Box<SimEncoder> {
        Box::new(SimEncoder {
            id: id.into(),
            axis: self.clone(),
            pulses_per_cm,
            zero_cm: self.position_cm(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stub devices
// ────────────────────────────────────────────────────────────────────────────

pub struct SimMotor {
    id: String,
    axis: SimAxis,
    speed_cm_s: f32,
    direction: Direction,
}

impl Actuator for SimMotor {
    fn id(&self) -> &str {
        &self.id
    }

    fn drive(&mut self, direction: Direction) -> Result<(), AgriError> {
        self.axis.set_velocity(direction.sign() * self.speed_cm_s);
        self.direction = direction;
        Ok(())
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

pub struct SimEncoder {
    id: String,
    axis: SimAxis,
    pulses_per_cm: f32,
    zero_cm: f32,
}

impl Encoder for SimEncoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn pulses(&self) -> Result<i64, AgriError> {
        Ok(cm_to_pulses(
            self.axis.position_cm() - self.zero_cm,
            self.pulses_per_cm,
        ))
    }

    fn reset(&mut self) -> Result<(), AgriError> {
        self.zero_cm = self.axis.position_cm();
        Ok(())
    }
}

/// A simulated relay.  Clones share state, so a test can keep one to
/// observe the relay after handing the other to the unit.
#[derive(Clone)]
pub struct SimRelay {
    id: String,
    state: Arc<AtomicBool>,
}

impl SimRelay {
    pub fn new(id: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            state: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Relay for SimRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_state(&mut self, active: bool) -> Result<(), AgriError> {
        self.state.store(active, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }
}

/// A range sensor whose distance is set by the test.
#[derive(Clone)]
pub struct SimRangeSensor {
    id: String,
    distance_cm: Arc<Mutex<f32>>,
}

impl SimRangeSensor {
    pub fn new(id: impl Into<String>, distance_cm: f32) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            distance_cm: Arc::new(Mutex::new(distance_cm)),
        })
    }

    pub fn set(&self, distance_cm: f32) {
        *self
            .distance_cm
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = distance_cm;
    }
}

impl RangeSensor for SimRangeSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn distance_cm(&mut self) -> Result<f32, AgriError> {
        Ok(*self
            .distance_cm
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

/// A camera that plays back queued frames, then blank 4×4 frames.
pub struct SimCamera {
    id: String,
    frames: VecDeque<CameraFrame>,
}

impl SimCamera {
    pub fn new(id: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            frames: VecDeque::new(),
        })
    }

    /// Queue a frame to be returned by the next capture.
    pub fn with_frame(mut self: Box<Self>, frame: CameraFrame) -> Box<Self> {
        self.frames.push_back(frame);
        self
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<CameraFrame, AgriError> {
        Ok(self
            .frames
            .pop_front()
            .unwrap_or_else(|| CameraFrame::filled(4, 4, [0, 0, 0])))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimUnit builder
// ────────────────────────────────────────────────────────────────────────────

/// Handles onto the simulated hardware behind a [`SimUnit`].
#[derive(Clone)]
pub struct SimProbe {
    pub arm: SimAxis,
    pub lift: SimAxis,
    pub left_wheel: SimAxis,
    pub right_wheel: SimAxis,
    pub pump: SimRelay,
    pub front: SimRangeSensor,
    pub left: SimRangeSensor,
    pub right: SimRangeSensor,
}

impl SimProbe {
    pub fn set_readings(&self, readings: ProximityReadings) {
        self.front.set(readings.front_cm);
        self.left.set(readings.left_cm);
        self.right.set(readings.right_cm);
    }

    /// Signed distance travelled by the base: the mean of both wheels.
    pub fn odometer_cm(&self) -> f32 {
        (self.left_wheel.position_cm() + self.right_wheel.position_cm()) / 2.0
    }
}

/// Builder for a fully simulated [`ActuatorUnit`].
pub struct SimUnit {
    config: UnitConfig,
    readings: ProximityReadings,
    wheel_speed_cm_s: f32,
    lift_speed_cm_s: f32,
}

impl Default for SimUnit {
    fn default() -> Self {
        Self {
            config: UnitConfig::default(),
            readings: ProximityReadings::new(200.0, 200.0, 200.0),
            wheel_speed_cm_s: 10.0,
            lift_speed_cm_s: 10.0,
        }
    }
}

impl SimUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: UnitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_readings(mut self, readings: ProximityReadings) -> Self {
        self.readings = readings;
        self
    }

    pub fn with_wheel_speed(mut self, cm_s: f32) -> Self {
        self.wheel_speed_cm_s = cm_s;
        self
    }

    /// Consume the builder and return the unit plus probes onto its devices.
    pub fn build(self) -> (ActuatorUnit, SimProbe) {
        let arm = SimAxis::bounded(0.0, self.config.arm.travel_limit_cm);
        let lift_range = self.lift_speed_cm_s * self.config.lift_travel.as_secs_f32();
        let lift = SimAxis::bounded(0.0, lift_range);
        let left_wheel = SimAxis::unbounded();
        let right_wheel = SimAxis::unbounded();

        let pump = SimRelay::new("pump");
        let front = SimRangeSensor::new("us_front", self.readings.front_cm);
        let left = SimRangeSensor::new("us_left", self.readings.left_cm);
        let right = SimRangeSensor::new("us_right", self.readings.right_cm);

        let probe = SimProbe {
            arm: arm.clone(),
            lift: lift.clone(),
            left_wheel: left_wheel.clone(),
            right_wheel: right_wheel.clone(),
            pump: pump.as_ref().clone(),
            front: front.as_ref().clone(),
            left: left.as_ref().clone(),
            right: right.as_ref().clone(),
        };

        let controller = PositionController::new(
            arm.motor("arm_z", self.config.arm.speed_cm_s),
            arm.encoder("arm_z_enc", self.config.arm.pulses_per_cm),
            self.config.arm.clone(),
        );
        let base = DifferentialDrive::new(
            left_wheel.motor("left_wheel", self.wheel_speed_cm_s),
            right_wheel.motor("right_wheel", self.wheel_speed_cm_s),
        );
        let unit = ActuatorUnit::new(
            controller,
            lift.motor("lift_y", self.lift_speed_cm_s),
            pump,
            base,
            ProximityArray::new(front, left, right),
            self.config,
        );
        (unit, probe)
    }

    /// Build the unit and serve it on a background task.  The returned
    /// stream is the core's end of the link.
    pub fn spawn(self) -> (DuplexStream, SimProbe) {
        let (unit, probe) = self.build();
        let (core_end, unit_end) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(unit_end);
        tokio::spawn(async move {
            if let Err(e) = unit.serve(BufReader::new(read), write).await {
                warn!(error = %e, "simulated actuator unit stopped");
            }
        });
        (core_end, probe)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
