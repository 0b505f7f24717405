//! `agribot-types` – shared vocabulary for the AgriBot coordination core.
//!
//! Every other crate in the workspace depends on this one and nothing else
//! in the workspace, so the types here are deliberately free of runtime
//! concerns (no channels, no I/O).
//!
//! # Modules
//!
//! - [`command`] – [`MotionCommand`] and [`ActuatorAck`], the line-oriented
//!   wire protocol spoken with the actuator unit.
//! - [`calibration`] – [`CalibrationProfile`], the immutable physical
//!   constants loaded once per mission.
//! - [`mission`] – [`MissionState`] and the [`MissionStatus`] snapshot read by
//!   the management collaborator.

pub mod calibration;
pub mod command;
pub mod mission;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use calibration::{
    CalibrationProfile, CompensationMode, ControlMode, TargetClasses, UnreachablePolicy, Zone,
    ZoneMode, ZoneRatios,
};
pub use command::{ActuatorAck, MotionCommand, Occupancy, ProximityReadings};
pub use mission::{MissionState, MissionStatus};

/// Unified event wrapper for the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "agribot-runtime::mission"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// The mission state machine moved from one state to another.
    MissionTransition { from: MissionState, to: MissionState },
    /// A tracked target finished its treatment cycle.
    TargetTreated { track_id: u64 },
    /// A target was dropped without treatment (skip policy).
    TargetSkipped { track_id: u64, reason: String },
    /// The obstacle arbiter took an action other than "no action".
    ObstacleAvoided { readings: ProximityReadings, action: String },
    /// Every direction is blocked; the platform has been halted.
    FullyBlocked { readings: ProximityReadings },
    /// Liveness check state changed.
    LinkHealth { alive: bool },
    /// A command failed and the mission was aborted.
    MissionFault { command: String, message: String },
    /// Operator- or safety-initiated emergency stop.
    EmergencyStop { reason: String },
}

/// Global error type spanning transport failures, actuator-reported errors,
/// control-loop failures, and configuration problems.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgriError {
    #[error("no response to '{command}' within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("link closed: {0}")]
    LinkClosed(String),

    #[error("link I/O error: {0}")]
    Io(String),

    #[error("actuator rejected '{command}': {message}")]
    Command { command: String, message: String },

    #[error("closed-loop move to {target_cm:.2} cm timed out at {reached_cm:.2} cm")]
    ControlTimeout { target_cm: f32, reached_cm: f32 },

    #[error("position {requested_cm:.2} cm is outside the reachable range [0, {limit_cm:.2}]")]
    Unreachable { requested_cm: f32, limit_cm: f32 },

    #[error("command rejected by rule '{rule}': {details}")]
    Rejected { rule: String, details: String },

    #[error("hardware fault on {component}: {details}")]
    Hardware { component: String, details: String },

    #[error("perception error: {0}")]
    Perception(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("stopped: {0}")]
    Stopped(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AgriError {
    /// `true` for failures of the transport itself (as opposed to a well-formed
    /// refusal by the actuator unit).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AgriError::Timeout { .. }
                | AgriError::Malformed(_)
                | AgriError::LinkClosed(_)
                | AgriError::Io(_)
        )
    }

    /// `true` when the error is a control failure that the unreachable-target
    /// policy may absorb.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            AgriError::ControlTimeout { .. } | AgriError::Unreachable { .. }
        )
    }
}

impl From<std::io::Error> for AgriError {
    fn from(e: std::io::Error) -> Self {
        AgriError::Io(e.to_string())
    }
}
