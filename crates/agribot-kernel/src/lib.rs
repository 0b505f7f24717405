//! `agribot-kernel` – Safety & Arbitration
//!
//! It does not plan; it enforces rules and reacts.
//!
//! # Modules
//!
//! - [`arbiter`] – [`ObstacleArbiter`][arbiter::ObstacleArbiter]: the pure
//!   front/left/right decision table and the command plan for each reaction.
//! - [`command_gate`] – [`CommandGate`][command_gate::CommandGate]: a rule
//!   engine every [`MotionCommand`][agribot_types::MotionCommand] passes
//!   through before transmission; clamps arguments into calibrated limits.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: heartbeat deadlines
//!   for the actuator link and the detection feed.

pub mod arbiter;
pub mod command_gate;
pub mod watchdog;

pub use arbiter::{ArbiterConfig, ObstacleArbiter, Reaction, TurnSide, arbitrate};
pub use command_gate::{
    ArmLimitRule, CommandGate, FiniteRule, NonNegativeRule, Rule, TravelLimitRule,
};
pub use watchdog::{ComponentHealth, HealthChange, Watchdog};
