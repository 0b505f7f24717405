//! `agribot-runtime` – the coordination core's control plane.
//!
//! Everything that runs concurrently lives here: the mission state machine
//! and the helper tasks that share the actuator link with it.
//!
//! # Modules
//!
//! - [`mission`] – [`Mission`][mission::Mission]: the
//!   Searching → Aligning → … → Resetting cycle, one acknowledged command at a
//!   time, plus the [`MissionHandle`][mission::MissionHandle] used to start,
//!   stop, reset and observe it.
//! - [`dispatch`] – [`Dispatcher`][dispatch::Dispatcher]: command gate,
//!   protocol client and odometer behind one `send`.
//! - [`supervisor`] – [`Coordinator`][supervisor::Coordinator]: spawns the
//!   mission with the obstacle arbiter, liveness and frame intake tasks.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to any OTLP-compatible collector.
//!
//! # Command path
//!
//! Every [`MotionCommand`][agribot_types::MotionCommand] produced here passes
//! through the [`CommandGate`] before it reaches the link.  [`CommandGate`] is
//! re-exported so callers can build custom rule sets without a direct
//! dependency on `agribot-kernel`.

pub mod dispatch;
pub mod mission;
pub mod supervisor;
pub mod telemetry;

pub use dispatch::{Dispatcher, Odometer, Pending};
pub use mission::{Mission, MissionHandle, ObstacleSignal, StopSignal};
pub use supervisor::{Coordinator, CoordinatorConfig};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

pub use agribot_kernel::CommandGate;
