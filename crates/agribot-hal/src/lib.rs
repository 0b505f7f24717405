//! Hardware abstraction for the actuator unit: motor, relay, encoder, range
//! sensor and camera traits, the arm position controller, the wheeled base,
//! the line-protocol command interpreter and a full in-process simulation.

pub mod actuator;
pub mod camera;
pub mod drive;
pub mod encoder;
pub mod position;
pub mod range;
pub mod relay;
pub mod sim;
pub mod unit;

pub use actuator::{Actuator, Direction};
pub use camera::{Camera, CameraFrame, ImageDirCamera};
pub use drive::{BaseMotion, DifferentialDrive};
pub use encoder::Encoder;
pub use position::{AxisConfig, AxisState, MoveOutcome, PositionController};
pub use range::{ProximityArray, RangeSensor};
pub use relay::{Relay, pulse};
pub use unit::{ActuatorUnit, UnitConfig};
