//! Generic `Actuator` trait for direction-driven DC motors (wheels, the arm
//! extension screw, the spray-head lift).
//!
//! Drivers implement this trait and are handed to a
//! [`PositionController`][crate::position::PositionController] or the
//! [`DifferentialDrive`][crate::drive::DifferentialDrive].  Duty cycle and
//! PWM details stay inside the driver; the rest of the stack only chooses a
//! direction.

use agribot_types::AgriError;

/// Commanded rotation of a motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Forward,
    Reverse,
    #[default]
    Stopped,
}

impl Direction {
    /// Direction that reduces a signed position error.
    pub fn toward(error: f32) -> Self {
        if error > 0.0 {
            Direction::Forward
        } else if error < 0.0 {
            Direction::Reverse
        } else {
            Direction::Stopped
        }
    }

    pub fn sign(&self) -> f32 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
            Direction::Stopped => 0.0,
        }
    }
}

/// A DC motor driven at a fixed duty cycle in one of two directions.
pub trait Actuator: Send + Sync {
    /// Stable identifier for this motor, e.g. `"arm_z"` or `"left_wheel"`.
    fn id(&self) -> &str;

    /// Start driving in `direction` (or stop for [`Direction::Stopped`]).
    ///
    /// # Errors
    ///
    /// Returns [`AgriError::Hardware`] if the driver refuses the command.
    fn drive(&mut self, direction: Direction) -> Result<(), AgriError>;

    /// The most recently commanded direction.
    fn direction(&self) -> Direction;

    /// Convenience for `drive(Direction::Stopped)`.
    fn stop(&mut self) -> Result<(), AgriError> {
        self.drive(Direction::Stopped)
    }
}
