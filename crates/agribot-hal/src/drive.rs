//! Differential-drive base built from a left and a right wheel motor.
//!
//! Turning is done in place: the wheels spin in opposite directions.

use std::time::Duration;

use agribot_types::AgriError;
use tracing::debug;

use crate::actuator::{Actuator, Direction};

/// What the base is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseMotion {
    #[default]
    Stopped,
    Forward,
    Backward,
    TurningLeft,
    TurningRight,
}

pub struct DifferentialDrive {
    left: Box<dyn Actuator>,
    right: Box<dyn Actuator>,
    motion: BaseMotion,
}

impl DifferentialDrive {
    pub fn new(left: Box<dyn Actuator>, right: Box<dyn Actuator>) -> Self {
        Self {
            left,
            right,
            motion: BaseMotion::Stopped,
        }
    }

    pub fn motion(&self) -> BaseMotion {
        self.motion
    }

    /// Start a motion and leave it running until the next call.
    pub fn set_motion(&mut self, motion: BaseMotion) -> Result<(), AgriError> {
        let (l, r) = match motion {
            BaseMotion::Stopped => (Direction::Stopped, Direction::Stopped),
            BaseMotion::Forward => (Direction::Forward, Direction::Forward),
            BaseMotion::Backward => (Direction::Reverse, Direction::Reverse),
            BaseMotion::TurningLeft => (Direction::Reverse, Direction::Forward),
            BaseMotion::TurningRight => (Direction::Forward, Direction::Reverse),
        };
        self.left.drive(l)?;
        self.right.drive(r)?;
        debug!(?motion, "base motion");
        self.motion = motion;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), AgriError> {
        self.set_motion(BaseMotion::Stopped)
    }

    /// Run `motion` for `duration`, then stop.
    pub async fn run_for(&mut self, motion: BaseMotion, duration: Duration) -> Result<(), AgriError> {
        self.set_motion(motion)?;
        tokio::time::sleep(duration).await;
        self.stop()
    }
}
