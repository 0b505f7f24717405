//! Obstacle arbiter: a pure decision over the three proximity sensors.
//!
//! | front | left | right | reaction |
//! |---|---|---|---|
//! | yes | yes | yes | emergency stop, fully blocked |
//! | yes | yes | no | stop, back off, turn right |
//! | yes | no | any | stop, back off, turn left |
//! | no | yes | no | stop, turn right |
//! | no | no | yes | stop, turn left |
//! | no | yes | yes | none |
//! | no | no | no | none |
//!
//! With both sides occupied and the front clear, turning away from one side
//! turns into the other, so the platform keeps going.

use agribot_types::{CalibrationProfile, MotionCommand, Occupancy, ProximityReadings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Normal operation continues.
    None,
    /// Stop, optionally reverse briefly, then turn toward `turn`.
    Avoid { turn: TurnSide, back_off: bool },
    /// Everything is blocked: stop all actuators.
    EmergencyStop,
}

impl Reaction {
    /// Short label used in events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Reaction::None => "none",
            Reaction::Avoid {
                turn: TurnSide::Left,
                back_off: true,
            } => "back_off_turn_left",
            Reaction::Avoid {
                turn: TurnSide::Right,
                back_off: true,
            } => "back_off_turn_right",
            Reaction::Avoid {
                turn: TurnSide::Left,
                back_off: false,
            } => "turn_left",
            Reaction::Avoid {
                turn: TurnSide::Right,
                back_off: false,
            } => "turn_right",
            Reaction::EmergencyStop => "emergency_stop",
        }
    }
}

/// Decide how to react to the given occupancy.
pub fn arbitrate(o: Occupancy) -> Reaction {
    match (o.front, o.left, o.right) {
        (true, true, true) => Reaction::EmergencyStop,
        (true, true, false) => Reaction::Avoid {
            turn: TurnSide::Right,
            back_off: true,
        },
        (true, false, _) => Reaction::Avoid {
            turn: TurnSide::Left,
            back_off: true,
        },
        (false, true, false) => Reaction::Avoid {
            turn: TurnSide::Right,
            back_off: false,
        },
        (false, false, true) => Reaction::Avoid {
            turn: TurnSide::Left,
            back_off: false,
        },
        (false, true, true) | (false, false, false) => Reaction::None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterConfig {
    pub threshold_cm: f32,
    pub backup_s: f32,
    pub turn_s: f32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            threshold_cm: 30.0,
            backup_s: 0.3,
            turn_s: 0.5,
        }
    }
}

impl ArbiterConfig {
    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        Self {
            threshold_cm: profile.obstacle_threshold_cm,
            backup_s: profile.backup_s,
            turn_s: profile.turn_s,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObstacleArbiter {
    config: ArbiterConfig,
}

impl ObstacleArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn evaluate(&self, readings: &ProximityReadings) -> Reaction {
        arbitrate(readings.occupancy(self.config.threshold_cm))
    }

    /// The command sequence that carries out `reaction`.
    pub fn plan(&self, reaction: Reaction) -> Vec<MotionCommand> {
        match reaction {
            Reaction::None => Vec::new(),
            Reaction::EmergencyStop => vec![MotionCommand::StopAll],
            Reaction::Avoid { turn, back_off } => {
                let mut plan = vec![MotionCommand::MoveStop];
                if back_off {
                    plan.push(MotionCommand::MoveBackward {
                        seconds: Some(self.config.backup_s),
                    });
                }
                let seconds = Some(self.config.turn_s);
                plan.push(match turn {
                    TurnSide::Left => MotionCommand::TurnLeft { seconds },
                    TurnSide::Right => MotionCommand::TurnRight { seconds },
                });
                plan
            }
        }
    }
}
