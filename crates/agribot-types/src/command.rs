//! Wire vocabulary shared by the coordination core and the actuator unit.
//!
//! Outbound commands are `<COMMAND>[:<ARG>[:<ARG>]]\n`, inbound responses are
//! `<STATUS>[:<VALUE>]\n`.  [`MotionCommand`] and [`ActuatorAck`] implement
//! [`Display`][fmt::Display] (encode, without the trailing newline) and
//! [`FromStr`] (decode), so both ends of the link use the same codec.
//!
//! # Example
//!
//! ```
//! use agribot_types::{ActuatorAck, MotionCommand};
//!
//! let cmd = MotionCommand::ExtendFor { seconds: 1.5 };
//! assert_eq!(cmd.to_string(), "ACT:Z_OUT:1.50");
//! assert_eq!("ACT:Z_OUT:1.50".parse::<MotionCommand>().unwrap(), cmd);
//!
//! let ack: ActuatorAck = "POS:6.48".parse().unwrap();
//! assert_eq!(ack, ActuatorAck::Position(6.48));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::AgriError;

// ────────────────────────────────────────────────────────────────────────────
// MotionCommand
// ────────────────────────────────────────────────────────────────────────────

/// A single request to the actuator unit.
///
/// Durations are in seconds and positions in centimetres.  Values are
/// expected to be non-negative and inside the calibration limits by the time
/// a command reaches the link; the command gate in `agribot-kernel` enforces
/// that before transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MotionCommand {
    /// `MOVE_FORWARD[:<s>]` – drive forward, indefinitely or for `seconds`.
    MoveForward { seconds: Option<f32> },
    /// `MOVE_BACKWARD[:<s>]`
    MoveBackward { seconds: Option<f32> },
    /// `MOVE_STOP`
    MoveStop,
    /// `TURN_LEFT[:<s>]` – spin in place to the left.
    TurnLeft { seconds: Option<f32> },
    /// `TURN_RIGHT[:<s>]`
    TurnRight { seconds: Option<f32> },
    /// `ACT:Z_OUT:<s>` – time-based arm extension.
    ExtendFor { seconds: f32 },
    /// `ACT:Z_IN:<s>` – time-based arm retraction.
    RetractFor { seconds: f32 },
    /// `Z_MOVE:<cm>` – closed-loop move to an absolute arm position.
    ExtendTo { cm: f32 },
    /// `Z_HOME` – closed-loop move to zero, then encoder reset.
    ArmHome,
    /// `Z_POS` – read the arm position.
    ArmPosition,
    /// `Z_RESET` – declare the current arm position zero.
    ArmResetEncoder,
    /// `Z_ENC_ON` / `Z_ENC_OFF` – switch the arm between closed-loop and
    /// time-based control.
    SetClosedLoop(bool),
    /// `ACT:Y_DOWN`
    Lower,
    /// `ACT:Y_UP`
    Raise,
    /// `ACT:SPRAY:<s>` – run the pump for `seconds`, then stop it.
    Spray { seconds: f32 },
    /// `PUMP_ON`
    PumpOn,
    /// `PUMP_OFF`
    PumpOff,
    /// `US_GET_DIST` → `DIST:f,l,r`
    ReadProximity,
    /// `US_CHECK` → `OBSTACLE:<code>`
    CheckObstacles,
    /// `AVOID_ON` / `AVOID_OFF` – unit-local avoidance reflex.
    Avoidance(bool),
    /// `AVOID_SET:<cm>`
    SetAvoidanceThreshold { cm: u32 },
    /// `STOP_ALL` – halt every axis and switch the pump off.
    StopAll,
    /// `STATUS` → `OK`
    Status,
    /// `PING` → `PONG`
    Ping,
}

impl MotionCommand {
    /// Wall-clock time the actuator unit spends executing this command
    /// before it can acknowledge it.
    pub fn actuation_time(&self) -> Duration {
        let seconds = match self {
            MotionCommand::MoveForward { seconds: Some(s) }
            | MotionCommand::MoveBackward { seconds: Some(s) }
            | MotionCommand::TurnLeft { seconds: Some(s) }
            | MotionCommand::TurnRight { seconds: Some(s) } => *s,
            MotionCommand::ExtendFor { seconds }
            | MotionCommand::RetractFor { seconds }
            | MotionCommand::Spray { seconds } => *seconds,
            _ => 0.0,
        };
        Duration::from_secs_f32(seconds.max(0.0))
    }

    /// `true` for commands whose completion depends on the arm's closed-loop
    /// controller, so their acknowledgement may be delayed by the controller
    /// timeout.
    pub fn is_closed_loop(&self) -> bool {
        matches!(self, MotionCommand::ExtendTo { .. } | MotionCommand::ArmHome)
    }

    /// `true` for commands that move the wheeled base.
    pub fn is_drive(&self) -> bool {
        matches!(
            self,
            MotionCommand::MoveForward { .. }
                | MotionCommand::MoveBackward { .. }
                | MotionCommand::MoveStop
                | MotionCommand::TurnLeft { .. }
                | MotionCommand::TurnRight { .. }
        )
    }

    /// Whether `ack` is a well-formed answer to this command.
    ///
    /// `ERROR:` is a valid answer to anything; every other status must match
    /// the shape the command family produces.
    pub fn accepts(&self, ack: &ActuatorAck) -> bool {
        match (self, ack) {
            (_, ActuatorAck::Error(_)) => true,
            (MotionCommand::Ping, ActuatorAck::Pong) => true,
            (MotionCommand::Status, ActuatorAck::Ok) => true,
            (MotionCommand::ExtendTo { .. } | MotionCommand::ArmPosition, ActuatorAck::Position(_)) => {
                true
            }
            (MotionCommand::ReadProximity, ActuatorAck::Distances(_)) => true,
            (MotionCommand::CheckObstacles, ActuatorAck::Obstacle(_)) => true,
            (
                MotionCommand::Ping
                | MotionCommand::Status
                | MotionCommand::ExtendTo { .. }
                | MotionCommand::ArmPosition
                | MotionCommand::ReadProximity
                | MotionCommand::CheckObstacles,
                _,
            ) => false,
            (_, ActuatorAck::Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionCommand::MoveForward { seconds } => timed(f, "MOVE_FORWARD", *seconds),
            MotionCommand::MoveBackward { seconds } => timed(f, "MOVE_BACKWARD", *seconds),
            MotionCommand::MoveStop => f.write_str("MOVE_STOP"),
            MotionCommand::TurnLeft { seconds } => timed(f, "TURN_LEFT", *seconds),
            MotionCommand::TurnRight { seconds } => timed(f, "TURN_RIGHT", *seconds),
            MotionCommand::ExtendFor { seconds } => write!(f, "ACT:Z_OUT:{seconds:.2}"),
            MotionCommand::RetractFor { seconds } => write!(f, "ACT:Z_IN:{seconds:.2}"),
            MotionCommand::ExtendTo { cm } => write!(f, "Z_MOVE:{cm:.2}"),
            MotionCommand::ArmHome => f.write_str("Z_HOME"),
            MotionCommand::ArmPosition => f.write_str("Z_POS"),
            MotionCommand::ArmResetEncoder => f.write_str("Z_RESET"),
            MotionCommand::SetClosedLoop(true) => f.write_str("Z_ENC_ON"),
            MotionCommand::SetClosedLoop(false) => f.write_str("Z_ENC_OFF"),
            MotionCommand::Lower => f.write_str("ACT:Y_DOWN"),
            MotionCommand::Raise => f.write_str("ACT:Y_UP"),
            MotionCommand::Spray { seconds } => write!(f, "ACT:SPRAY:{seconds:.2}"),
            MotionCommand::PumpOn => f.write_str("PUMP_ON"),
            MotionCommand::PumpOff => f.write_str("PUMP_OFF"),
            MotionCommand::ReadProximity => f.write_str("US_GET_DIST"),
            MotionCommand::CheckObstacles => f.write_str("US_CHECK"),
            MotionCommand::Avoidance(true) => f.write_str("AVOID_ON"),
            MotionCommand::Avoidance(false) => f.write_str("AVOID_OFF"),
            MotionCommand::SetAvoidanceThreshold { cm } => write!(f, "AVOID_SET:{cm}"),
            MotionCommand::StopAll => f.write_str("STOP_ALL"),
            MotionCommand::Status => f.write_str("STATUS"),
            MotionCommand::Ping => f.write_str("PING"),
        }
    }
}

fn timed(f: &mut fmt::Formatter<'_>, name: &str, seconds: Option<f32>) -> fmt::Result {
    match seconds {
        Some(s) => write!(f, "{name}:{s:.2}"),
        None => f.write_str(name),
    }
}

impl FromStr for MotionCommand {
    type Err = AgriError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let parts: Vec<&str> = line.split(':').collect();
        let cmd = match parts.as_slice() {
            ["MOVE_FORWARD"] => MotionCommand::MoveForward { seconds: None },
            ["MOVE_FORWARD", s] => MotionCommand::MoveForward {
                seconds: Some(non_negative(s)?),
            },
            ["MOVE_BACKWARD"] => MotionCommand::MoveBackward { seconds: None },
            ["MOVE_BACKWARD", s] => MotionCommand::MoveBackward {
                seconds: Some(non_negative(s)?),
            },
            ["MOVE_STOP"] => MotionCommand::MoveStop,
            ["TURN_LEFT"] => MotionCommand::TurnLeft { seconds: None },
            ["TURN_LEFT", s] => MotionCommand::TurnLeft {
                seconds: Some(non_negative(s)?),
            },
            ["TURN_RIGHT"] => MotionCommand::TurnRight { seconds: None },
            ["TURN_RIGHT", s] => MotionCommand::TurnRight {
                seconds: Some(non_negative(s)?),
            },
            ["ACT", "Z_OUT", s] => MotionCommand::ExtendFor {
                seconds: non_negative(s)?,
            },
            ["ACT", "Z_IN", s] => MotionCommand::RetractFor {
                seconds: non_negative(s)?,
            },
            ["Z_MOVE", cm] => MotionCommand::ExtendTo {
                cm: parse_f32(cm)?,
            },
            ["Z_HOME"] => MotionCommand::ArmHome,
            ["Z_POS"] => MotionCommand::ArmPosition,
            ["Z_RESET"] => MotionCommand::ArmResetEncoder,
            ["Z_ENC_ON"] => MotionCommand::SetClosedLoop(true),
            ["Z_ENC_OFF"] => MotionCommand::SetClosedLoop(false),
            ["ACT", "Y_DOWN"] => MotionCommand::Lower,
            ["ACT", "Y_UP"] => MotionCommand::Raise,
            ["ACT", "SPRAY", s] => MotionCommand::Spray {
                seconds: non_negative(s)?,
            },
            ["PUMP_ON"] => MotionCommand::PumpOn,
            ["PUMP_OFF"] => MotionCommand::PumpOff,
            ["US_GET_DIST"] => MotionCommand::ReadProximity,
            ["US_CHECK"] => MotionCommand::CheckObstacles,
            ["AVOID_ON"] => MotionCommand::Avoidance(true),
            ["AVOID_OFF"] => MotionCommand::Avoidance(false),
            ["AVOID_SET", cm] => MotionCommand::SetAvoidanceThreshold {
                cm: cm
                    .parse()
                    .map_err(|_| AgriError::Malformed(format!("invalid threshold '{cm}'")))?,
            },
            ["STOP_ALL"] => MotionCommand::StopAll,
            ["STATUS"] => MotionCommand::Status,
            ["PING"] => MotionCommand::Ping,
            _ => return Err(AgriError::Malformed(format!("Unknown command: {line}"))),
        };
        Ok(cmd)
    }
}

fn parse_f32(raw: &str) -> Result<f32, AgriError> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AgriError::Malformed(format!("invalid number '{raw}'")))
}

fn non_negative(raw: &str) -> Result<f32, AgriError> {
    let v = parse_f32(raw)?;
    if v < 0.0 {
        return Err(AgriError::Malformed(format!("negative duration '{raw}'")));
    }
    Ok(v)
}

// ────────────────────────────────────────────────────────────────────────────
// Proximity
// ────────────────────────────────────────────────────────────────────────────

/// Front/left/right proximity distances in centimetres.
///
/// A reading of `0.0` (or below) means the sensor heard no echo and is
/// treated as clear.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProximityReadings {
    pub front_cm: f32,
    pub left_cm: f32,
    pub right_cm: f32,
}

impl ProximityReadings {
    pub fn new(front_cm: f32, left_cm: f32, right_cm: f32) -> Self {
        Self {
            front_cm,
            left_cm,
            right_cm,
        }
    }

    /// Which directions are closer than `threshold_cm`.
    pub fn occupancy(&self, threshold_cm: f32) -> Occupancy {
        let near = |d: f32| d > 0.0 && d < threshold_cm;
        Occupancy {
            front: near(self.front_cm),
            left: near(self.left_cm),
            right: near(self.right_cm),
        }
    }
}

/// Per-direction obstacle flags.
///
/// [`code`][Self::code] packs them into the `OBSTACLE:<code>` bitmask:
/// front = 1, right = 2, left = 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Occupancy {
    pub front: bool,
    pub left: bool,
    pub right: bool,
}

impl Occupancy {
    pub fn code(&self) -> u8 {
        (self.front as u8) | (self.right as u8) << 1 | (self.left as u8) << 2
    }

    pub fn from_code(code: u8) -> Self {
        Self {
            front: code & 1 != 0,
            right: code & 2 != 0,
            left: code & 4 != 0,
        }
    }

    pub fn is_clear(&self) -> bool {
        !(self.front || self.left || self.right)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ActuatorAck
// ────────────────────────────────────────────────────────────────────────────

/// The actuator unit's single-line answer to one [`MotionCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActuatorAck {
    /// `DONE`
    Done,
    /// `OK` (answer to `STATUS`)
    Ok,
    /// `PONG` (answer to `PING`)
    Pong,
    /// `POS:<cm>`
    Position(f32),
    /// `DIST:<front>,<left>,<right>`
    Distances(ProximityReadings),
    /// `OBSTACLE:<code>`
    Obstacle(u8),
    /// `ERROR:<message>`
    Error(String),
}

impl fmt::Display for ActuatorAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorAck::Done => f.write_str("DONE"),
            ActuatorAck::Ok => f.write_str("OK"),
            ActuatorAck::Pong => f.write_str("PONG"),
            ActuatorAck::Position(cm) => write!(f, "POS:{cm:.2}"),
            ActuatorAck::Distances(r) => {
                write!(f, "DIST:{:.1},{:.1},{:.1}", r.front_cm, r.left_cm, r.right_cm)
            }
            ActuatorAck::Obstacle(code) => write!(f, "OBSTACLE:{code}"),
            ActuatorAck::Error(msg) => write!(f, "ERROR:{msg}"),
        }
    }
}

impl FromStr for ActuatorAck {
    type Err = AgriError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (status, value) = match line.split_once(':') {
            Some((s, v)) => (s, Some(v)),
            None => (line, None),
        };
        let ack = match (status, value) {
            ("DONE", None) => ActuatorAck::Done,
            ("OK", None) => ActuatorAck::Ok,
            ("PONG", None) => ActuatorAck::Pong,
            ("POS", Some(v)) => ActuatorAck::Position(parse_f32(v)?),
            ("DIST", Some(v)) => {
                let values = v
                    .split(',')
                    .map(parse_f32)
                    .collect::<Result<Vec<f32>, _>>()?;
                match values.as_slice() {
                    [front, left, right] => {
                        ActuatorAck::Distances(ProximityReadings::new(*front, *left, *right))
                    }
                    _ => {
                        return Err(AgriError::Malformed(format!(
                            "expected three distances in '{line}'"
                        )));
                    }
                }
            }
            ("OBSTACLE", Some(v)) => ActuatorAck::Obstacle(
                v.trim()
                    .parse()
                    .map_err(|_| AgriError::Malformed(format!("invalid obstacle code '{v}'")))?,
            ),
            ("ERROR", Some(msg)) => ActuatorAck::Error(msg.to_string()),
            _ => return Err(AgriError::Malformed(format!("unrecognised response '{line}'"))),
        };
        Ok(ack)
    }
}
