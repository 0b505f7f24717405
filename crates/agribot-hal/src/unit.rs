//! [`ActuatorUnit`] – the microcontroller side of the serial link.
//!
//! The unit owns every motor, the pump relay and the proximity sensors.  It
//! reads one command line at a time, executes it to completion and answers
//! with exactly one acknowledgement line.  Unrecognised input is answered
//! with `ERROR:Unknown command: <line>` and never executed.
//!
//! While avoidance is enabled the unit also runs a local reflex between
//! commands: if the base is driving forward and something is closer than the
//! avoidance threshold in front, the wheels are stopped.

use std::time::Duration;

use agribot_types::{
    ActuatorAck, AgriError, CalibrationProfile, ControlMode, MotionCommand, ProximityReadings,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::actuator::{Actuator, Direction};
use crate::drive::{BaseMotion, DifferentialDrive};
use crate::position::{AxisConfig, PositionController};
use crate::range::ProximityArray;
use crate::relay::{self, Relay};

/// Static behaviour of the unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitConfig {
    pub arm: AxisConfig,
    pub arm_mode: ControlMode,
    /// How long the spray-head lift runs to go fully down or up.
    pub lift_travel: Duration,
    pub avoidance_threshold_cm: f32,
    pub reflex_period: Duration,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            arm: AxisConfig::default(),
            arm_mode: ControlMode::Timed,
            lift_travel: Duration::from_millis(1000),
            avoidance_threshold_cm: 30.0,
            reflex_period: Duration::from_millis(100),
        }
    }
}

impl UnitConfig {
    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        Self {
            arm: AxisConfig::from_profile(profile),
            arm_mode: profile.arm_control,
            avoidance_threshold_cm: profile.obstacle_threshold_cm,
            reflex_period: Duration::from_millis(profile.arbiter_period_ms),
            ..Self::default()
        }
    }
}

pub struct ActuatorUnit {
    arm: PositionController,
    lift: Box<dyn Actuator>,
    pump: Box<dyn Relay>,
    base: DifferentialDrive,
    proximity: ProximityArray,
    config: UnitConfig,
    avoidance: bool,
    threshold_cm: f32,
}

impl ActuatorUnit {
    pub fn new(
        arm: PositionController,
        lift: Box<dyn Actuator>,
        pump: Box<dyn Relay>,
        base: DifferentialDrive,
        proximity: ProximityArray,
        config: UnitConfig,
    ) -> Self {
        let threshold_cm = config.avoidance_threshold_cm;
        let arm = arm.with_mode(config.arm_mode);
        Self {
            arm,
            lift,
            pump,
            base,
            proximity,
            config,
            avoidance: false,
            threshold_cm,
        }
    }

    pub fn avoidance_enabled(&self) -> bool {
        self.avoidance
    }

    pub fn avoidance_threshold_cm(&self) -> f32 {
        self.threshold_cm
    }

    pub fn arm(&self) -> &PositionController {
        &self.arm
    }

    /// Execute one command to completion.
    pub async fn execute(&mut self, command: &MotionCommand) -> Result<ActuatorAck, AgriError> {
        use MotionCommand as C;

        match *command {
            C::MoveForward { seconds } => self.drive(BaseMotion::Forward, seconds).await?,
            C::MoveBackward { seconds } => self.drive(BaseMotion::Backward, seconds).await?,
            C::TurnLeft { seconds } => self.drive(BaseMotion::TurningLeft, seconds).await?,
            C::TurnRight { seconds } => self.drive(BaseMotion::TurningRight, seconds).await?,
            C::MoveStop => self.base.stop()?,
            C::ExtendFor { seconds } => {
                self.arm.run_for(Direction::Forward, seconds).await?;
            }
            C::RetractFor { seconds } => {
                self.arm.run_for(Direction::Reverse, seconds).await?;
            }
            C::ExtendTo { cm } => return Ok(ActuatorAck::Position(self.arm.move_to(cm).await?)),
            C::ArmHome => self.arm.home().await?,
            C::ArmPosition => return Ok(ActuatorAck::Position(self.arm.position_cm()?)),
            C::ArmResetEncoder => self.arm.reset_position()?,
            C::SetClosedLoop(on) => self.arm.set_mode(if on {
                ControlMode::ClosedLoop
            } else {
                ControlMode::Timed
            }),
            C::Lower => self.run_lift(Direction::Forward).await?,
            C::Raise => self.run_lift(Direction::Reverse).await?,
            C::Spray { seconds } => {
                relay::pulse(self.pump.as_mut(), Duration::from_secs_f32(seconds.max(0.0))).await?;
            }
            C::PumpOn => {
                self.pump.switch(true)?;
            }
            C::PumpOff => {
                self.pump.switch(false)?;
            }
            C::ReadProximity => return Ok(ActuatorAck::Distances(self.proximity.read()?)),
            C::CheckObstacles => {
                let code = self.proximity.read()?.occupancy(self.threshold_cm).code();
                return Ok(ActuatorAck::Obstacle(code));
            }
            C::Avoidance(on) => {
                self.avoidance = on;
                info!(enabled = on, "avoidance reflex");
            }
            C::SetAvoidanceThreshold { cm } => self.threshold_cm = cm as f32,
            C::StopAll => self.stop_all()?,
            C::Status => return Ok(ActuatorAck::Ok),
            C::Ping => return Ok(ActuatorAck::Pong),
        }
        Ok(ActuatorAck::Done)
    }

    async fn drive(&mut self, motion: BaseMotion, seconds: Option<f32>) -> Result<(), AgriError> {
        match seconds {
            Some(s) => {
                self.base
                    .run_for(motion, Duration::from_secs_f32(s.max(0.0)))
                    .await
            }
            None => self.base.set_motion(motion),
        }
    }

    async fn run_lift(&mut self, direction: Direction) -> Result<(), AgriError> {
        self.lift.drive(direction)?;
        tokio::time::sleep(self.config.lift_travel).await;
        self.lift.stop()
    }

    /// Stop every motor, switch the pump off and disable the avoidance
    /// reflex.  All devices are attempted even if one fails.
    pub fn stop_all(&mut self) -> Result<(), AgriError> {
        let results = [
            self.arm.stop(),
            self.lift.stop(),
            self.base.stop(),
            self.pump.set_state(false),
        ];
        self.avoidance = false;
        warn!("all actuators stopped");
        results.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ())
    }

    /// Parse and execute one line, producing the reply.
    pub async fn handle_line(&mut self, line: &str) -> ActuatorAck {
        let command = match line.parse::<MotionCommand>() {
            Ok(c) => c,
            Err(AgriError::Malformed(msg)) => return ActuatorAck::Error(msg),
            Err(e) => return ActuatorAck::Error(e.to_string()),
        };
        debug!(%command, "executing");
        match self.execute(&command).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(%command, error = %e, "command failed");
                ActuatorAck::Error(e.to_string())
            }
        }
    }

    fn reflex_tick(&mut self) {
        if !self.avoidance || self.base.motion() != BaseMotion::Forward {
            return;
        }
        match self.proximity.read() {
            Ok(readings) => {
                if readings.occupancy(self.threshold_cm).front {
                    self.reflex_stop(readings);
                }
            }
            Err(e) => warn!(error = %e, "reflex could not read proximity"),
        }
    }

    fn reflex_stop(&mut self, readings: ProximityReadings) {
        warn!(front_cm = readings.front_cm, "obstacle ahead, reflex stop");
        if let Err(e) = self.base.stop() {
            warn!(error = %e, "reflex stop failed");
        }
    }

    /// Serve the line protocol until the reader reaches end of input.
    ///
    /// # Errors
    ///
    /// Returns [`AgriError::Io`] if reading or writing the stream fails.
    pub async fn serve<R, W>(mut self, reader: R, mut writer: W) -> Result<(), AgriError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut reflex = tokio::time::interval(self.config.reflex_period);
        reflex.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("link closed, actuator unit exiting");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = self.handle_line(&line).await;
                    writer.write_all(format!("{reply}\n").as_bytes()).await?;
                    writer.flush().await?;
                }
                _ = reflex.tick(), if self.avoidance => self.reflex_tick(),
            }
        }
    }
}
