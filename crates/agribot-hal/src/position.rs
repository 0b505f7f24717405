//! Position controller for the arm's extension axis.
//!
//! Two modes share one interface:
//!
//! - [`ControlMode::Timed`]: run the motor for `distance / speed` seconds and
//!   keep a dead-reckoned estimate of where the arm is.
//! - [`ControlMode::ClosedLoop`]: drive toward the target, re-reading the
//!   encoder every poll interval, until the position is within tolerance or
//!   the timeout expires.  The motor is stopped on both outcomes.
//!
//! A move always goes `Idle → Moving → Idle`; how it ended is kept in
//! [`PositionController::last_outcome`].  The controller is driven through
//! `&mut self`, so two moves can never overlap.

use std::time::Duration;

use agribot_types::{AgriError, CalibrationProfile, ControlMode};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::{Actuator, Direction};
use crate::encoder::{Encoder, pulses_to_cm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisState {
    #[default]
    Idle,
    Moving,
}

/// How the most recent move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Reached,
    TimedOut,
    Faulted,
}

/// Physical parameters of one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisConfig {
    pub speed_cm_s: f32,
    pub travel_limit_cm: f32,
    /// Where [`PositionController::home`] parks the axis.
    pub home_cm: f32,
    pub tolerance_cm: f32,
    pub timeout: Duration,
    pub poll: Duration,
    pub pulses_per_cm: f32,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            speed_cm_s: 2.17,
            travel_limit_cm: 15.5,
            home_cm: 0.0,
            tolerance_cm: 0.2,
            timeout: Duration::from_secs(10),
            poll: Duration::from_millis(10),
            pulses_per_cm: 20.0,
        }
    }
}

impl AxisConfig {
    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        Self {
            speed_cm_s: profile.arm_speed_cm_s,
            travel_limit_cm: profile.arm_travel_limit_cm,
            home_cm: profile.arm_home_cm,
            tolerance_cm: profile.closed_loop_tolerance_mm / 10.0,
            timeout: Duration::from_secs_f32(profile.closed_loop_timeout_s.max(0.0)),
            pulses_per_cm: profile.pulses_per_cm,
            ..Self::default()
        }
    }
}

pub struct PositionController {
    motor: Box<dyn Actuator>,
    encoder: Box<dyn Encoder>,
    config: AxisConfig,
    mode: ControlMode,
    state: AxisState,
    last_outcome: Option<MoveOutcome>,
    estimate_cm: f32,
}

impl PositionController {
    pub fn new(motor: Box<dyn Actuator>, encoder: Box<dyn Encoder>, config: AxisConfig) -> Self {
        Self {
            motor,
            encoder,
            config,
            mode: ControlMode::Timed,
            state: AxisState::Idle,
            last_outcome: None,
            estimate_cm: 0.0,
        }
    }

    pub fn with_mode(mut self, mode: ControlMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn id(&self) -> &str {
        self.motor.id()
    }

    pub fn config(&self) -> &AxisConfig {
        &self.config
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    /// Switch between timed and closed-loop control.  Takes effect on the
    /// next move.
    pub fn set_mode(&mut self, mode: ControlMode) {
        if self.mode != mode {
            info!(axis = self.id(), ?mode, "control mode changed");
        }
        self.mode = mode;
    }

    pub fn state(&self) -> AxisState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<MoveOutcome> {
        self.last_outcome
    }

    /// Current position in centimetres from home.  Closed-loop mode reads
    /// the encoder; timed mode reports the dead-reckoned estimate.
    pub fn position_cm(&self) -> Result<f32, AgriError> {
        match self.mode {
            ControlMode::ClosedLoop => self.measured_cm(),
            ControlMode::Timed => Ok(self.estimate_cm),
        }
    }

    fn measured_cm(&self) -> Result<f32, AgriError> {
        Ok(pulses_to_cm(self.encoder.pulses()?, self.config.pulses_per_cm))
    }

    /// Run the motor in `direction` for `seconds`, then stop.
    ///
    /// Returns the position after the move.
    pub async fn run_for(&mut self, direction: Direction, seconds: f32) -> Result<f32, AgriError> {
        let seconds = seconds.max(0.0);
        self.state = AxisState::Moving;
        let driven = self.motor.drive(direction);
        if driven.is_ok() {
            tokio::time::sleep(Duration::from_secs_f32(seconds)).await;
        }
        let stopped = self.motor.stop();
        self.state = AxisState::Idle;
        self.last_outcome = Some(if driven.is_ok() && stopped.is_ok() {
            MoveOutcome::Reached
        } else {
            MoveOutcome::Faulted
        });
        driven?;
        stopped?;

        self.estimate_cm = match self.mode {
            ControlMode::ClosedLoop => self.measured_cm()?,
            ControlMode::Timed => (self.estimate_cm
                + direction.sign() * self.config.speed_cm_s * seconds)
                .clamp(0.0, self.config.travel_limit_cm),
        };
        debug!(axis = self.id(), ?direction, seconds, position_cm = self.estimate_cm, "timed move done");
        Ok(self.estimate_cm)
    }

    /// Move to an absolute position, returning where the axis ended up.
    ///
    /// # Errors
    ///
    /// - [`AgriError::Unreachable`] if `target_cm` is outside
    ///   `[0, travel_limit_cm]`; the motor is not touched.
    /// - [`AgriError::ControlTimeout`] if closed-loop control does not settle
    ///   within the timeout.  The motor has been stopped.
    pub async fn move_to(&mut self, target_cm: f32) -> Result<f32, AgriError> {
        let limit = self.config.travel_limit_cm;
        if !target_cm.is_finite() || !(0.0..=limit).contains(&target_cm) {
            return Err(AgriError::Unreachable {
                requested_cm: target_cm,
                limit_cm: limit,
            });
        }
        match self.mode {
            ControlMode::ClosedLoop => self.closed_loop(target_cm).await,
            ControlMode::Timed => {
                let delta = target_cm - self.estimate_cm;
                if delta.abs() > self.config.tolerance_cm && self.config.speed_cm_s > 0.0 {
                    self.run_for(Direction::toward(delta), delta.abs() / self.config.speed_cm_s)
                        .await?;
                }
                self.estimate_cm = target_cm;
                Ok(target_cm)
            }
        }
    }

    async fn closed_loop(&mut self, target_cm: f32) -> Result<f32, AgriError> {
        self.state = AxisState::Moving;
        let started = Instant::now();
        let result = loop {
            let position = match self.measured_cm() {
                Ok(p) => p,
                Err(e) => break Err(e),
            };
            let error = target_cm - position;
            if error.abs() <= self.config.tolerance_cm {
                break Ok(position);
            }
            if started.elapsed() >= self.config.timeout {
                break Err(AgriError::ControlTimeout {
                    target_cm,
                    reached_cm: position,
                });
            }
            if let Err(e) = self.motor.drive(Direction::toward(error)) {
                break Err(e);
            }
            tokio::time::sleep(self.config.poll).await;
        };
        let stopped = self.motor.stop();
        self.state = AxisState::Idle;

        self.last_outcome = Some(match &result {
            Ok(_) => MoveOutcome::Reached,
            Err(AgriError::ControlTimeout { .. }) => MoveOutcome::TimedOut,
            Err(_) => MoveOutcome::Faulted,
        });
        match &result {
            Ok(position) => debug!(axis = self.id(), target_cm, position, "target reached"),
            Err(e) => warn!(axis = self.id(), target_cm, error = %e, "closed-loop move failed"),
        }

        let position = result?;
        stopped?;
        self.estimate_cm = position;
        Ok(position)
    }

    /// Return to the calibrated home position.  A home at the retracted end
    /// stop also re-zeroes the encoder.
    pub async fn home(&mut self) -> Result<(), AgriError> {
        let home = self.config.home_cm;
        match self.mode {
            ControlMode::ClosedLoop => {
                self.closed_loop(home).await?;
            }
            ControlMode::Timed => {
                let delta = home - self.estimate_cm;
                if delta.abs() > f32::EPSILON && self.config.speed_cm_s > 0.0 {
                    self.run_for(Direction::toward(delta), delta.abs() / self.config.speed_cm_s)
                        .await?;
                }
                self.estimate_cm = home;
            }
        }
        if home <= f32::EPSILON {
            self.reset_position()?;
        }
        Ok(())
    }

    /// Declare the current physical position to be home.
    pub fn reset_position(&mut self) -> Result<(), AgriError> {
        self.encoder.reset()?;
        self.estimate_cm = 0.0;
        Ok(())
    }

    /// Halt the motor immediately.
    pub fn stop(&mut self) -> Result<(), AgriError> {
        self.state = AxisState::Idle;
        self.motor.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimAxis;

    fn controller(axis: &SimAxis, mode: ControlMode) -> PositionController {
        let config = AxisConfig::default();
        PositionController::new(
            axis.motor("arm_z", config.speed_cm_s),
            axis.encoder("arm_z_enc", config.pulses_per_cm),
            config,
        )
        .with_mode(mode)
    }

    #[tokio::test(start_paused = true)]
    async fn closed_loop_settles_within_tolerance() {
        let axis = SimAxis::bounded(0.0, 15.5);
        let mut ctl = controller(&axis, ControlMode::ClosedLoop);

        let reached = ctl.move_to(6.5).await.unwrap();

        assert!((reached - 6.5).abs() <= 0.2);
        assert_eq!(ctl.state(), AxisState::Idle);
        assert_eq!(ctl.last_outcome(), Some(MoveOutcome::Reached));
        assert_eq!(axis.velocity(), 0.0, "motor stopped after success");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_axis_times_out_and_stops() {
        let axis = SimAxis::bounded(0.0, 15.5);
        axis.set_stalled(true);
        let mut ctl = controller(&axis, ControlMode::ClosedLoop);
        let started = Instant::now();

        let err = ctl.move_to(5.0).await.unwrap_err();

        assert!(matches!(err, AgriError::ControlTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(ctl.last_outcome(), Some(MoveOutcome::TimedOut));
        assert_eq!(ctl.state(), AxisState::Idle);
        assert_eq!(axis.velocity(), 0.0, "motor stopped after timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_target_is_rejected_without_motion() {
        let axis = SimAxis::bounded(0.0, 15.5);
        let mut ctl = controller(&axis, ControlMode::ClosedLoop);

        let err = ctl.move_to(20.0).await.unwrap_err();
        assert!(matches!(err, AgriError::Unreachable { .. }));
        let err = ctl.move_to(-1.0).await.unwrap_err();
        assert!(matches!(err, AgriError::Unreachable { .. }));
        assert_eq!(axis.position_cm(), 0.0);
        assert_eq!(ctl.last_outcome(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_mode_falls_back_to_dead_reckoning() {
        let axis = SimAxis::bounded(0.0, 15.5);
        let mut ctl = controller(&axis, ControlMode::Timed);

        let reported = ctl.move_to(4.34).await.unwrap();

        assert!((reported - 4.34).abs() < f32::EPSILON);
        assert!((axis.position_cm() - 4.34).abs() < 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn run_for_updates_estimate_and_clamps() {
        let axis = SimAxis::bounded(0.0, 15.5);
        let mut ctl = controller(&axis, ControlMode::Timed);

        let pos = ctl.run_for(Direction::Forward, 2.0).await.unwrap();
        assert!((pos - 4.34).abs() < 1e-3);

        let pos = ctl.run_for(Direction::Forward, 60.0).await.unwrap();
        assert!((pos - 15.5).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn home_returns_to_zero_and_resets_encoder() {
        let axis = SimAxis::bounded(0.0, 15.5);
        let mut ctl = controller(&axis, ControlMode::ClosedLoop);
        ctl.move_to(8.0).await.unwrap();

        ctl.home().await.unwrap();

        assert!(axis.position_cm().abs() <= 0.2);
        assert!(ctl.position_cm().unwrap().abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn home_parks_at_the_calibrated_position() {
        let profile = CalibrationProfile {
            arm_home_cm: 2.0,
            ..CalibrationProfile::default()
        };
        let config = AxisConfig::from_profile(&profile);
        assert_eq!(config.home_cm, 2.0);

        for mode in [ControlMode::ClosedLoop, ControlMode::Timed] {
            let axis = SimAxis::bounded(0.0, 15.5);
            let mut ctl = PositionController::new(
                axis.motor("arm_z", config.speed_cm_s),
                axis.encoder("arm_z_enc", config.pulses_per_cm),
                config.clone(),
            )
            .with_mode(mode);
            ctl.move_to(8.0).await.unwrap();

            ctl.home().await.unwrap();

            assert!((axis.position_cm() - 2.0).abs() <= 0.2, "{mode:?}");
            assert!((ctl.position_cm().unwrap() - 2.0).abs() <= 0.2, "{mode:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mode_switch_applies_to_next_move() {
        let axis = SimAxis::bounded(0.0, 15.5);
        axis.set_stalled(true);
        let mut ctl = controller(&axis, ControlMode::ClosedLoop);
        ctl.set_mode(ControlMode::Timed);

        // A stalled axis cannot time out in timed mode; the estimate is trusted.
        let reported = ctl.move_to(3.0).await.unwrap();
        assert!((reported - 3.0).abs() < f32::EPSILON);
        assert_eq!(ctl.mode(), ControlMode::Timed);
    }
}
