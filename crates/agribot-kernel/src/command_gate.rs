//! [`CommandGate`] – last stop before a [`MotionCommand`] reaches the link.
//!
//! Every registered [`Rule`] sees the command in order and returns it,
//! possibly clamped, or rejects it.  The first rejection stops evaluation and
//! the command is **not** transmitted.  Out-of-range durations and positions
//! are clamped into the calibrated limits rather than rejected; only values
//! that cannot be interpreted at all (NaN, infinities) are refused.

use agribot_types::{AgriError, CalibrationProfile, MotionCommand};
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

pub trait Rule: Send + Sync {
    /// Name used in rejection messages.
    fn name(&self) -> &str;

    /// Return the command to transmit, or [`AgriError::Rejected`].
    fn apply(&self, command: MotionCommand) -> Result<MotionCommand, AgriError>;
}

// ────────────────────────────────────────────────────────────────────────────
// CommandGate
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use agribot_kernel::command_gate::CommandGate;
/// use agribot_types::{CalibrationProfile, MotionCommand};
///
/// let gate = CommandGate::from_profile(&CalibrationProfile::default());
///
/// let admitted = gate.admit(MotionCommand::ExtendFor { seconds: 60.0 }).unwrap();
/// assert_eq!(admitted, MotionCommand::ExtendFor { seconds: 7.5 });
///
/// assert!(gate.admit(MotionCommand::Spray { seconds: f32::NAN }).is_err());
/// ```
#[derive(Default)]
pub struct CommandGate {
    rules: Vec<Box<dyn Rule>>,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard rule set for a calibration profile.
    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        let mut gate = Self::new();
        gate.add_rule(Box::new(FiniteRule));
        gate.add_rule(Box::new(NonNegativeRule));
        gate.add_rule(Box::new(ArmLimitRule {
            max_extend_s: profile.max_extend_s,
            retract_buffer_s: profile.retract_buffer_s,
            travel_limit_cm: profile.arm_travel_limit_cm,
        }));
        gate.add_rule(Box::new(TravelLimitRule {
            max_travel_s: profile.max_travel_s,
        }));
        gate
    }

    /// Register a new [`Rule`].  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn admit(&self, command: MotionCommand) -> Result<MotionCommand, AgriError> {
        self.rules
            .iter()
            .try_fold(command, |command, rule| rule.apply(command))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// The numeric argument of a command, if it has one.
fn argument(command: &MotionCommand) -> Option<f32> {
    use MotionCommand as C;
    match *command {
        C::MoveForward { seconds: Some(s) }
        | C::MoveBackward { seconds: Some(s) }
        | C::TurnLeft { seconds: Some(s) }
        | C::TurnRight { seconds: Some(s) }
        | C::ExtendFor { seconds: s }
        | C::RetractFor { seconds: s }
        | C::Spray { seconds: s } => Some(s),
        C::ExtendTo { cm } => Some(cm),
        _ => None,
    }
}

/// Replace the numeric argument of a command.
fn with_argument(command: MotionCommand, value: f32) -> MotionCommand {
    use MotionCommand as C;
    match command {
        C::MoveForward { seconds: Some(_) } => C::MoveForward { seconds: Some(value) },
        C::MoveBackward { seconds: Some(_) } => C::MoveBackward { seconds: Some(value) },
        C::TurnLeft { seconds: Some(_) } => C::TurnLeft { seconds: Some(value) },
        C::TurnRight { seconds: Some(_) } => C::TurnRight { seconds: Some(value) },
        C::ExtendFor { .. } => C::ExtendFor { seconds: value },
        C::RetractFor { .. } => C::RetractFor { seconds: value },
        C::Spray { .. } => C::Spray { seconds: value },
        C::ExtendTo { .. } => C::ExtendTo { cm: value },
        other => other,
    }
}

fn clamp_argument(rule: &str, command: MotionCommand, max: f32) -> MotionCommand {
    match argument(&command) {
        Some(v) if v > max => {
            warn!(rule, %command, limit = max, "clamped");
            with_argument(command, max)
        }
        _ => command,
    }
}

/// Refuses NaN and infinite arguments.
pub struct FiniteRule;

impl Rule for FiniteRule {
    fn name(&self) -> &str {
        "finite"
    }

    fn apply(&self, command: MotionCommand) -> Result<MotionCommand, AgriError> {
        match argument(&command) {
            Some(v) if !v.is_finite() => Err(AgriError::Rejected {
                rule: self.name().to_string(),
                details: format!("{command:?} has a non-finite argument"),
            }),
            _ => Ok(command),
        }
    }
}

/// Clamps negative durations and positions to zero.
pub struct NonNegativeRule;

impl Rule for NonNegativeRule {
    fn name(&self) -> &str {
        "non_negative"
    }

    fn apply(&self, command: MotionCommand) -> Result<MotionCommand, AgriError> {
        Ok(match argument(&command) {
            Some(v) if v < 0.0 => {
                warn!(rule = self.name(), ?command, "negative argument clamped to zero");
                with_argument(command, 0.0)
            }
            _ => command,
        })
    }
}

/// Keeps arm commands inside the mechanical envelope.  Retraction may run
/// for the extension limit plus the retract buffer.
pub struct ArmLimitRule {
    pub max_extend_s: f32,
    pub retract_buffer_s: f32,
    pub travel_limit_cm: f32,
}

impl Rule for ArmLimitRule {
    fn name(&self) -> &str {
        "arm_limit"
    }

    fn apply(&self, command: MotionCommand) -> Result<MotionCommand, AgriError> {
        Ok(match command {
            MotionCommand::ExtendFor { .. } => clamp_argument(self.name(), command, self.max_extend_s),
            MotionCommand::RetractFor { .. } => clamp_argument(
                self.name(),
                command,
                self.max_extend_s + self.retract_buffer_s,
            ),
            MotionCommand::ExtendTo { .. } => {
                clamp_argument(self.name(), command, self.travel_limit_cm)
            }
            other => other,
        })
    }
}

/// Caps timed base motion.
pub struct TravelLimitRule {
    pub max_travel_s: f32,
}

impl Rule for TravelLimitRule {
    fn name(&self) -> &str {
        "travel_limit"
    }

    fn apply(&self, command: MotionCommand) -> Result<MotionCommand, AgriError> {
        Ok(if command.is_drive() {
            clamp_argument(self.name(), command, self.max_travel_s)
        } else {
            command
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> CommandGate {
        CommandGate::from_profile(&CalibrationProfile::default())
    }

    #[test]
    fn in_range_commands_pass_unchanged() {
        let g = gate();
        let cmd = MotionCommand::ExtendFor { seconds: 2.99 };
        assert_eq!(g.admit(cmd.clone()).unwrap(), cmd);
        assert_eq!(g.admit(MotionCommand::PumpOff).unwrap(), MotionCommand::PumpOff);
    }

    #[test]
    fn negative_duration_clamped_to_zero() {
        let g = gate();
        assert_eq!(
            g.admit(MotionCommand::MoveBackward { seconds: Some(-0.4) }).unwrap(),
            MotionCommand::MoveBackward { seconds: Some(0.0) }
        );
    }

    #[test]
    fn arm_limits_are_enforced() {
        let g = gate();
        assert_eq!(
            g.admit(MotionCommand::ExtendFor { seconds: 9.0 }).unwrap(),
            MotionCommand::ExtendFor { seconds: 7.5 }
        );
        assert_eq!(
            g.admit(MotionCommand::RetractFor { seconds: 9.0 }).unwrap(),
            MotionCommand::RetractFor { seconds: 8.0 }
        );
        assert_eq!(
            g.admit(MotionCommand::ExtendTo { cm: 30.0 }).unwrap(),
            MotionCommand::ExtendTo { cm: 15.5 }
        );
    }

    #[test]
    fn travel_limit_applies_to_timed_drive_only() {
        let g = gate();
        assert_eq!(
            g.admit(MotionCommand::MoveForward { seconds: Some(12.0) }).unwrap(),
            MotionCommand::MoveForward { seconds: Some(5.0) }
        );
        assert_eq!(
            g.admit(MotionCommand::MoveForward { seconds: None }).unwrap(),
            MotionCommand::MoveForward { seconds: None }
        );
        assert_eq!(
            g.admit(MotionCommand::Spray { seconds: 12.0 }).unwrap(),
            MotionCommand::Spray { seconds: 12.0 }
        );
    }

    #[test]
    fn non_finite_is_rejected_first() {
        let g = gate();
        let result = g.admit(MotionCommand::ExtendTo { cm: f32::INFINITY });
        assert!(matches!(result, Err(AgriError::Rejected { ref rule, .. }) if rule == "finite"));
    }

    #[test]
    fn empty_gate_admits_everything() {
        let g = CommandGate::new();
        let cmd = MotionCommand::ExtendFor { seconds: 999.0 };
        assert_eq!(g.admit(cmd.clone()).unwrap(), cmd);
    }
}
